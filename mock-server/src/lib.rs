//! In-memory stand-in for the Parse REST API.
//!
//! Implements the endpoints the adapter talks to under the `/1` namespace,
//! with the backend's response shapes: creates answer `201` with
//! `{objectId, createdAt}`, updates answer only `{updatedAt}`, lists come
//! wrapped in `{results}`, and errors are `{code, error}` objects.
//! To-many relations are stored apart from objects and are queryable with
//! `where={"$relatedTo": ...}`.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const APPLICATION_ID_HEADER: &str = "x-parse-application-id";
pub const SESSION_TOKEN_HEADER: &str = "x-parse-session-token";

const USER_CLASS: &str = "_User";
const RESERVED: [&str; 5] = ["objectId", "createdAt", "updatedAt", "sessionToken", "emailVerified"];

type Object = Map<String, Value>;
/// (owner class, owner id, relation key) -> related object ids.
type RelationKey = (String, String, String);

#[derive(Default)]
pub struct Store {
    classes: HashMap<String, HashMap<String, Object>>,
    relations: HashMap<RelationKey, Vec<String>>,
}

pub type Db = Arc<RwLock<Store>>;

#[derive(Clone)]
pub struct AppState {
    db: Db,
    app_id: Option<String>,
}

type Failure = (StatusCode, Json<Value>);

fn failure(status: StatusCode, code: u32, message: impl Into<String>) -> Failure {
    (status, Json(json!({ "code": code, "error": message.into() })))
}

fn not_found() -> Failure {
    failure(StatusCode::NOT_FOUND, 101, "object not found")
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Router accepting any application id.
pub fn app() -> Router {
    app_with_app_id(None)
}

/// Router rejecting requests whose application id differs from `app_id`.
pub fn app_with_app_id(app_id: Option<String>) -> Router {
    let state = AppState {
        db: Arc::new(RwLock::new(Store::default())),
        app_id,
    };
    Router::new()
        .route("/1/classes/{class}", get(list_objects).post(create_object))
        .route(
            "/1/classes/{class}/{id}",
            get(get_object).put(update_object).delete(delete_object),
        )
        .route("/1/users", get(list_users).post(sign_up))
        .route("/1/users/{id}", get(get_user).put(update_user).delete(delete_user))
        .route("/1/login", get(login))
        .route("/1/requestPasswordReset", post(request_password_reset))
        .layer(middleware::from_fn_with_state(state.clone(), require_app_id))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_app_id(
    listener: TcpListener,
    app_id: Option<String>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_app_id(app_id)).await
}

async fn require_app_id(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let supplied = request
        .headers()
        .get(APPLICATION_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let accepted = match (&state.app_id, supplied) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(expected), Some(supplied)) => expected == supplied,
    };
    if !accepted {
        tracing::warn!(uri = %request.uri(), "rejected request without valid application id");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    next.run(request).await
}

/// Copy client-writable fields onto `object`, routing relation ops aside.
fn apply_fields(store: &mut Store, class: &str, id: &str, object: &mut Object, input: Object) {
    for (key, value) in input {
        if RESERVED.contains(&key.as_str()) {
            continue;
        }
        if value.get("__op").and_then(Value::as_str) == Some("AddRelation") {
            let related = store
                .relations
                .entry((class.to_string(), id.to_string(), key))
                .or_default();
            let ids = value["objects"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|p| p["objectId"].as_str());
            for related_id in ids {
                if !related.iter().any(|r| r == related_id) {
                    related.push(related_id.to_string());
                }
            }
            continue;
        }
        object.insert(key, value);
    }
}

/// The object as returned by reads: no password, no session token.
fn public_view(object: &Object) -> Object {
    let mut view = object.clone();
    view.remove("password");
    view.remove("sessionToken");
    view
}

fn matches(store: &Store, object: &Object, constraint: &Map<String, Value>) -> bool {
    constraint.iter().all(|(key, expected)| {
        if key == "$relatedTo" {
            let owner = &expected["object"];
            let relation_key = (
                owner["className"].as_str().unwrap_or_default().to_string(),
                owner["objectId"].as_str().unwrap_or_default().to_string(),
                expected["key"].as_str().unwrap_or_default().to_string(),
            );
            let id = object.get("objectId").and_then(Value::as_str).unwrap_or_default();
            return store
                .relations
                .get(&relation_key)
                .is_some_and(|ids| ids.iter().any(|r| r == id));
        }
        object.get(key) == Some(expected)
    })
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(rename = "where")]
    constraint: Option<String>,
}

fn list(store: &Store, class: &str, params: &ListParams) -> Result<Json<Value>, Failure> {
    let constraint = match &params.constraint {
        Some(raw) => serde_json::from_str::<Map<String, Value>>(raw)
            .map_err(|_| failure(StatusCode::BAD_REQUEST, 107, "invalid JSON in where"))?,
        None => Map::new(),
    };
    let results: Vec<Value> = store
        .classes
        .get(class)
        .into_iter()
        .flat_map(|objects| objects.values())
        .filter(|object| matches(store, object, &constraint))
        .map(|object| Value::Object(public_view(object)))
        .collect();
    Ok(Json(json!({ "results": results })))
}

fn insert_object(store: &mut Store, class: &str, input: Object) -> Object {
    let id = new_object_id();
    let created_at = now();
    let mut object = Object::new();
    object.insert("objectId".into(), json!(id));
    object.insert("createdAt".into(), json!(created_at));
    object.insert("updatedAt".into(), json!(created_at));
    apply_fields(store, class, &id, &mut object, input);
    store
        .classes
        .entry(class.to_string())
        .or_default()
        .insert(id, object.clone());
    object
}

fn patch_object(
    store: &mut Store,
    class: &str,
    id: &str,
    input: Object,
) -> Result<Json<Value>, Failure> {
    let mut object = store
        .classes
        .get(class)
        .and_then(|objects| objects.get(id))
        .cloned()
        .ok_or_else(not_found)?;
    apply_fields(store, class, id, &mut object, input);
    let updated_at = now();
    object.insert("updatedAt".into(), json!(updated_at));
    store
        .classes
        .entry(class.to_string())
        .or_default()
        .insert(id.to_string(), object);
    Ok(Json(json!({ "updatedAt": updated_at })))
}

fn fetch(store: &Store, class: &str, id: &str) -> Result<Json<Value>, Failure> {
    store
        .classes
        .get(class)
        .and_then(|objects| objects.get(id))
        .map(|object| Json(Value::Object(public_view(object))))
        .ok_or_else(not_found)
}

fn remove(store: &mut Store, class: &str, id: &str) -> Result<Json<Value>, Failure> {
    store
        .classes
        .get_mut(class)
        .and_then(|objects| objects.remove(id))
        .map(|_| Json(json!({})))
        .ok_or_else(not_found)
}

async fn list_objects(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, Failure> {
    list(&*state.db.read().await, &class, &params)
}

async fn create_object(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(input): Json<Object>,
) -> (StatusCode, Json<Value>) {
    let object = insert_object(&mut *state.db.write().await, &class, input);
    (
        StatusCode::CREATED,
        Json(json!({ "objectId": object["objectId"], "createdAt": object["createdAt"] })),
    )
}

async fn get_object(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
) -> Result<Json<Value>, Failure> {
    fetch(&*state.db.read().await, &class, &id)
}

async fn update_object(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
    Json(input): Json<Object>,
) -> Result<Json<Value>, Failure> {
    patch_object(&mut *state.db.write().await, &class, &id, input)
}

async fn delete_object(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
) -> Result<Json<Value>, Failure> {
    remove(&mut *state.db.write().await, &class, &id)
}

async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, Failure> {
    list(&*state.db.read().await, USER_CLASS, &params)
}

fn find_user<'a>(store: &'a Store, field: &str, value: &str) -> Option<&'a Object> {
    store
        .classes
        .get(USER_CLASS)?
        .values()
        .find(|user| user.get(field).and_then(Value::as_str) == Some(value))
}

async fn sign_up(
    State(state): State<AppState>,
    Json(input): Json<Object>,
) -> Result<(StatusCode, Json<Value>), Failure> {
    let username = input
        .get("username")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| failure(StatusCode::BAD_REQUEST, 200, "bad or missing username"))?
        .to_string();
    if input.get("password").and_then(Value::as_str).map_or(true, str::is_empty) {
        return Err(failure(StatusCode::BAD_REQUEST, 201, "password is required"));
    }

    let mut store = state.db.write().await;
    if find_user(&store, "username", &username).is_some() {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            202,
            format!("username {username} already taken"),
        ));
    }

    let token = format!("r:{}", Uuid::new_v4().simple());
    let mut user = insert_object(&mut store, USER_CLASS, input);
    user.insert("sessionToken".into(), json!(token));
    let id = user["objectId"].as_str().unwrap_or_default().to_string();
    store
        .classes
        .entry(USER_CLASS.to_string())
        .or_default()
        .insert(id, user.clone());
    tracing::info!(%username, "user signed up");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "objectId": user["objectId"],
            "createdAt": user["createdAt"],
            "sessionToken": token,
        })),
    ))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Failure> {
    fetch(&*state.db.read().await, USER_CLASS, &id)
}

fn require_session(store: &Store, id: &str, headers: &HeaderMap) -> Result<(), Failure> {
    let user = store
        .classes
        .get(USER_CLASS)
        .and_then(|users| users.get(id))
        .ok_or_else(not_found)?;
    let supplied = headers.get(SESSION_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if supplied.is_some() && user.get("sessionToken").and_then(Value::as_str) == supplied {
        return Ok(());
    }
    Err(failure(
        StatusCode::FORBIDDEN,
        206,
        "user cannot be altered without an authenticated session",
    ))
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<Object>,
) -> Result<Json<Value>, Failure> {
    let mut store = state.db.write().await;
    require_session(&store, &id, &headers)?;
    patch_object(&mut store, USER_CLASS, &id, input)
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, Failure> {
    let mut store = state.db.write().await;
    require_session(&store, &id, &headers)?;
    remove(&mut store, USER_CLASS, &id)
}

#[derive(Deserialize)]
pub struct LoginParams {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Json<Value>, Failure> {
    let store = state.db.read().await;
    let user = find_user(&store, "username", &params.username)
        .filter(|user| {
            user.get("password").and_then(Value::as_str) == Some(params.password.as_str())
        })
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, 101, "invalid login parameters"))?;
    let mut view = public_view(user);
    view.insert("sessionToken".into(), user["sessionToken"].clone());
    Ok(Json(Value::Object(view)))
}

#[derive(Deserialize)]
pub struct ResetRequest {
    email: String,
}

async fn request_password_reset(
    State(state): State<AppState>,
    Json(input): Json<ResetRequest>,
) -> Result<Json<Value>, Failure> {
    let store = state.db.read().await;
    match find_user(&store, "email", &input.email) {
        Some(_) => Ok(Json(json!({}))),
        None => Err(failure(
            StatusCode::BAD_REQUEST,
            205,
            format!("no user found with email {}", input.email),
        )),
    }
}
