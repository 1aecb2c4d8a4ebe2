//! Session scenarios against a transport that records requests and replays
//! canned responses.
//!
//! Each test queues the backend's answers up front, drives the session
//! manager, then checks both what went over the wire and the resulting
//! record, storage and auth state.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parse_adapter::config::SESSION_TOKEN_HEADER;
use parse_adapter::{
    AdapterConfig, ApiError, AttributeType, Credentials, HttpMethod, HttpRequest, HttpResponse,
    MemoryStorage, ModelMeta, ParseAdapter, Record, Schema, SessionManager, SessionState,
    SessionStorage, StoredSession, Transport, UserRecord, SESSION_STORAGE_KEY,
};
use serde_json::json;

const BASE_URL: &str = "http://localhost:3000/1";

#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<HttpRequest>>,
    responses: Mutex<VecDeque<HttpResponse>>,
}

impl Recorder {
    fn reply(&self, status: u16, body: serde_json::Value) {
        self.responses.lock().push_back(HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        });
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    fn last(&self) -> HttpRequest {
        self.requests.lock().last().cloned().expect("no request was sent")
    }
}

#[async_trait]
impl Transport for Recorder {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| ApiError::Network("no canned response".to_string()))
    }
}

fn user_meta() -> Arc<ModelMeta> {
    Arc::new(ModelMeta::user("user").attr("name", AttributeType::String))
}

struct Harness {
    recorder: Arc<Recorder>,
    adapter: ParseAdapter,
    session: SessionManager<MemoryStorage>,
}

fn harness() -> Harness {
    let recorder = Arc::new(Recorder::default());
    let config = AdapterConfig::new("app-id", "rest-key").with_host("http://localhost:3000");
    let schema = Schema::new().with(ModelMeta::user("user").attr("name", AttributeType::String));
    let adapter = ParseAdapter::new(config, schema, recorder.clone());
    let session = SessionManager::new(MemoryStorage::new()).unwrap();
    Harness {
        recorder,
        adapter,
        session,
    }
}

fn stored(h: &Harness) -> Option<StoredSession> {
    h.session.current_session().unwrap()
}

async fn signed_up(h: &mut Harness) -> UserRecord {
    let mut user = UserRecord::new(user_meta()).unwrap();
    h.recorder.reply(
        201,
        json!({
            "createdAt": "2011-11-07T20:58:34.448Z",
            "objectId": "g7y9tkhB7O",
            "sessionToken": "pnktnjyb996sj4p156gjtp4im"
        }),
    );
    h.session
        .sign_up(&h.adapter, &mut user, Credentials::new("clintjhill", "loveyouall"))
        .await
        .unwrap();
    user
}

// ---------------------------------------------------------------------------
// Signup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sign_up_posts_user_and_becomes_current() {
    let mut h = harness();
    let mut user = UserRecord::new(user_meta()).unwrap();
    user.record_mut().set("name", "Clint");
    assert!(user.record().is_new());
    assert!(user.record().is_dirty());

    h.recorder.reply(
        201,
        json!({
            "createdAt": "2011-11-07T20:58:34.448Z",
            "objectId": "g7y9tkhB7O",
            "sessionToken": "pnktnjyb996sj4p156gjtp4im"
        }),
    );
    let data = h
        .session
        .sign_up(&h.adapter, &mut user, Credentials::new("clintjhill", "loveyouall"))
        .await
        .unwrap();
    assert_eq!(data["objectId"], "g7y9tkhB7O");

    let req = h.recorder.last();
    assert_eq!(req.method, HttpMethod::Post);
    assert_eq!(req.path, format!("{BASE_URL}/users"));
    assert_eq!(
        req.json_body().unwrap(),
        json!({
            "username": "clintjhill",
            "password": "loveyouall",
            "name": "Clint",
            "email": null
        })
    );

    assert_eq!(user.id(), Some("g7y9tkhB7O"));
    assert!(user.is_current());
    assert_eq!(user.password(), None);
    assert_eq!(user.session_token(), Some("pnktnjyb996sj4p156gjtp4im"));
    assert_eq!(user.session_state(), SessionState::Authenticated);
    assert!(user.record().is_loaded());
    assert!(!user.record().is_dirty());

    assert_eq!(
        stored(&h),
        Some(StoredSession {
            session: "pnktnjyb996sj4p156gjtp4im".to_string(),
            user_id: "g7y9tkhB7O".to_string(),
        })
    );
    assert_eq!(h.session.auth().session_token(), Some("pnktnjyb996sj4p156gjtp4im"));
}

#[tokio::test]
async fn sign_up_sends_email_when_given() {
    let mut h = harness();
    let mut user = UserRecord::new(user_meta()).unwrap();
    h.recorder.reply(400, json!({"code": 125, "error": "invalid email address"}));
    let _ = h
        .session
        .sign_up(
            &h.adapter,
            &mut user,
            Credentials::new("clint", "pw").with_email("clint@example.com"),
        )
        .await;
    assert_eq!(h.recorder.last().json_body().unwrap()["email"], "clint@example.com");
}

#[tokio::test]
async fn rejected_sign_up_clears_session() {
    let mut h = harness();
    h.session
        .storage()
        .set(SESSION_STORAGE_KEY, r#"{"session":"old","userId":"someone"}"#)
        .unwrap();
    let mut user = UserRecord::new(user_meta()).unwrap();

    h.recorder.reply(400, json!({"code": 202, "error": "username clintjhill already taken"}));
    let err = h
        .session
        .sign_up(&h.adapter, &mut user, Credentials::new("clintjhill", "loveyouall"))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthenticationFailure { status: 400, .. }));
    assert_eq!(err.payload().unwrap()["code"], 202);
    assert!(stored(&h).is_none());
    assert!(!user.is_current());
    assert_eq!(user.session_state(), SessionState::Anonymous);
    assert!(user.record().is_new());
    assert!(h.session.auth().session_token().is_none());
}

#[tokio::test]
async fn sign_up_without_token_in_response_is_not_persisted() {
    let mut h = harness();
    let mut user = UserRecord::new(user_meta()).unwrap();
    h.recorder.reply(201, json!({"objectId": "g7y9tkhB7O"}));
    let err = h
        .session
        .sign_up(&h.adapter, &mut user, Credentials::new("clint", "pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Deserialization(_)));
    assert!(stored(&h).is_none());
    assert!(!user.is_current());
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_uses_get_and_becomes_current() {
    let mut h = harness();
    let mut user = UserRecord::new(user_meta()).unwrap();
    h.recorder.reply(
        200,
        json!({
            "username": "clint",
            "createdAt": "2011-11-07T20:58:34.448Z",
            "updatedAt": "2011-11-07T20:58:34.448Z",
            "objectId": "g7y9tkhB7O",
            "sessionToken": "pnktnjyb996sj4p156gjtp4im"
        }),
    );

    h.session
        .login(&h.adapter, &mut user, "clint", "loveyouall")
        .await
        .unwrap();

    let req = h.recorder.last();
    assert_eq!(req.method, HttpMethod::Get);
    assert_eq!(req.path, format!("{BASE_URL}/login"));
    assert!(req.body.is_none());
    assert!(req.query.contains(&("username".to_string(), "clint".to_string())));

    assert!(user.is_current());
    assert!(user.record().is_loaded());
    assert_eq!(user.password(), None);
    assert_eq!(user.username(), Some("clint"));
    assert!(user.record().get("createdAt").as_date().is_some());
    assert_eq!(stored(&h).unwrap().user_id, "g7y9tkhB7O");
}

#[tokio::test]
async fn failed_login_stays_anonymous() {
    let mut h = harness();
    let mut user = UserRecord::new(user_meta()).unwrap();
    h.recorder.reply(404, json!({"code": 101, "error": "invalid login parameters"}));

    let err = h
        .session
        .login(&h.adapter, &mut user, "clint", "wrong")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthenticationFailure { status: 404, .. }));
    assert!(stored(&h).is_none());
    assert!(!user.is_current());
    assert_eq!(user.session_state(), SessionState::Anonymous);
    assert!(user.record().is_new());
}

// ---------------------------------------------------------------------------
// Logout and password reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logout_clears_session_without_network() {
    let mut h = harness();
    let mut user = signed_up(&mut h).await;
    let sent_before = h.recorder.requests().len();

    h.session.logout(&mut user).unwrap();

    assert_eq!(h.recorder.requests().len(), sent_before);
    assert!(!user.is_current());
    assert!(stored(&h).is_none());
    assert!(h.session.auth().session_token().is_none());
    assert_eq!(user.session_state(), SessionState::Anonymous);
}

#[tokio::test]
async fn password_reset_posts_email_and_leaves_session_alone() {
    let mut h = harness();
    let mut user = signed_up(&mut h).await;
    let sent_before = h.recorder.requests().len();
    let session_before = stored(&h);

    h.recorder.reply(200, json!({}));
    let data = h
        .session
        .request_password_reset(&h.adapter, &mut user, "clint.hill@gmail.com")
        .await
        .unwrap();
    assert_eq!(data, json!({}));

    let requests = h.recorder.requests();
    assert_eq!(requests.len(), sent_before + 1);
    let req = h.recorder.last();
    assert_eq!(req.method, HttpMethod::Post);
    assert_eq!(req.path, format!("{BASE_URL}/requestPasswordReset"));
    assert_eq!(req.json_body().unwrap(), json!({"email": "clint.hill@gmail.com"}));

    assert!(user.is_current());
    assert_eq!(user.session_state(), SessionState::Authenticated);
    assert_eq!(stored(&h), session_before);
}

#[tokio::test]
async fn failed_password_reset_forwards_error_and_leaves_session_alone() {
    let mut h = harness();
    let mut user = signed_up(&mut h).await;
    let session_before = stored(&h);

    h.recorder.reply(400, json!({"code": 205, "error": "no user found with email x@y.z"}));
    let err = h
        .session
        .request_password_reset(&h.adapter, &mut user, "x@y.z")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Transport { status: 400, .. }));
    assert_eq!(err.payload().unwrap()["code"], 205);
    assert!(user.is_current());
    assert_eq!(stored(&h), session_before);
}

// ---------------------------------------------------------------------------
// Save and find
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saving_current_user_sends_session_token_and_merges_response() {
    let mut h = harness();
    let mut user = signed_up(&mut h).await;
    user.record_mut().set("name", "Clint Hill");

    h.recorder.reply(200, json!({"updatedAt": "2011-11-08T10:00:00.000Z"}));
    h.session.save(&h.adapter, &mut user).await.unwrap();

    let req = h.recorder.last();
    assert_eq!(req.method, HttpMethod::Put);
    assert_eq!(req.path, format!("{BASE_URL}/users/g7y9tkhB7O"));
    assert_eq!(req.header(SESSION_TOKEN_HEADER), Some("pnktnjyb996sj4p156gjtp4im"));
    let body = req.json_body().unwrap();
    assert_eq!(body["name"], "Clint Hill");
    assert!(body.get("sessionToken").is_none());
    assert!(body.get("password").is_none());

    assert_eq!(user.id(), Some("g7y9tkhB7O"));
    assert_eq!(user.record().get_str("name"), Some("Clint Hill"));
    assert!(user.record().get("updatedAt").as_date().is_some());
    assert!(!user.record().is_dirty());
}

#[tokio::test]
async fn saving_other_user_goes_out_unauthenticated() {
    let h = harness();
    let mut other = UserRecord::from_record(
        Record::with_id(user_meta(), "someoneElse").with("name", "Other"),
    )
    .unwrap();

    h.recorder.reply(403, json!({"code": 206, "error": "cannot modify user"}));
    let err = h.session.save(&h.adapter, &mut other).await.unwrap_err();

    assert!(matches!(err, ApiError::Transport { status: 403, .. }));
    assert!(h.recorder.last().header(SESSION_TOKEN_HEADER).is_none());
    assert!(other.record().is_loaded());
}

#[tokio::test]
async fn saving_other_user_while_signed_in_omits_session_token() {
    let mut h = harness();
    let me = signed_up(&mut h).await;
    let mut other = UserRecord::from_record(
        Record::with_id(user_meta(), "someoneElse").with("name", "Other"),
    )
    .unwrap();

    h.recorder.reply(403, json!({"code": 206, "error": "cannot modify user"}));
    let err = h.session.save(&h.adapter, &mut other).await.unwrap_err();

    let req = h.recorder.last();
    assert_eq!(req.path, format!("{BASE_URL}/users/someoneElse"));
    assert!(req.header(SESSION_TOKEN_HEADER).is_none());
    assert!(matches!(err, ApiError::Transport { status: 403, .. }));

    assert!(me.is_current());
    assert_eq!(h.session.auth().session_token(), Some("pnktnjyb996sj4p156gjtp4im"));
    assert_eq!(stored(&h).unwrap().user_id, "g7y9tkhB7O");
}

#[tokio::test]
async fn found_user_is_not_current() {
    let h = harness();
    let meta = user_meta();
    h.recorder.reply(
        200,
        json!({
            "createdAt": "2011-11-07T20:58:34.448Z",
            "objectId": "h8mgfgL1yS",
            "username": "clintjhill"
        }),
    );

    let doc = h
        .adapter
        .find(&meta, "h8mgfgL1yS", h.session.auth())
        .await
        .unwrap();
    let mut user =
        UserRecord::from_record(Record::with_id(Arc::clone(&meta), "h8mgfgL1yS")).unwrap();
    user.record_mut().load(&doc.into_single().unwrap()).unwrap();

    assert_eq!(h.recorder.last().path, format!("{BASE_URL}/users/h8mgfgL1yS"));
    assert_eq!(h.recorder.last().method, HttpMethod::Get);
    assert!(user.record().is_loaded());
    assert_eq!(user.username(), Some("clintjhill"));
    assert!(!user.is_current());
}
