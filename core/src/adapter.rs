//! Request building, response parsing and the async CRUD operations built
//! from them.
//!
//! # Design
//! Each operation is split into a `build_*` method producing an
//! `HttpRequest` and a `parse_*` method consuming the `HttpResponse`; the
//! async methods run the pair over the adapter's `Transport`. Callers that
//! do their own I/O can use the pairs directly.
//!
//! Authentication state is not held here. Every call takes an
//! `&AuthContext`, which only the session manager can change.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{
    AdapterConfig, APPLICATION_ID_HEADER, REST_API_KEY_HEADER, SESSION_TOKEN_HEADER,
};
use crate::error::ApiError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::model::{ModelMeta, Schema, EMAIL, PASSWORD, USERNAME};
use crate::path::{resolve_path, PathTarget};
use crate::record::{Record, RecordState};
use crate::serializer::{Document, ParseSerializer, RequestType, Serializer};
use crate::transport::Transport;

/// Per-request authentication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    session_token: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_session(token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
        }
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub(crate) fn set_session_token(&mut self, token: Option<String>) {
        self.session_token = token;
    }
}

/// Shallow-merge an update response onto the hash that was sent.
///
/// Response keys win; keys only in `sent` survive.
pub fn merge_update(mut sent: Map<String, Value>, response: Value) -> Map<String, Value> {
    if let Value::Object(response) = response {
        sent.extend(response);
    }
    sent
}

/// Adapter between local records and the backend REST API.
pub struct ParseAdapter {
    config: AdapterConfig,
    schema: Schema,
    serializer: Arc<dyn Serializer>,
    transport: Arc<dyn Transport>,
}

impl ParseAdapter {
    pub fn new(config: AdapterConfig, schema: Schema, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            schema,
            serializer: Arc::new(ParseSerializer),
            transport,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    /// `<host>/<namespace>/<path>[/<id>]`
    pub fn build_url(&self, target: PathTarget<'_>, id: Option<&str>) -> String {
        let path = resolve_path(target, &self.config.classes_path);
        match id {
            Some(id) => format!("{}/{path}/{id}", self.config.base_url()),
            None => format!("{}/{path}", self.config.base_url()),
        }
    }

    /// Credentials headers, plus the session token when one is set.
    pub fn headers(&self, auth: &AuthContext) -> Vec<(String, String)> {
        let mut headers = vec![
            (APPLICATION_ID_HEADER.to_string(), self.config.application_id.clone()),
            (REST_API_KEY_HEADER.to_string(), self.config.rest_api_key.clone()),
        ];
        if let Some(token) = auth.session_token() {
            headers.push((SESSION_TOKEN_HEADER.to_string(), token.to_string()));
        }
        headers
    }

    fn request(
        &self,
        method: HttpMethod,
        target: PathTarget<'_>,
        id: Option<&str>,
        auth: &AuthContext,
        body: Option<&Map<String, Value>>,
    ) -> Result<HttpRequest, ApiError> {
        let mut headers = self.headers(auth);
        let body = match body {
            Some(body) => {
                headers.push(("content-type".to_string(), "application/json".to_string()));
                let encoded = serde_json::to_string(body)
                    .map_err(|e| ApiError::Serialization(e.to_string()))?;
                Some(encoded)
            }
            None => None,
        };
        Ok(HttpRequest {
            method,
            path: self.build_url(target, id),
            query: Vec::new(),
            headers,
            body,
        })
    }

    pub fn build_find(
        &self,
        meta: &ModelMeta,
        id: &str,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        self.request(HttpMethod::Get, PathTarget::Model(meta), Some(id), auth, None)
    }

    pub fn build_find_all(
        &self,
        meta: &ModelMeta,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        self.request(HttpMethod::Get, PathTarget::Model(meta), None, auth, None)
    }

    /// GET with a `where` constraint encoded as a JSON query parameter.
    pub fn build_find_query(
        &self,
        meta: &ModelMeta,
        constraint: &Value,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        let mut request = self.request(HttpMethod::Get, PathTarget::Model(meta), None, auth, None)?;
        request.query.push(("where".to_string(), constraint.to_string()));
        Ok(request)
    }

    pub fn build_create(
        &self,
        record: &Record,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        let body = self.serializer.serialize(record);
        self.request(HttpMethod::Post, PathTarget::Model(record.meta()), None, auth, Some(&body))
    }

    /// PUT the record's full serialized state; also returns the sent hash,
    /// which `parse_update` merges the response onto.
    pub fn build_update(
        &self,
        record: &Record,
        auth: &AuthContext,
    ) -> Result<(HttpRequest, Map<String, Value>), ApiError> {
        let id = record.id().ok_or(ApiError::MissingId)?;
        let mut sent = Map::new();
        self.serializer.serialize_into_hash(&mut sent, record);
        let target = PathTarget::Model(record.meta());
        let request = self.request(HttpMethod::Put, target, Some(id), auth, Some(&sent))?;
        Ok((request, sent))
    }

    pub fn build_delete(
        &self,
        meta: &ModelMeta,
        id: &str,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        self.request(HttpMethod::Delete, PathTarget::Model(meta), Some(id), auth, None)
    }

    /// POST the user's serialized state to the signup endpoint.
    pub fn build_sign_up(
        &self,
        user: &Record,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        self.build_create(user, auth)
    }

    /// The login endpoint is a GET; credentials go in the query string.
    pub fn build_login(
        &self,
        username: &str,
        password: &str,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        let mut request = self.request(HttpMethod::Get, PathTarget::Login, None, auth, None)?;
        request.query.push((USERNAME.to_string(), username.to_string()));
        request.query.push((PASSWORD.to_string(), password.to_string()));
        Ok(request)
    }

    pub fn build_password_reset(
        &self,
        email: &str,
        auth: &AuthContext,
    ) -> Result<HttpRequest, ApiError> {
        let mut body = Map::new();
        body.insert(EMAIL.to_string(), Value::String(email.to_string()));
        self.request(HttpMethod::Post, PathTarget::PasswordReset, None, auth, Some(&body))
    }

    /// Decode a 2xx body as JSON; an empty body reads as `{}`.
    pub fn parse_json(&self, response: HttpResponse) -> Result<Value, ApiError> {
        check_status(&response)?;
        if response.body.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    pub fn parse_find(
        &self,
        meta: &ModelMeta,
        id: &str,
        response: HttpResponse,
    ) -> Result<Document, ApiError> {
        let payload = self.parse_json(response)?;
        self.serializer.extract(meta, payload, Some(id), RequestType::Find)
    }

    pub fn parse_find_all(
        &self,
        meta: &ModelMeta,
        response: HttpResponse,
    ) -> Result<Document, ApiError> {
        let payload = self.parse_json(response)?;
        self.serializer.extract(meta, payload, None, RequestType::FindAll)
    }

    pub fn parse_find_query(
        &self,
        meta: &ModelMeta,
        response: HttpResponse,
    ) -> Result<Document, ApiError> {
        let payload = self.parse_json(response)?;
        self.serializer.extract(meta, payload, None, RequestType::FindQuery)
    }

    pub fn parse_create(
        &self,
        meta: &ModelMeta,
        response: HttpResponse,
    ) -> Result<Document, ApiError> {
        let payload = self.parse_json(response)?;
        self.serializer.extract(meta, payload, None, RequestType::Create)
    }

    /// Merge the partial update response onto `sent`, then normalize.
    pub fn parse_update(
        &self,
        meta: &ModelMeta,
        id: &str,
        sent: Map<String, Value>,
        response: HttpResponse,
    ) -> Result<Document, ApiError> {
        let payload = self.parse_json(response)?;
        let merged = merge_update(sent, payload);
        self.serializer
            .extract(meta, Value::Object(merged), Some(id), RequestType::Update)
    }

    pub fn parse_delete(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_status(&response)
    }

    pub(crate) async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        debug!(method = request.method.as_str(), url = %request.path, "sending request");
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            warn!(status = response.status, "request rejected");
        }
        Ok(response)
    }

    #[tracing::instrument(skip_all, fields(type_key = %meta.type_key, id = %id))]
    pub async fn find(
        &self,
        meta: &ModelMeta,
        id: &str,
        auth: &AuthContext,
    ) -> Result<Document, ApiError> {
        let response = self.execute(self.build_find(meta, id, auth)?).await?;
        self.parse_find(meta, id, response)
    }

    #[tracing::instrument(skip_all, fields(type_key = %meta.type_key))]
    pub async fn find_all(
        &self,
        meta: &ModelMeta,
        auth: &AuthContext,
    ) -> Result<Document, ApiError> {
        let response = self.execute(self.build_find_all(meta, auth)?).await?;
        self.parse_find_all(meta, response)
    }

    #[tracing::instrument(skip_all, fields(type_key = %meta.type_key))]
    pub async fn find_query(
        &self,
        meta: &ModelMeta,
        constraint: &Value,
        auth: &AuthContext,
    ) -> Result<Document, ApiError> {
        let response = self.execute(self.build_find_query(meta, constraint, auth)?).await?;
        self.parse_find_query(meta, response)
    }

    #[tracing::instrument(skip_all, fields(type_key = %record.meta().type_key))]
    pub async fn create(&self, record: &Record, auth: &AuthContext) -> Result<Document, ApiError> {
        let response = self.execute(self.build_create(record, auth)?).await?;
        self.parse_create(record.meta(), response)
    }

    /// Send the full record and resolve with the sent hash merged with the
    /// backend's partial response.
    #[tracing::instrument(skip_all, fields(type_key = %record.meta().type_key, id = ?record.id()))]
    pub async fn update(&self, record: &Record, auth: &AuthContext) -> Result<Document, ApiError> {
        let id = record.id().ok_or(ApiError::MissingId)?;
        let (request, sent) = self.build_update(record, auth)?;
        let response = self.execute(request).await?;
        self.parse_update(record.meta(), id, sent, response)
    }

    #[tracing::instrument(skip_all, fields(type_key = %meta.type_key, id = %id))]
    pub async fn delete(
        &self,
        meta: &ModelMeta,
        id: &str,
        auth: &AuthContext,
    ) -> Result<(), ApiError> {
        let response = self.execute(self.build_delete(meta, id, auth)?).await?;
        self.parse_delete(response)
    }

    /// Create a new record or update a saved one, then load the result.
    ///
    /// On failure the record returns to the state it had before the call.
    pub async fn save_record(
        &self,
        record: &mut Record,
        auth: &AuthContext,
    ) -> Result<(), ApiError> {
        let previous = record.state();
        record.transition_to(RecordState::Saving);
        let result = if previous == RecordState::New {
            self.create(record, auth).await
        } else {
            self.update(record, auth).await
        };
        match result.and_then(Document::into_single) {
            Ok(normalized) => record.load(&normalized),
            Err(e) => {
                record.transition_to(previous);
                Err(e)
            }
        }
    }

    pub async fn delete_record(
        &self,
        record: &mut Record,
        auth: &AuthContext,
    ) -> Result<(), ApiError> {
        let id = record.id().ok_or(ApiError::MissingId)?.to_string();
        self.delete(record.meta(), &id, auth).await?;
        record.transition_to(RecordState::Deleted);
        Ok(())
    }
}

/// Any 2xx is success; everything else is forwarded with its raw body.
fn check_status(response: &HttpResponse) -> Result<(), ApiError> {
    if response.is_success() {
        return Ok(());
    }
    Err(ApiError::Transport {
        status: response.status,
        body: response.body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeType;
    use async_trait::async_trait;
    use serde_json::json;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, ApiError> {
            Err(ApiError::Network("unreachable".into()))
        }
    }

    fn widget_meta() -> Arc<ModelMeta> {
        Arc::new(ModelMeta::object("widget").attr("name", AttributeType::String))
    }

    fn adapter() -> ParseAdapter {
        let config = AdapterConfig::new("app-id", "rest-key").with_host("http://localhost:3000");
        let schema =
            Schema::new().with(ModelMeta::object("widget").attr("name", AttributeType::String));
        ParseAdapter::new(config, schema, Arc::new(Unreachable))
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn merge_update_prefers_response_values() {
        let sent = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let merged = merge_update(sent, json!({"b": 9, "c": 3}));
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 9, "c": 3}));
    }

    #[test]
    fn build_url_for_classes_and_users() {
        let adapter = adapter();
        let meta = widget_meta();
        assert_eq!(
            adapter.build_url(PathTarget::Model(&meta), Some("w1")),
            "http://localhost:3000/1/classes/Widget/w1"
        );
        let user = ModelMeta::user("user");
        assert_eq!(
            adapter.build_url(PathTarget::Model(&user), None),
            "http://localhost:3000/1/users"
        );
        assert_eq!(adapter.build_url(PathTarget::Login, None), "http://localhost:3000/1/login");
    }

    #[test]
    fn headers_include_session_token_only_when_present() {
        let adapter = adapter();
        let anonymous = adapter.headers(&AuthContext::anonymous());
        assert_eq!(
            anonymous,
            vec![
                (APPLICATION_ID_HEADER.to_string(), "app-id".to_string()),
                (REST_API_KEY_HEADER.to_string(), "rest-key".to_string()),
            ]
        );
        let authed = adapter.headers(&AuthContext::with_session("tok"));
        assert!(authed.contains(&(SESSION_TOKEN_HEADER.to_string(), "tok".to_string())));
    }

    #[test]
    fn build_find_is_a_bodyless_get() {
        let req = adapter().build_find(&widget_meta(), "w1", &AuthContext::anonymous()).unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "http://localhost:3000/1/classes/Widget/w1");
        assert!(req.body.is_none());
        assert!(req.header("content-type").is_none());
    }

    #[test]
    fn build_create_posts_serialized_record() {
        let record = Record::new(widget_meta()).with("name", "Sprocket");
        let req = adapter().build_create(&record, &AuthContext::anonymous()).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "http://localhost:3000/1/classes/Widget");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.json_body().unwrap(), json!({"name": "Sprocket"}));
    }

    #[test]
    fn build_update_requires_id() {
        let record = Record::new(widget_meta());
        let err = adapter().build_update(&record, &AuthContext::anonymous()).unwrap_err();
        assert!(matches!(err, ApiError::MissingId));
    }

    #[test]
    fn build_update_returns_sent_hash() {
        let record = Record::with_id(widget_meta(), "w1").with("name", "Cog");
        let (req, sent) = adapter().build_update(&record, &AuthContext::anonymous()).unwrap();
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(req.path, "http://localhost:3000/1/classes/Widget/w1");
        assert_eq!(req.json_body().unwrap(), Value::Object(sent));
    }

    #[test]
    fn build_find_query_encodes_where() {
        let constraint = json!({"name": "Cog"});
        let req = adapter()
            .build_find_query(&widget_meta(), &constraint, &AuthContext::anonymous())
            .unwrap();
        assert_eq!(req.query, vec![("where".to_string(), r#"{"name":"Cog"}"#.to_string())]);
    }

    #[test]
    fn build_login_is_a_get_with_query_credentials() {
        let req = adapter().build_login("clint", "secret", &AuthContext::anonymous()).unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "http://localhost:3000/1/login");
        assert!(req.body.is_none());
        assert_eq!(
            req.query,
            vec![
                ("username".to_string(), "clint".to_string()),
                ("password".to_string(), "secret".to_string()),
            ]
        );
    }

    #[test]
    fn build_password_reset_posts_email() {
        let req = adapter().build_password_reset("a@b.c", &AuthContext::anonymous()).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "http://localhost:3000/1/requestPasswordReset");
        assert_eq!(req.json_body().unwrap(), json!({"email": "a@b.c"}));
    }

    #[test]
    fn parse_update_merges_and_injects_id() {
        let adapter = adapter();
        let sent = json!({"name": "Cog"}).as_object().cloned().unwrap();
        let doc = adapter
            .parse_update(
                &widget_meta(),
                "w1",
                sent,
                response(200, r#"{"updatedAt":"2011-11-07T20:58:34.448Z"}"#),
            )
            .unwrap();
        let record = doc.into_single().unwrap();
        assert_eq!(record.id.as_deref(), Some("w1"));
        assert_eq!(record.attributes["name"], "Cog");
        assert_eq!(record.attributes["updatedAt"], "2011-11-07T20:58:34.448Z");
    }

    #[test]
    fn parse_forwards_raw_error_body() {
        let body = r#"{"code":101,"error":"object not found for get"}"#;
        let err = adapter().parse_find(&widget_meta(), "w1", response(404, body)).unwrap_err();
        match err {
            ApiError::Transport { status, body: raw } => {
                assert_eq!(status, 404);
                assert_eq!(raw, body);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_delete_accepts_empty_body() {
        assert!(adapter().parse_delete(response(200, "{}")).is_ok());
        assert!(adapter().parse_json(response(200, "")).unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn parse_json_rejects_garbage() {
        let err = adapter().parse_json(response(200, "not json")).unwrap_err();
        assert!(matches!(err, ApiError::Deserialization(_)));
    }

    #[tokio::test]
    async fn save_record_restores_state_on_failure() {
        let adapter = adapter();
        let mut record = Record::new(widget_meta()).with("name", "Cog");
        let err = adapter
            .save_record(&mut record, &AuthContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert!(record.is_new());
        assert!(record.is_dirty());
    }
}
