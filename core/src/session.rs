//! The current-user session: signup, login, logout, password reset and
//! authenticated saves.
//!
//! # Design
//! `SessionManager` is the only writer of the two pieces of session state:
//! the durable `StoredSession` entry and the `AuthContext` every request is
//! built with. Each transition computes everything fallible first, writes
//! storage, and only then updates the in-memory state, all without an await
//! in between, so no request can observe one half of a transition.
//!
//! The user state machine:
//!
//! ```text
//! Anonymous -> Authenticating -> Authenticated | Anonymous
//! Authenticated -> ResettingPassword -> Authenticated
//! Authenticated -> Anonymous              (logout)
//! ```

use std::fmt;

use serde_json::Value;
use tracing::{info, warn};

use crate::adapter::{AuthContext, ParseAdapter};
use crate::error::ApiError;
use crate::http::HttpRequest;
use crate::model::{EMAIL, PASSWORD, SESSION_TOKEN, USERNAME};
use crate::record::{RecordState, SessionState, UserRecord};
use crate::serializer::RequestType;
use crate::storage::{SessionStorage, StoredSession, SESSION_STORAGE_KEY};

/// Signup credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("email", &self.email)
            .finish()
    }
}

pub struct SessionManager<S: SessionStorage> {
    storage: S,
    auth: AuthContext,
}

impl<S: SessionStorage> SessionManager<S> {
    /// Open the manager, restoring the session token of a stored session.
    pub fn new(storage: S) -> Result<Self, ApiError> {
        let mut manager = Self {
            storage,
            auth: AuthContext::anonymous(),
        };
        if let Some(stored) = manager.current_session()? {
            info!(user_id = %stored.user_id, "restored stored session");
            manager.auth.set_session_token(Some(stored.session));
        }
        Ok(manager)
    }

    /// The authentication state requests should be built with.
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The stored session, if any.
    pub fn current_session(&self) -> Result<Option<StoredSession>, ApiError> {
        match self.storage.get(SESSION_STORAGE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ApiError::Storage(format!("corrupt stored session: {e}"))),
            None => Ok(None),
        }
    }

    /// Register `user` with the backend and make it the current session.
    ///
    /// Resolves with the backend's signup response.
    #[tracing::instrument(skip_all, fields(username = %credentials.username))]
    pub async fn sign_up(
        &mut self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
        credentials: Credentials,
    ) -> Result<Value, ApiError> {
        let record = user.record_mut();
        record.set(USERNAME, credentials.username);
        record.set(PASSWORD, credentials.password);
        if let Some(email) = credentials.email {
            record.set(EMAIL, email);
        }

        let request = adapter.build_sign_up(user.record(), &self.auth)?;
        let previous = user.record().state();
        user.record_mut().transition_to(RecordState::Saving);
        self.authenticate(adapter, user, request, RequestType::Create, previous)
            .await
    }

    /// Log in as `username` and make `user` the current session.
    #[tracing::instrument(skip_all, fields(username = %username))]
    pub async fn login(
        &mut self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
        username: &str,
        password: &str,
    ) -> Result<Value, ApiError> {
        user.record_mut().set(USERNAME, username);
        user.record_mut().set(PASSWORD, password);

        let request = adapter.build_login(username, password, &self.auth)?;
        let previous = user.record().state();
        self.authenticate(adapter, user, request, RequestType::Find, previous)
            .await
    }

    async fn authenticate(
        &mut self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
        request: HttpRequest,
        request_type: RequestType,
        previous: RecordState,
    ) -> Result<Value, ApiError> {
        user.set_session_state(SessionState::Authenticating);
        let outcome = match adapter.execute(request).await {
            Ok(response) => adapter.parse_json(response),
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(data) => self.establish(adapter, user, &data, request_type).map(|()| data),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(data) => Ok(data),
            Err(e) => {
                warn!(error = %e, "authentication failed");
                if let Err(clear_err) = self.clear(user) {
                    warn!(error = %clear_err, "could not clear stored session");
                }
                user.record_mut().transition_to(previous);
                Err(e.into_auth_failure())
            }
        }
    }

    /// Commit a successful signup or login.
    fn establish(
        &mut self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
        data: &Value,
        request_type: RequestType,
    ) -> Result<(), ApiError> {
        let normalized = adapter
            .serializer()
            .extract(user.record().meta(), data.clone(), None, request_type)?
            .into_single()?;
        let user_id = normalized.id.clone().ok_or(ApiError::MissingId)?;
        let token = data
            .get(SESSION_TOKEN)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ApiError::Deserialization("response carries no session token".to_string())
            })?
            .to_string();

        let mut loaded = user.record().clone();
        loaded.load(&normalized)?;
        loaded.discard(PASSWORD);

        let stored = StoredSession {
            session: token.clone(),
            user_id: user_id.clone(),
        };
        let encoded =
            serde_json::to_string(&stored).map_err(|e| ApiError::Serialization(e.to_string()))?;
        self.storage.set(SESSION_STORAGE_KEY, &encoded)?;

        *user.record_mut() = loaded;
        self.auth.set_session_token(Some(token));
        user.set_current(true);
        user.set_session_state(SessionState::Authenticated);
        info!(user_id = %user_id, "session established");
        Ok(())
    }

    fn clear(&mut self, user: &mut UserRecord) -> Result<(), ApiError> {
        let removed = self.storage.remove(SESSION_STORAGE_KEY);
        self.auth.set_session_token(None);
        user.set_current(false);
        user.set_session_state(SessionState::Anonymous);
        removed
    }

    /// End the current session locally. No request is made.
    pub fn logout(&mut self, user: &mut UserRecord) -> Result<(), ApiError> {
        self.clear(user)?;
        info!(user_id = ?user.id(), "logged out");
        Ok(())
    }

    /// Ask the backend to email a password reset link.
    ///
    /// Session state is left as it was, whatever the outcome.
    #[tracing::instrument(skip_all)]
    pub async fn request_password_reset(
        &self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
        email: &str,
    ) -> Result<Value, ApiError> {
        let request = adapter.build_password_reset(email, &self.auth)?;
        let previous = user.session_state();
        if previous == SessionState::Authenticated {
            user.set_session_state(SessionState::ResettingPassword);
        }
        let outcome = match adapter.execute(request).await {
            Ok(response) => adapter.parse_json(response),
            Err(e) => Err(e),
        };
        user.set_session_state(previous);
        outcome
    }

    /// Save `user`, authenticated as the session owner when it is the
    /// stored session's user.
    ///
    /// The record's own token wins over the stored one. Without a matching
    /// session the save goes out unauthenticated, even while another user
    /// is signed in.
    #[tracing::instrument(skip_all, fields(id = ?user.id()))]
    pub async fn save(
        &self,
        adapter: &ParseAdapter,
        user: &mut UserRecord,
    ) -> Result<(), ApiError> {
        let auth = match self.current_session()? {
            Some(stored) if user.id() == Some(stored.user_id.as_str()) => {
                let token = user
                    .session_token()
                    .map(str::to_string)
                    .unwrap_or(stored.session);
                AuthContext::with_session(token)
            }
            _ => AuthContext::anonymous(),
        };
        adapter.save_record(user.record_mut(), &auth).await
    }
}
