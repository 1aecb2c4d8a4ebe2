//! Error types for the Parse adapter.
//!
//! # Design
//! The backend's error bodies are forwarded untouched: `Transport` and
//! `AuthenticationFailure` carry the raw status and body, and callers decode
//! them with [`ApiError::payload`] when they want the `{code, error}` object.
//! `AuthenticationFailure` is raised only by signup and login, after the
//! session manager has already cleared the stored session.

/// Errors returned by the adapter, serializer, and session manager.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Signup or login was rejected by the backend.
    #[error("authentication failed (HTTP {status}): {body}")]
    AuthenticationFailure { status: u16, body: String },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A date attribute held a string that could not be parsed.
    #[error("invalid date value: {0}")]
    InvalidDate(String),

    /// No model with this type key is registered in the schema.
    #[error("unknown record type: {0}")]
    UnknownType(String),

    /// The operation needs a server-assigned id and the record has none.
    #[error("record has no id")]
    MissingId,

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// The backend's error body as JSON, when it is JSON.
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Transport { body, .. } | ApiError::AuthenticationFailure { body, .. } => {
                serde_json::from_str(body).ok()
            }
            _ => None,
        }
    }

    /// HTTP status of a backend rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Transport { status, .. } | ApiError::AuthenticationFailure { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Reclassify a backend rejection as an authentication failure.
    pub(crate) fn into_auth_failure(self) -> Self {
        match self {
            ApiError::Transport { status, body } => {
                ApiError::AuthenticationFailure { status, body }
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Deserialization(e.to_string())
    }
}
