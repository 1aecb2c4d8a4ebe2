//! Adapter configuration: backend host, URL prefixes and API credentials.

use serde::Deserialize;

use crate::error::ApiError;

pub const DEFAULT_HOST: &str = "https://api.parse.com";
pub const DEFAULT_NAMESPACE: &str = "1";
pub const DEFAULT_CLASSES_PATH: &str = "classes";

/// Header carrying the application identifier.
pub const APPLICATION_ID_HEADER: &str = "X-Parse-Application-Id";
/// Header carrying the REST API key.
pub const REST_API_KEY_HEADER: &str = "X-Parse-REST-API-Key";
/// Header carrying the session token once a user is logged in.
pub const SESSION_TOKEN_HEADER: &str = "X-Parse-Session-Token";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_classes_path")]
    pub classes_path: String,
    pub application_id: String,
    pub rest_api_key: String,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_classes_path() -> String {
    DEFAULT_CLASSES_PATH.to_string()
}

impl AdapterConfig {
    /// Config against the public backend with default prefixes.
    pub fn new(application_id: impl Into<String>, rest_api_key: impl Into<String>) -> Self {
        Self {
            host: default_host(),
            namespace: default_namespace(),
            classes_path: default_classes_path(),
            application_id: application_id.into(),
            rest_api_key: rest_api_key.into(),
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.trim_end_matches('/').to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.trim_matches('/').to_string();
        self
    }

    /// Loads configuration from the environment.
    ///
    /// `PARSE_APPLICATION_ID` and `PARSE_REST_API_KEY` are required;
    /// `PARSE_HOST` and `PARSE_NAMESPACE` override the defaults.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| ApiError::Config(format!("{key} is not set")))
        };
        let mut config = Self::new(
            required("PARSE_APPLICATION_ID")?,
            required("PARSE_REST_API_KEY")?,
        );
        if let Some(host) = lookup("PARSE_HOST") {
            config = config.with_host(&host);
        }
        if let Some(namespace) = lookup("PARSE_NAMESPACE") {
            config = config.with_namespace(&namespace);
        }
        Ok(config)
    }

    /// `<host>/<namespace>`, the prefix every endpoint URL starts with.
    pub fn base_url(&self) -> String {
        format!("{}/{}", self.host.trim_end_matches('/'), self.namespace)
    }
}
