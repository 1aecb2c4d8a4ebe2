//! Record adapter and session manager for the Parse REST API.
//!
//! # Overview
//! Binds locally held records to a Parse-style backend: `ParseAdapter`
//! turns CRUD operations into REST calls, `ParseSerializer` translates
//! between record state and the wire JSON, and `SessionManager` keeps the
//! current user's session token in durable storage and in the
//! `AuthContext` requests are built with.
//!
//! # Design
//! - Host-does-IO at the core: every operation has a `build_*` method
//!   producing an `HttpRequest` and a `parse_*` method consuming the
//!   `HttpResponse`. The async methods run the pair over a `Transport`.
//! - Serialization hooks are an explicit `Serializer` trait.
//! - Updates resolve with the sent hash merged with the backend's partial
//!   response, so callers always see complete state.
//! - Only `SessionManager` writes the `AuthContext` and the stored session.

pub mod adapter;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod path;
pub mod query;
pub mod record;
pub mod serializer;
pub mod session;
pub mod storage;
pub mod transport;

pub use adapter::{merge_update, AuthContext, ParseAdapter};
pub use config::AdapterConfig;
pub use error::ApiError;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use model::{AttributeType, ModelKind, ModelMeta, RelationshipKind, Schema};
pub use path::{resolve_path, PathTarget};
pub use query::{Pointer, RelatedQuery};
pub use record::{Record, RecordRef, RecordState, SessionState, UserRecord, Value};
pub use serializer::{Document, NormalizedRecord, ParseSerializer, RequestType, Serializer};
pub use session::{Credentials, SessionManager};
pub use storage::{FileStorage, MemoryStorage, SessionStorage, StoredSession, SESSION_STORAGE_KEY};
pub use transport::{ReqwestTransport, Transport};
