//! Wire pointers and the deferred to-many relationship query.

use serde_json::{json, Value};

use crate::adapter::{AuthContext, ParseAdapter};
use crate::error::ApiError;
use crate::serializer::NormalizedRecord;

pub const POINTER_TYPE: &str = "Pointer";

/// `{ "__type": "Pointer", "className": ..., "objectId": ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub class_name: String,
    pub object_id: String,
}

impl Pointer {
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "__type": POINTER_TYPE,
            "className": self.class_name,
            "objectId": self.object_id,
        })
    }

    /// Read a pointer, `None` if `value` is not pointer-shaped.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.get("__type")?.as_str()? != POINTER_TYPE {
            return None;
        }
        Some(Self::new(
            object.get("className")?.as_str()?,
            object.get("objectId")?.as_str()?,
        ))
    }
}

/// All records of `related_type` linked to `owner` under relation `key`.
///
/// Built during normalization and never run there; `execute` issues the
/// request. Each call re-runs the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedQuery {
    pub related_type: String,
    pub owner: Pointer,
    pub key: String,
}

impl RelatedQuery {
    pub fn new(related_type: impl Into<String>, owner: Pointer, key: impl Into<String>) -> Self {
        Self {
            related_type: related_type.into(),
            owner,
            key: key.into(),
        }
    }

    /// The `where` constraint sent to the backend.
    pub fn where_clause(&self) -> Value {
        json!({
            "$relatedTo": {
                "object": self.owner.to_json(),
                "key": self.key,
            }
        })
    }

    /// The full query document, `{ "where": ... }`.
    pub fn to_json(&self) -> Value {
        json!({ "where": self.where_clause() })
    }

    #[tracing::instrument(skip_all, fields(related = %self.related_type, key = %self.key))]
    pub async fn execute(
        &self,
        adapter: &ParseAdapter,
        auth: &AuthContext,
    ) -> Result<Vec<NormalizedRecord>, ApiError> {
        let meta = adapter.schema().get(&self.related_type)?;
        let document = adapter.find_query(&meta, &self.where_clause(), auth).await?;
        Ok(document.into_vec())
    }
}
