//! Local record state: attribute values, relationship references and the
//! minimal lifecycle the adapter and session manager drive.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ApiError;
use crate::model::{
    capitalize, AttributeType, ModelMeta, RelationshipKind, EMAIL, PASSWORD, SESSION_TOKEN,
    USERNAME,
};
use crate::query::RelatedQuery;
use crate::serializer::{encode_date, parse_date, truncate_date, NormalizedRecord};

/// A locally held attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Date(DateTime<Utc>),
    Json(serde_json::Value),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Default scalar encoding. Dates become their ISO-8601 string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(encode_date(d)),
            Value::Json(v) => v.clone(),
        }
    }

    /// Decode a normalized JSON value for an attribute of type `ty`.
    pub fn from_json(ty: AttributeType, json: &serde_json::Value) -> Result<Self, ApiError> {
        use serde_json::Value as J;
        Ok(match (ty, json) {
            (_, J::Null) => Value::Null,
            (AttributeType::Date, J::String(s)) => Value::Date(parse_date(s)?),
            (AttributeType::Json, other) => Value::Json(other.clone()),
            (_, J::Bool(b)) => Value::Bool(*b),
            (_, J::Number(n)) => Value::Number(n.clone()),
            (_, J::String(s)) => Value::String(s.clone()),
            (_, other) => Value::Json(other.clone()),
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

/// Dates are held at the millisecond precision the wire carries.
impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(truncate_date(d))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A to-one reference to another record, by backend class and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub class_name: String,
    pub id: String,
}

impl RecordRef {
    pub fn new(class_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            id: id.into(),
        }
    }

    /// Reference a saved record. `None` while the record has no id.
    pub fn to(record: &Record) -> Option<Self> {
        record
            .id()
            .map(|id| Self::new(record.meta().parse_class_name(), id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    New,
    Saving,
    Loaded,
    Deleted,
}

/// One typed, identified entity.
#[derive(Debug, Clone)]
pub struct Record {
    meta: Arc<ModelMeta>,
    id: Option<String>,
    attributes: BTreeMap<String, Value>,
    belongs_to: BTreeMap<String, RecordRef>,
    has_many: BTreeMap<String, RelatedQuery>,
    state: RecordState,
    dirty: bool,
}

impl Record {
    /// A new, unsaved record.
    pub fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            id: None,
            attributes: BTreeMap::new(),
            belongs_to: BTreeMap::new(),
            has_many: BTreeMap::new(),
            state: RecordState::New,
            dirty: true,
        }
    }

    /// A record known to exist on the server but not yet loaded.
    pub fn with_id(meta: Arc<ModelMeta>, id: impl Into<String>) -> Self {
        let mut record = Self::new(meta);
        record.id = Some(id.into());
        record.state = RecordState::Loaded;
        record.dirty = false;
        record
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == RecordState::New
    }

    pub fn is_saving(&self) -> bool {
        self.state == RecordState::Saving
    }

    pub fn is_loaded(&self) -> bool {
        self.state == RecordState::Loaded
    }

    pub fn is_deleted(&self) -> bool {
        self.state == RecordState::Deleted
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The attribute value, `Null` when unset.
    pub fn get(&self, key: &str) -> &Value {
        self.attributes.get(key).unwrap_or(&NULL)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).as_str()
    }

    /// Set an attribute and mark the record dirty.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = match value.into() {
            Value::Date(date) => Value::Date(truncate_date(date)),
            other => other,
        };
        self.attributes.insert(key.to_string(), value);
        self.dirty = true;
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn belongs_to(&self, key: &str) -> Option<&RecordRef> {
        self.belongs_to.get(key)
    }

    pub fn set_belongs_to(&mut self, key: &str, target: Option<RecordRef>) {
        match target {
            Some(target) => {
                self.belongs_to.insert(key.to_string(), target);
            }
            None => {
                self.belongs_to.remove(key);
            }
        }
        self.dirty = true;
    }

    /// The deferred query for a to-many relationship, once loaded.
    pub fn has_many(&self, key: &str) -> Option<&RelatedQuery> {
        self.has_many.get(key)
    }

    /// Apply a normalized server hash on top of the local state.
    ///
    /// Keys absent from the hash keep their local values; the record ends up
    /// loaded and clean.
    pub fn load(&mut self, normalized: &NormalizedRecord) -> Result<(), ApiError> {
        let mut attributes = Vec::with_capacity(normalized.attributes.len());
        for (key, json) in &normalized.attributes {
            let ty = self
                .meta
                .attribute(key)
                .map(|a| a.ty)
                .unwrap_or(AttributeType::Json);
            attributes.push((key.clone(), Value::from_json(ty, json)?));
        }
        self.attributes.extend(attributes);

        for (key, target) in &normalized.belongs_to {
            let Some(rel) = self.meta.relationship(key) else {
                continue;
            };
            if rel.kind != RelationshipKind::BelongsTo {
                continue;
            }
            match target {
                Some(id) => {
                    let target = RecordRef::new(capitalize(&rel.related), id.clone());
                    self.belongs_to.insert(key.clone(), target);
                }
                None => {
                    self.belongs_to.remove(key);
                }
            }
        }
        self.has_many
            .extend(normalized.has_many.iter().map(|(k, q)| (k.clone(), q.clone())));

        if let Some(id) = &normalized.id {
            self.id = Some(id.clone());
        }
        self.state = RecordState::Loaded;
        self.dirty = false;
        Ok(())
    }

    pub(crate) fn transition_to(&mut self, state: RecordState) {
        self.state = state;
    }

    /// Drop an attribute without dirtying the record.
    pub(crate) fn discard(&mut self, key: &str) {
        self.attributes.insert(key.to_string(), Value::Null);
    }
}

/// Where a user record stands in the authentication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    ResettingPassword,
}

/// A record of a user-kind type, plus its session flags.
#[derive(Debug, Clone)]
pub struct UserRecord {
    record: Record,
    session_state: SessionState,
    current: bool,
}

impl UserRecord {
    pub fn new(meta: Arc<ModelMeta>) -> Result<Self, ApiError> {
        Self::from_record(Record::new(meta))
    }

    pub fn from_record(record: Record) -> Result<Self, ApiError> {
        if !record.meta().is_user() {
            return Err(ApiError::UnknownType(format!(
                "{} is not a user type",
                record.meta().type_key
            )));
        }
        Ok(Self {
            record,
            session_state: SessionState::Anonymous,
            current: false,
        })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    pub fn id(&self) -> Option<&str> {
        self.record.id()
    }

    pub fn username(&self) -> Option<&str> {
        self.record.get_str(USERNAME)
    }

    pub fn email(&self) -> Option<&str> {
        self.record.get_str(EMAIL)
    }

    pub fn password(&self) -> Option<&str> {
        self.record.get_str(PASSWORD)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.record.get_str(SESSION_TOKEN)
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    /// Whether this record holds the current session.
    pub fn is_current(&self) -> bool {
        self.current
    }

    pub(crate) fn set_session_state(&mut self, state: SessionState) {
        self.session_state = state;
    }

    pub(crate) fn set_current(&mut self, current: bool) {
        self.current = current;
    }
}
