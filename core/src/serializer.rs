//! Translation between local records and the backend's JSON wire format.
//!
//! # Design
//! `Serializer` names every hook the adapter calls, with the orchestration
//! (`extract`, `normalize`, `serialize`) provided on top of them.
//! `ParseSerializer` is the strategy for the backend's conventions:
//!
//! - dates travel as `{ "__type": "Date", "iso": ... }` and are normalized
//!   to a canonical ISO-8601 string (UTC, millisecond precision);
//! - to-one relationships travel as pointers and normalize to the bare id;
//! - to-many relationships are never sent, and normalize to a deferred
//!   `$relatedTo` query;
//! - list responses arrive as `{ "results": [...] }`;
//! - server-managed columns are never sent.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{json, Map, Value};

use crate::error::ApiError;
use crate::model::{
    AttributeMeta, AttributeType, ModelMeta, RelationshipKind, RelationshipMeta, CREATED_AT,
    EMAIL_VERIFIED, PASSWORD, SESSION_TOKEN, UPDATED_AT,
};
use crate::query::{Pointer, RelatedQuery};
use crate::record::{Record, Value as AttrValue};

pub const DATE_TYPE: &str = "Date";

/// Columns the backend manages itself; never part of an outgoing body.
pub const SERVER_MANAGED: [&str; 4] = [CREATED_AT, UPDATED_AT, EMAIL_VERIFIED, SESSION_TOKEN];

/// The adapter operation a payload answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Find,
    FindAll,
    FindQuery,
    Create,
    Update,
    Delete,
}

/// One server hash in local shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    pub id: Option<String>,
    /// Attribute values, dates as canonical ISO strings.
    pub attributes: Map<String, Value>,
    /// To-one relationships by key, as the referenced id.
    pub belongs_to: BTreeMap<String, Option<String>>,
    pub has_many: BTreeMap<String, RelatedQuery>,
}

/// A normalized response: one record or a list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Single(NormalizedRecord),
    Many(Vec<NormalizedRecord>),
}

impl Document {
    pub fn into_single(self) -> Result<NormalizedRecord, ApiError> {
        match self {
            Document::Single(record) => Ok(record),
            Document::Many(_) => Err(ApiError::Deserialization(
                "expected a single object, got a list".to_string(),
            )),
        }
    }

    pub fn into_vec(self) -> Vec<NormalizedRecord> {
        match self {
            Document::Single(record) => vec![record],
            Document::Many(records) => records,
        }
    }
}

/// Canonical wire form of a date: ISO-8601, UTC, milliseconds, `Z` suffix.
pub fn encode_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drop precision the wire cannot carry.
///
/// Every locally held date goes through this, so `parse_date(encode_date(d))`
/// gives back `d`.
pub fn truncate_date(date: DateTime<Utc>) -> DateTime<Utc> {
    date.trunc_subsecs(3)
}

/// Parse the date formats the backend and older clients have produced.
///
/// Offset-less forms are taken as UTC. The result is truncated to
/// milliseconds.
pub fn parse_date(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    parse_date_exact(raw).map(truncate_date)
}

fn parse_date_exact(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ApiError::InvalidDate(raw.to_string()))
}

/// `{ "__type": "Date", "iso": ... }`
pub fn date_to_wire(iso: &str) -> Value {
    json!({ "__type": DATE_TYPE, "iso": iso })
}

fn date_from_wire(value: &Value) -> Option<&Value> {
    let object = value.as_object()?;
    match object.get("__type").and_then(Value::as_str) {
        Some(DATE_TYPE) => object.get("iso"),
        _ => None,
    }
}

/// Override points between local records and wire JSON.
pub trait Serializer: Send + Sync {
    /// Field holding the server-assigned id.
    fn primary_key(&self) -> &str;

    /// Make sure `payload` carries the record id before normalization.
    fn extract_id(&self, payload: &mut Value, id: Option<&str>, request_type: RequestType);

    /// Wrap the payload as `{ <type_key>: object | [objects] }`.
    fn normalize_payload(&self, meta: &ModelMeta, payload: Value) -> Map<String, Value>;

    fn normalize_attributes(&self, meta: &ModelMeta, hash: &mut Map<String, Value>)
        -> Result<(), ApiError>;

    /// Rewrite to-one values in place; return the to-many queries.
    fn normalize_relationships(
        &self,
        meta: &ModelMeta,
        hash: &mut Map<String, Value>,
    ) -> BTreeMap<String, RelatedQuery>;

    fn serialize_attribute(
        &self,
        record: &Record,
        json: &mut Map<String, Value>,
        key: &str,
        attribute: &AttributeMeta,
    );

    fn serialize_belongs_to(
        &self,
        record: &Record,
        json: &mut Map<String, Value>,
        relationship: &RelationshipMeta,
    );

    fn serialize_has_many(
        &self,
        record: &Record,
        json: &mut Map<String, Value>,
        relationship: &RelationshipMeta,
    );

    /// Move the primary key to `id`.
    fn normalize_id(&self, hash: &mut Map<String, Value>) {
        if let Some(id) = hash.remove(self.primary_key()) {
            hash.insert("id".to_string(), id);
        }
    }

    /// Normalize one server hash.
    fn normalize(
        &self,
        meta: &ModelMeta,
        mut hash: Map<String, Value>,
    ) -> Result<NormalizedRecord, ApiError> {
        self.normalize_id(&mut hash);
        self.normalize_attributes(meta, &mut hash)?;
        let has_many = self.normalize_relationships(meta, &mut hash);

        let id = match hash.remove("id") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let mut belongs_to = BTreeMap::new();
        for rel in meta
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::BelongsTo)
        {
            if let Some(value) = hash.remove(&rel.key) {
                belongs_to.insert(rel.key.clone(), value.as_str().map(str::to_string));
            }
        }
        for key in has_many.keys() {
            hash.remove(key);
        }

        Ok(NormalizedRecord {
            id,
            attributes: hash,
            belongs_to,
            has_many,
        })
    }

    /// Turn a raw response payload into a `Document`.
    fn extract(
        &self,
        meta: &ModelMeta,
        mut payload: Value,
        id: Option<&str>,
        request_type: RequestType,
    ) -> Result<Document, ApiError> {
        self.extract_id(&mut payload, id, request_type);
        let mut wrapped = self.normalize_payload(meta, payload);
        match wrapped.remove(&meta.type_key) {
            Some(Value::Object(hash)) => Ok(Document::Single(self.normalize(meta, hash)?)),
            Some(Value::Array(items)) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(hash) => records.push(self.normalize(meta, hash)?),
                        other => {
                            return Err(ApiError::Deserialization(format!(
                                "expected an object in results, got {other}"
                            )))
                        }
                    }
                }
                Ok(Document::Many(records))
            }
            other => Err(ApiError::Deserialization(format!(
                "unexpected payload for {}: {}",
                meta.type_key,
                other.unwrap_or(Value::Null)
            ))),
        }
    }

    /// The record's full outgoing attribute and relationship set.
    fn serialize(&self, record: &Record) -> Map<String, Value> {
        let meta = record.meta();
        let mut json = Map::new();
        for attribute in &meta.attributes {
            self.serialize_attribute(record, &mut json, &attribute.name, attribute);
        }
        for relationship in &meta.relationships {
            match relationship.kind {
                RelationshipKind::BelongsTo => {
                    self.serialize_belongs_to(record, &mut json, relationship)
                }
                RelationshipKind::HasMany => {
                    self.serialize_has_many(record, &mut json, relationship)
                }
            }
        }
        json
    }

    /// Merge the record's serialized form into `hash`.
    fn serialize_into_hash(&self, hash: &mut Map<String, Value>, record: &Record) {
        hash.extend(self.serialize(record));
    }
}

/// The backend's serialization conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseSerializer;

impl ParseSerializer {
    pub const PRIMARY_KEY: &'static str = "objectId";
}

impl Serializer for ParseSerializer {
    fn primary_key(&self) -> &str {
        Self::PRIMARY_KEY
    }

    /// Update responses only carry `updatedAt`, so the known id is put back.
    fn extract_id(&self, payload: &mut Value, id: Option<&str>, request_type: RequestType) {
        if request_type != RequestType::Update {
            return;
        }
        if let (Some(id), Some(object)) = (id, payload.as_object_mut()) {
            object.insert(Self::PRIMARY_KEY.to_string(), Value::String(id.to_string()));
        }
    }

    fn normalize_payload(&self, meta: &ModelMeta, mut payload: Value) -> Map<String, Value> {
        let body = match payload.as_object_mut().and_then(|o| o.remove("results")) {
            Some(results) => results,
            None => payload,
        };
        let mut wrapped = Map::new();
        wrapped.insert(meta.type_key.clone(), body);
        wrapped
    }

    fn normalize_attributes(
        &self,
        meta: &ModelMeta,
        hash: &mut Map<String, Value>,
    ) -> Result<(), ApiError> {
        for attribute in meta.date_attributes() {
            let Some(value) = hash.get_mut(&attribute.name) else {
                continue;
            };
            if value.is_object() {
                let iso = date_from_wire(value)
                    .cloned()
                    .ok_or_else(|| ApiError::InvalidDate(value.to_string()))?;
                *value = iso;
            }
            if let Some(raw) = value.as_str() {
                let canonical = encode_date(&parse_date(raw)?);
                *value = Value::String(canonical);
            }
        }
        Ok(())
    }

    fn normalize_relationships(
        &self,
        meta: &ModelMeta,
        hash: &mut Map<String, Value>,
    ) -> BTreeMap<String, RelatedQuery> {
        let owner_id = hash.get("id").and_then(Value::as_str).map(str::to_string);
        let mut queries = BTreeMap::new();
        for rel in &meta.relationships {
            match rel.kind {
                RelationshipKind::BelongsTo => {
                    if let Some(value) = hash.get_mut(&rel.key) {
                        if let Some(pointer) = Pointer::from_json(value) {
                            *value = Value::String(pointer.object_id);
                        }
                    }
                }
                RelationshipKind::HasMany => {
                    // A hash without an id has nothing to relate to.
                    if let Some(owner_id) = &owner_id {
                        let owner = Pointer::new(meta.parse_class_name(), owner_id.clone());
                        queries.insert(
                            rel.key.clone(),
                            RelatedQuery::new(rel.related.clone(), owner, rel.key.clone()),
                        );
                    }
                }
            }
        }
        queries
    }

    fn serialize_attribute(
        &self,
        record: &Record,
        json: &mut Map<String, Value>,
        key: &str,
        attribute: &AttributeMeta,
    ) {
        if SERVER_MANAGED.contains(&key) {
            json.remove(key);
            return;
        }
        let value = record.get(key);
        // The password is write-only: once the backend has it, it is never resent.
        if key == PASSWORD && value.is_null() && record.meta().is_user() {
            json.remove(key);
            return;
        }
        let encoded = match (attribute.ty, value) {
            (AttributeType::Date, AttrValue::Date(date)) => date_to_wire(&encode_date(date)),
            (AttributeType::Date, AttrValue::String(iso)) => date_to_wire(iso),
            _ => value.to_json(),
        };
        json.insert(key.to_string(), encoded);
    }

    fn serialize_belongs_to(
        &self,
        record: &Record,
        json: &mut Map<String, Value>,
        relationship: &RelationshipMeta,
    ) {
        if let Some(target) = record.belongs_to(&relationship.key) {
            let pointer = Pointer::new(target.class_name.clone(), target.id.clone());
            json.insert(relationship.key.clone(), pointer.to_json());
        }
    }

    /// To-many relationships are reverse-lookup queries on the backend and
    /// are never embedded in outgoing bodies.
    fn serialize_has_many(
        &self,
        _record: &Record,
        _json: &mut Map<String, Value>,
        _relationship: &RelationshipMeta,
    ) {
    }
}
