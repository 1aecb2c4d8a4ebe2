//! Static type metadata for records: attributes, relationships and the
//! backend class each type maps to.
//!
//! # Design
//! A `ModelMeta` describes one record type. Every type starts with the
//! backend-managed `createdAt`/`updatedAt` dates; user-kind types also get
//! the built-in user columns. Extending a user type (adding `name`, say)
//! keeps `ModelKind::User`, so the path resolver still routes it to `users`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ApiError;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const EMAIL: &str = "email";
pub const EMAIL_VERIFIED: &str = "emailVerified";
pub const SESSION_TOKEN: &str = "sessionToken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Object,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Boolean,
    Number,
    Date,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMeta {
    pub name: String,
    pub ty: AttributeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipMeta {
    pub key: String,
    pub kind: RelationshipKind,
    /// Type key of the related model.
    pub related: String,
}

/// Metadata for one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    pub type_key: String,
    pub kind: ModelKind,
    pub attributes: Vec<AttributeMeta>,
    pub relationships: Vec<RelationshipMeta>,
}

impl ModelMeta {
    /// A generic backend object type.
    pub fn object(type_key: impl Into<String>) -> Self {
        Self {
            type_key: type_key.into(),
            kind: ModelKind::Object,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
        .attr(CREATED_AT, AttributeType::Date)
        .attr(UPDATED_AT, AttributeType::Date)
    }

    /// A user type, carrying the built-in user columns.
    pub fn user(type_key: impl Into<String>) -> Self {
        let mut meta = Self::object(type_key)
            .attr(USERNAME, AttributeType::String)
            .attr(PASSWORD, AttributeType::String)
            .attr(EMAIL, AttributeType::String)
            .attr(EMAIL_VERIFIED, AttributeType::Boolean)
            .attr(SESSION_TOKEN, AttributeType::String);
        meta.kind = ModelKind::User;
        meta
    }

    /// Declare an attribute. Redeclaring a name replaces its type.
    pub fn attr(mut self, name: &str, ty: AttributeType) -> Self {
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.ty = ty,
            None => self.attributes.push(AttributeMeta {
                name: name.to_string(),
                ty,
            }),
        }
        self
    }

    pub fn belongs_to(self, key: &str, related: &str) -> Self {
        self.relationship_of(key, RelationshipKind::BelongsTo, related)
    }

    pub fn has_many(self, key: &str, related: &str) -> Self {
        self.relationship_of(key, RelationshipKind::HasMany, related)
    }

    fn relationship_of(mut self, key: &str, kind: RelationshipKind, related: &str) -> Self {
        self.relationships.retain(|r| r.key != key);
        self.relationships.push(RelationshipMeta {
            key: key.to_string(),
            kind,
            related: related.to_string(),
        });
        self
    }

    pub fn is_user(&self) -> bool {
        self.kind == ModelKind::User
    }

    /// The backend class name: the type key with its first letter upper-cased.
    pub fn parse_class_name(&self) -> String {
        capitalize(&self.type_key)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, key: &str) -> Option<&RelationshipMeta> {
        self.relationships.iter().find(|r| r.key == key)
    }

    pub fn date_attributes(&self) -> impl Iterator<Item = &AttributeMeta> {
        self.attributes.iter().filter(|a| a.ty == AttributeType::Date)
    }
}

/// Upper-case the first character, leave the rest unchanged.
pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Registry of the record types known to an adapter.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: HashMap<String, Arc<ModelMeta>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, meta: ModelMeta) -> Self {
        self.register(meta);
        self
    }

    pub fn register(&mut self, meta: ModelMeta) -> Arc<ModelMeta> {
        let meta = Arc::new(meta);
        self.models.insert(meta.type_key.clone(), Arc::clone(&meta));
        meta
    }

    pub fn get(&self, type_key: &str) -> Result<Arc<ModelMeta>, ApiError> {
        self.models
            .get(type_key)
            .cloned()
            .ok_or_else(|| ApiError::UnknownType(type_key.to_string()))
    }
}
