use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::model::{generate_id, now, Id, SchemaChange};

/// Distinguishes schemas (node content types) from microschemas (embedded
/// micronode types). Both share the same version model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Schema,
    Microschema,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::Schema => "schema",
            SchemaKind::Microschema => "microschema",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(SchemaKind::Schema),
            "microschema" => Some(SchemaKind::Microschema),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Html,
    Number,
    Boolean,
    Date,
    Node,
    Micronode,
    List,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Html => "html",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Node => "node",
            FieldType::Micronode => "micronode",
            FieldType::List => "list",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Element type, only for `list` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_type: Option<FieldType>,
    /// Allowed microschema names (micronode fields) or schema names (node fields)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub required: bool,
    /// Value new containers get when the field is added by a migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            list_type: None,
            allow: Vec::new(),
            required: false,
            default: None,
            label: None,
        }
    }

    pub fn list(name: impl Into<String>, list_type: FieldType) -> Self {
        Self {
            list_type: Some(list_type),
            ..Self::new(name, FieldType::List)
        }
    }

    pub fn with_allow(mut self, allow: &[&str]) -> Self {
        self.allow = allow.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Type of the individual values: the list type for lists, the field type otherwise
    pub fn element_type(&self) -> FieldType {
        match self.field_type {
            FieldType::List => self.list_type.unwrap_or(FieldType::String),
            other => other,
        }
    }

    /// True for `micronode` and `list<micronode>` fields
    pub fn references_microschemas(&self) -> bool {
        self.element_type() == FieldType::Micronode
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allow.iter().any(|allowed| allowed == name)
    }
}

/// The structured field-schema document stored on every version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default)]
    pub auto_purge: bool,
    pub fields: Vec<FieldSchema>,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            display_field: None,
            auto_purge: false,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.name.as_str()).collect()
    }

    /// Names of all microschemas allowed by micronode fields
    pub fn microschema_references(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|field| field.references_microschemas())
            .flat_map(|field| field.allow.iter().cloned())
            .collect()
    }
}

/// One immutable version in the chain of a schema or microschema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: Id,
    pub kind: SchemaKind,
    pub name: String,
    pub version: u32,
    pub definition: SchemaDefinition,
    pub previous: Option<Id>,
    pub next: Option<Id>,
    /// Changes that turn `previous.definition` into `definition`
    pub changes: Vec<SchemaChange>,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersion {
    /// First version of a new chain
    pub fn root(kind: SchemaKind, definition: SchemaDefinition) -> Self {
        Self {
            id: generate_id(),
            kind,
            name: definition.name.clone(),
            version: 1,
            definition,
            previous: None,
            next: None,
            changes: Vec::new(),
            created_at: now(),
        }
    }

    /// Version following this one; the caller links `self.next`
    pub fn successor(&self, definition: SchemaDefinition, changes: Vec<SchemaChange>) -> Self {
        Self {
            id: generate_id(),
            kind: self.kind,
            name: self.name.clone(),
            version: self.version + 1,
            definition,
            previous: Some(self.id.clone()),
            next: None,
            changes,
            created_at: now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.previous.is_none()
    }

    pub fn is_latest(&self) -> bool {
        self.next.is_none()
    }

    pub fn reference(&self) -> VersionReference {
        VersionReference {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            version: self.version,
        }
    }
}

/// Lightweight pointer to a version, used in listings and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReference {
    pub id: Id,
    pub kind: SchemaKind,
    pub name: String,
    pub version: u32,
}
