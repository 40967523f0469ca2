use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{generate_id, now, FieldValue, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Draft,
    Published,
}

impl ContainerType {
    /// Migration order: drafts first, then published containers
    pub const ALL: [ContainerType; 2] = [ContainerType::Draft, ContainerType::Published];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Draft => "draft",
            ContainerType::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(ContainerType::Draft),
            "published" => Some(ContainerType::Published),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned bag of field values for one node and language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldContainer {
    pub id: Id,
    pub node_id: Id,
    pub language: String,
    pub schema_version_id: Id,
    pub fields: BTreeMap<String, FieldValue>,
    /// Older version of this node/language content
    pub previous: Option<Id>,
    /// Newer versions of this node/language content. Forked branches share
    /// containers, so each branch that migrates one adds its own successor.
    #[serde(default)]
    pub next: BTreeSet<Id>,
    pub created_at: DateTime<Utc>,
}

impl FieldContainer {
    pub fn new(
        node_id: impl Into<Id>,
        language: impl Into<String>,
        schema_version_id: impl Into<Id>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            id: generate_id(),
            node_id: node_id.into(),
            language: language.into(),
            schema_version_id: schema_version_id.into(),
            fields,
            previous: None,
            next: BTreeSet::new(),
            created_at: now(),
        }
    }

    /// New container version following this one; the store adds it to `self.next`
    pub fn successor(&self, schema_version_id: &Id, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            id: generate_id(),
            node_id: self.node_id.clone(),
            language: self.language.clone(),
            schema_version_id: schema_version_id.clone(),
            fields,
            previous: Some(self.id.clone()),
            next: BTreeSet::new(),
            created_at: now(),
        }
    }

    /// Microschema version ids of all micronodes in this container
    pub fn micronode_versions(&self) -> BTreeSet<Id> {
        self.fields
            .values()
            .flat_map(|value| value.micronodes())
            .map(|micronode| micronode.version_id.clone())
            .collect()
    }

    pub fn holds_micronode_version(&self, version_id: &str) -> bool {
        self.fields
            .values()
            .flat_map(|value| value.micronodes())
            .any(|micronode| micronode.version_id == version_id)
    }
}

/// Branch pointer to the current container of a node/language/type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEdge {
    pub branch_id: Id,
    pub node_id: Id,
    pub language: String,
    pub container_type: ContainerType,
    pub container_id: Id,
}

impl ContainerEdge {
    pub fn new(
        branch_id: impl Into<Id>,
        container: &FieldContainer,
        container_type: ContainerType,
    ) -> Self {
        Self {
            branch_id: branch_id.into(),
            node_id: container.node_id.clone(),
            language: container.language.clone(),
            container_type,
            container_id: container.id.clone(),
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            branch_id: self.branch_id.clone(),
            node_id: self.node_id.clone(),
            language: self.language.clone(),
            container_type: self.container_type,
        }
    }

    /// Ordering position used for keyset pagination over a branch
    pub fn cursor(&self) -> EdgeCursor {
        EdgeCursor {
            node_id: self.node_id.clone(),
            language: self.language.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub branch_id: Id,
    pub node_id: Id,
    pub language: String,
    pub container_type: ContainerType,
}

/// Exclusive lower bound when paging edges of one branch and container type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeCursor {
    pub node_id: Id,
    pub language: String,
}
