use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{generate_id, now, Id, SchemaKind, SchemaVersion};

/// A staging line within a project pinning schema and microschema versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub project_id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Branch this one was forked from (None for the initial branch)
    pub base_branch_id: Option<Id>,
    /// Whether this is the project's latest branch
    pub latest: bool,
    /// False until the branch migration copied the base branch content
    pub migrated: bool,
    pub auto_purge: bool,
    /// Schema name -> assigned schema version id
    pub schema_versions: BTreeMap<String, Id>,
    /// Microschema name -> assigned microschema version id
    pub microschema_versions: BTreeMap<String, Id>,
}

impl Branch {
    pub fn new_initial(project_id: Id, name: String) -> Self {
        Self {
            id: generate_id(),
            project_id,
            name,
            created_at: now(),
            base_branch_id: None,
            latest: true,
            migrated: true,
            auto_purge: false,
            schema_versions: BTreeMap::new(),
            microschema_versions: BTreeMap::new(),
        }
    }

    /// Fork a branch from `base`, inheriting its version assignments
    pub fn new_from_branch(base: &Branch, name: String) -> Self {
        Self {
            id: generate_id(),
            project_id: base.project_id.clone(),
            name,
            created_at: now(),
            base_branch_id: Some(base.id.clone()),
            latest: false,
            migrated: false,
            auto_purge: base.auto_purge,
            schema_versions: base.schema_versions.clone(),
            microschema_versions: base.microschema_versions.clone(),
        }
    }

    pub fn assignments(&self, kind: SchemaKind) -> &BTreeMap<String, Id> {
        match kind {
            SchemaKind::Schema => &self.schema_versions,
            SchemaKind::Microschema => &self.microschema_versions,
        }
    }

    pub fn assignments_mut(&mut self, kind: SchemaKind) -> &mut BTreeMap<String, Id> {
        match kind {
            SchemaKind::Schema => &mut self.schema_versions,
            SchemaKind::Microschema => &mut self.microschema_versions,
        }
    }

    pub fn assigned(&self, kind: SchemaKind, name: &str) -> Option<&Id> {
        self.assignments(kind).get(name)
    }

    /// Pin a version, returning the previously assigned version id
    pub fn assign(&mut self, version: &SchemaVersion) -> Option<Id> {
        self.assignments_mut(version.kind)
            .insert(version.name.clone(), version.id.clone())
    }
}
