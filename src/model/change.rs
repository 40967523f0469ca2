use serde::{Deserialize, Serialize};

use crate::model::FieldSchema;

/// One atomic operation of a version's change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SchemaChange {
    AddField {
        field: FieldSchema,
        /// Index in the new field list; appended when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    RemoveField {
        field: String,
    },
    /// Replaces the definition of an existing field, matched by name
    UpdateField {
        field: FieldSchema,
    },
    RenameField {
        from: String,
        to: String,
    },
    ReorderFields {
        order: Vec<String>,
    },
    UpdateSchema {
        description: Option<String>,
        display_field: Option<String>,
        auto_purge: bool,
    },
}

impl SchemaChange {
    /// Name of the field the change applies to (the source name for renames)
    pub fn field_name(&self) -> Option<&str> {
        match self {
            SchemaChange::AddField { field, .. } | SchemaChange::UpdateField { field } => {
                Some(field.name.as_str())
            }
            SchemaChange::RemoveField { field } => Some(field.as_str()),
            SchemaChange::RenameField { from, .. } => Some(from.as_str()),
            SchemaChange::ReorderFields { .. } | SchemaChange::UpdateSchema { .. } => None,
        }
    }

    /// Whether container data has to be touched for this change
    pub fn affects_data(&self) -> bool {
        !matches!(
            self,
            SchemaChange::ReorderFields { .. } | SchemaChange::UpdateSchema { .. }
        )
    }
}

/// Caller-supplied field rename; renames are never inferred from content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRename {
    pub from: String,
    pub to: String,
}

impl FieldRename {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    #[test]
    fn test_change_serialization_is_tagged() {
        let change = SchemaChange::AddField {
            field: FieldSchema::new("subtitle", FieldType::String),
            position: Some(1),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["operation"], "add_field");
        assert_eq!(json["field"]["name"], "subtitle");

        let back: SchemaChange = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
        assert_eq!(back.field_name(), Some("subtitle"));
    }

    #[test]
    fn test_reorder_does_not_affect_data() {
        let reorder = SchemaChange::ReorderFields {
            order: vec!["b".into(), "a".into()],
        };
        assert!(!reorder.affects_data());
        assert!(SchemaChange::RemoveField { field: "a".into() }.affects_data());
    }
}
