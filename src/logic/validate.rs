use itertools::Itertools;

use crate::error::{MeshError, MeshResult};
use crate::logic::coerce::value_from_json;
use crate::model::{is_valid_identifier, FieldType, SchemaDefinition, SchemaKind};

/// Structural checks on a field-schema document. Checks that need the store
/// (referenced microschemas exist) live in the registry.
pub struct DefinitionValidator;

impl DefinitionValidator {
    pub fn validate(kind: SchemaKind, definition: &SchemaDefinition) -> MeshResult<()> {
        let issues = Self::collect_issues(kind, definition);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(MeshError::validation(format!(
                "{} '{}': {}",
                kind,
                definition.name,
                issues.join("; ")
            )))
        }
    }

    pub fn collect_issues(kind: SchemaKind, definition: &SchemaDefinition) -> Vec<String> {
        let mut issues = Vec::new();

        if !is_valid_identifier(&definition.name) {
            issues.push(format!("invalid name '{}'", definition.name));
        }
        if definition.fields.is_empty() {
            issues.push("at least one field is required".to_string());
        }

        for name in definition.fields.iter().map(|field| field.name.as_str()).duplicates() {
            issues.push(format!("duplicate field '{}'", name));
        }

        for field in &definition.fields {
            if !is_valid_identifier(&field.name) {
                issues.push(format!("invalid field name '{}'", field.name));
            }

            match (field.field_type, field.list_type) {
                (FieldType::List, None) => {
                    issues.push(format!("list field '{}' needs a list_type", field.name));
                }
                (FieldType::List, Some(FieldType::List)) => {
                    issues.push(format!("list field '{}' cannot contain lists", field.name));
                }
                (FieldType::List, Some(_)) => {}
                (_, Some(_)) => {
                    issues.push(format!(
                        "field '{}' of type {} cannot have a list_type",
                        field.name, field.field_type
                    ));
                }
                (_, None) => {}
            }

            if field.references_microschemas() {
                if kind == SchemaKind::Microschema {
                    issues.push(format!(
                        "microschemas cannot nest micronodes (field '{}')",
                        field.name
                    ));
                }
                if field.allow.is_empty() {
                    issues.push(format!(
                        "micronode field '{}' must allow at least one microschema",
                        field.name
                    ));
                }
            }

            if let Some(default) = &field.default {
                if let Err(message) = value_from_json(default, field) {
                    issues.push(format!("default of field '{}': {}", field.name, message));
                }
            }
        }

        if let Some(display_field) = &definition.display_field {
            match definition.field(display_field) {
                Some(field) if field.field_type == FieldType::String => {}
                Some(_) => issues.push(format!("display field '{}' must be a string field", display_field)),
                None => issues.push(format!("display field '{}' does not exist", display_field)),
            }
        }

        issues
    }
}
