use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::model::{FieldSchema, FieldType, FieldValue, Micronode, SchemaChange, SchemaDefinition};

/// Failure to carry a value into its new shape; `field` names the offending field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMigrationError {
    pub field: Option<String>,
    pub message: String,
}

impl FieldMigrationError {
    fn on_field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

/// Convert a JSON literal (a declared default) into a value of the field's type
pub fn value_from_json(json: &serde_json::Value, field: &FieldSchema) -> Result<FieldValue, String> {
    if field.field_type == FieldType::List {
        let items = json
            .as_array()
            .ok_or_else(|| format!("expected an array for list field '{}'", field.name))?;
        let element_type = field.element_type();
        return items
            .iter()
            .map(|item| scalar_from_json(item, element_type, field))
            .collect::<Result<Vec<_>, _>>()
            .map(FieldValue::List);
    }
    scalar_from_json(json, field.field_type, field)
}

fn scalar_from_json(
    json: &serde_json::Value,
    field_type: FieldType,
    field: &FieldSchema,
) -> Result<FieldValue, String> {
    let mismatch = || format!("{} is not a valid {} value", json, field_type);
    match field_type {
        FieldType::String => json.as_str().map(|s| FieldValue::String(s.to_string())).ok_or_else(mismatch),
        FieldType::Html => json.as_str().map(|s| FieldValue::Html(s.to_string())).ok_or_else(mismatch),
        FieldType::Number => json.as_f64().map(FieldValue::Number).ok_or_else(mismatch),
        FieldType::Boolean => json.as_bool().map(FieldValue::Boolean).ok_or_else(mismatch),
        FieldType::Date => {
            let raw = json.as_str().ok_or_else(mismatch)?;
            parse_date(raw).map(|date| FieldValue::Date(date.to_rfc3339()))
        }
        FieldType::Node => json.as_str().map(|s| FieldValue::Node(s.to_string())).ok_or_else(mismatch),
        FieldType::Micronode => {
            let micronode: Micronode =
                serde_json::from_value(json.clone()).map_err(|e| format!("invalid micronode: {}", e))?;
            check_micronode_allowed(&micronode, field)?;
            Ok(FieldValue::Micronode(micronode))
        }
        FieldType::List => Err(format!("nested lists are not supported ('{}')", field.name)),
    }
}

/// Re-coerce a stored value into the shape of `target`.
///
/// `Ok(None)` means the value disappears (an empty list narrowed to a single value).
pub fn coerce_value(value: &FieldValue, target: &FieldSchema) -> Result<Option<FieldValue>, String> {
    let element_type = target.element_type();
    match (target.field_type, value) {
        (FieldType::List, FieldValue::List(items)) => items
            .iter()
            .map(|item| coerce_scalar(item, element_type, target))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Some(FieldValue::List(items))),
        (FieldType::List, single) => {
            coerce_scalar(single, element_type, target).map(|item| Some(FieldValue::List(vec![item])))
        }
        (_, FieldValue::List(items)) => match items.first() {
            Some(first) => coerce_scalar(first, target.field_type, target).map(Some),
            None => Ok(None),
        },
        (field_type, single) => coerce_scalar(single, field_type, target).map(Some),
    }
}

fn coerce_scalar(value: &FieldValue, to: FieldType, field: &FieldSchema) -> Result<FieldValue, String> {
    let impossible = || format!("cannot convert {} value to {}", value.field_type(), to);
    match (value, to) {
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::String) => Ok(FieldValue::String(s.clone())),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Html) => Ok(FieldValue::Html(s.clone())),
        (FieldValue::Number(n), FieldType::String) => Ok(FieldValue::String(format_number(*n))),
        (FieldValue::Number(n), FieldType::Html) => Ok(FieldValue::Html(format_number(*n))),
        (FieldValue::Boolean(b), FieldType::String) => Ok(FieldValue::String(b.to_string())),
        (FieldValue::Boolean(b), FieldType::Html) => Ok(FieldValue::Html(b.to_string())),
        (FieldValue::Date(d), FieldType::String) => Ok(FieldValue::String(d.clone())),
        (FieldValue::Date(d), FieldType::Html) => Ok(FieldValue::Html(d.clone())),

        (FieldValue::Number(n), FieldType::Number) => Ok(FieldValue::Number(*n)),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Number) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(FieldValue::Number)
            .ok_or_else(|| format!("'{}' is not a number", s)),
        (FieldValue::Boolean(b), FieldType::Number) => Ok(FieldValue::Number(if *b { 1.0 } else { 0.0 })),
        (FieldValue::Date(d), FieldType::Number) => {
            parse_date(d).map(|date| FieldValue::Number(date.timestamp_millis() as f64))
        }

        (FieldValue::Boolean(b), FieldType::Boolean) => Ok(FieldValue::Boolean(*b)),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Boolean) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(FieldValue::Boolean(true)),
                "false" => Ok(FieldValue::Boolean(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            }
        }
        (FieldValue::Number(n), FieldType::Boolean) if *n == 1.0 => Ok(FieldValue::Boolean(true)),
        (FieldValue::Number(n), FieldType::Boolean) if *n == 0.0 => Ok(FieldValue::Boolean(false)),

        (FieldValue::Date(d), FieldType::Date) => Ok(FieldValue::Date(d.clone())),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Date) => {
            parse_date(s).map(|date| FieldValue::Date(date.to_rfc3339()))
        }
        (FieldValue::Number(n), FieldType::Date) => Utc
            .timestamp_millis_opt(*n as i64)
            .single()
            .map(|date| FieldValue::Date(date.to_rfc3339()))
            .ok_or_else(|| format!("{} is not a valid timestamp", n)),

        (FieldValue::Node(id), FieldType::Node) => Ok(FieldValue::Node(id.clone())),
        (FieldValue::Micronode(micronode), FieldType::Micronode) => {
            check_micronode_allowed(micronode, field)?;
            Ok(FieldValue::Micronode(micronode.clone()))
        }
        _ => Err(impossible()),
    }
}

fn check_micronode_allowed(micronode: &Micronode, field: &FieldSchema) -> Result<(), String> {
    if !field.allow.is_empty() && !field.allows(&micronode.microschema) {
        return Err(format!(
            "microschema '{}' is not allowed in field '{}'",
            micronode.microschema, field.name
        ));
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| format!("'{}' is not an RFC 3339 date", raw))
}

/// Integral numbers lose the trailing `.0`
fn format_number(n: f64) -> String {
    format!("{}", n)
}

/// Apply an ordered change list to stored field values and drop every value
/// `target` does not declare.
pub fn migrate_fields(
    fields: &BTreeMap<String, FieldValue>,
    changes: &[SchemaChange],
    target: &SchemaDefinition,
) -> Result<BTreeMap<String, FieldValue>, FieldMigrationError> {
    let mut migrated = fields.clone();

    for change in changes {
        match change {
            SchemaChange::RemoveField { field } => {
                migrated.remove(field);
            }
            SchemaChange::AddField { field, .. } => {
                if let Some(default) = &field.default {
                    let value = value_from_json(default, field)
                        .map_err(|message| FieldMigrationError::on_field(&field.name, message))?;
                    migrated.insert(field.name.clone(), value);
                } else {
                    migrated.remove(&field.name);
                }
            }
            SchemaChange::UpdateField { field } => {
                if let Some(current) = migrated.remove(&field.name) {
                    let coerced = coerce_value(&current, field)
                        .map_err(|message| FieldMigrationError::on_field(&field.name, message))?;
                    if let Some(value) = coerced {
                        migrated.insert(field.name.clone(), value);
                    }
                }
            }
            SchemaChange::RenameField { from, to } => {
                if let Some(value) = migrated.remove(from) {
                    migrated.insert(to.clone(), value);
                }
            }
            SchemaChange::ReorderFields { .. } | SchemaChange::UpdateSchema { .. } => {}
        }
    }

    migrated.retain(|name, _| target.field(name).is_some());
    Ok(migrated)
}
