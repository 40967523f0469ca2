use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{FieldType, Id};

/// A stored field value. The tag mirrors [`FieldType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Html(String),
    Number(f64),
    Boolean(bool),
    /// RFC 3339 timestamp
    Date(String),
    Node(Id),
    Micronode(Micronode),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::String(_) => FieldType::String,
            FieldValue::Html(_) => FieldType::Html,
            FieldValue::Number(_) => FieldType::Number,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Node(_) => FieldType::Node,
            FieldValue::Micronode(_) => FieldType::Micronode,
            FieldValue::List(_) => FieldType::List,
        }
    }

    /// Micronodes held directly or as list elements
    pub fn micronodes(&self) -> Vec<&Micronode> {
        match self {
            FieldValue::Micronode(micronode) => vec![micronode],
            FieldValue::List(items) => items
                .iter()
                .filter_map(|item| match item {
                    FieldValue::Micronode(micronode) => Some(micronode),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Embedded micro-content conforming to one microschema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Micronode {
    /// Microschema name
    pub microschema: String,
    pub version_id: Id,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Micronode {
    pub fn new(microschema: impl Into<String>, version_id: impl Into<Id>) -> Self {
        Self {
            microschema: microschema.into(),
            version_id: version_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_json_is_tagged_by_type() {
        let value = FieldValue::Number(9.99);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"type": "number", "value": 9.99}));

        let list: FieldValue = serde_json::from_value(serde_json::json!({
            "type": "list",
            "value": [
                {"type": "micronode", "value": {"microschema": "image", "version_id": "v1", "fields": {}}},
                {"type": "string", "value": "ignored"}
            ]
        }))
        .unwrap();
        assert_eq!(list.field_type(), FieldType::List);
        assert_eq!(list.micronodes().len(), 1);
        assert_eq!(list.micronodes()[0].microschema, "image");
    }
}
