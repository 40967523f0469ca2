use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Wall-clock timestamp used for version, container and job markers
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Check that a schema or field name is usable as an identifier
/// (`[A-Za-z][A-Za-z0-9_]*`)
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
