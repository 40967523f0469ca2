use std::collections::HashMap;

use crate::error::{MeshError, MeshResult};
use crate::model::{FieldRename, FieldSchema, SchemaChange, SchemaDefinition};

/// Computes and applies change sets between two definitions of one schema
pub struct SchemaDiff;

impl SchemaDiff {
    /// Ordered change list turning `old` into `new`.
    ///
    /// Fields are matched by name. A field present on both sides with any
    /// difference is an update, never a removal plus an addition. Renames are
    /// only produced from `renames`. Output order: renames (caller order),
    /// removals (old order), updates and additions (new order), then a reorder
    /// and a schema-level update when needed.
    pub fn diff(
        old: &SchemaDefinition,
        new: &SchemaDefinition,
        renames: &[FieldRename],
    ) -> MeshResult<Vec<SchemaChange>> {
        Self::check_renames(old, new, renames)?;

        let mut changes = Vec::new();
        let rename_map: HashMap<&str, &str> = renames
            .iter()
            .map(|rename| (rename.from.as_str(), rename.to.as_str()))
            .collect();

        for rename in renames {
            changes.push(SchemaChange::RenameField {
                from: rename.from.clone(),
                to: rename.to.clone(),
            });
        }

        // Old fields under their post-rename names
        let carried: Vec<FieldSchema> = old
            .fields
            .iter()
            .map(|field| {
                let mut field = field.clone();
                if let Some(to) = rename_map.get(field.name.as_str()) {
                    field.name = to.to_string();
                }
                field
            })
            .collect();

        for field in &carried {
            if new.field(&field.name).is_none() {
                changes.push(SchemaChange::RemoveField {
                    field: field.name.clone(),
                });
            }
        }

        for (position, field) in new.fields.iter().enumerate() {
            match carried.iter().find(|existing| existing.name == field.name) {
                Some(existing) if existing != field => {
                    changes.push(SchemaChange::UpdateField { field: field.clone() });
                }
                Some(_) => {}
                None => changes.push(SchemaChange::AddField {
                    field: field.clone(),
                    position: Some(position),
                }),
            }
        }

        let applied = Self::apply(old, &changes)?;
        if applied.field_names() != new.field_names() {
            changes.push(SchemaChange::ReorderFields {
                order: new.fields.iter().map(|field| field.name.clone()).collect(),
            });
        }

        if old.description != new.description
            || old.display_field != new.display_field
            || old.auto_purge != new.auto_purge
        {
            changes.push(SchemaChange::UpdateSchema {
                description: new.description.clone(),
                display_field: new.display_field.clone(),
                auto_purge: new.auto_purge,
            });
        }

        Ok(changes)
    }

    fn check_renames(
        old: &SchemaDefinition,
        new: &SchemaDefinition,
        renames: &[FieldRename],
    ) -> MeshResult<()> {
        let mut sources = Vec::new();
        let mut targets = Vec::new();
        for rename in renames {
            if rename.from == rename.to {
                return Err(MeshError::validation(format!(
                    "rename of '{}' must change the name",
                    rename.from
                )));
            }
            if old.field(&rename.from).is_none() {
                return Err(MeshError::validation(format!(
                    "renamed field '{}' does not exist in the previous version",
                    rename.from
                )));
            }
            if new.field(&rename.to).is_none() {
                return Err(MeshError::validation(format!(
                    "rename target '{}' does not exist in the new definition",
                    rename.to
                )));
            }
            if old.field(&rename.to).is_some() || new.field(&rename.from).is_some() {
                return Err(MeshError::validation(format!(
                    "rename '{}' -> '{}' collides with an existing field",
                    rename.from, rename.to
                )));
            }
            if sources.contains(&rename.from) || targets.contains(&rename.to) {
                return Err(MeshError::validation(format!(
                    "field '{}' is renamed more than once",
                    rename.from
                )));
            }
            sources.push(rename.from.clone());
            targets.push(rename.to.clone());
        }
        Ok(())
    }

    /// Apply `changes` to a definition; any change that does not fit fails validation
    pub fn apply(definition: &SchemaDefinition, changes: &[SchemaChange]) -> MeshResult<SchemaDefinition> {
        let mut result = definition.clone();

        for change in changes {
            match change {
                SchemaChange::AddField { field, position } => {
                    if result.field(&field.name).is_some() {
                        return Err(MeshError::validation(format!("field '{}' already exists", field.name)));
                    }
                    let index = position.unwrap_or(result.fields.len()).min(result.fields.len());
                    result.fields.insert(index, field.clone());
                }
                SchemaChange::RemoveField { field } => {
                    let index = Self::index_of(&result, field)?;
                    result.fields.remove(index);
                }
                SchemaChange::UpdateField { field } => {
                    let index = Self::index_of(&result, &field.name)?;
                    result.fields[index] = field.clone();
                }
                SchemaChange::RenameField { from, to } => {
                    if result.field(to).is_some() {
                        return Err(MeshError::validation(format!("field '{}' already exists", to)));
                    }
                    let index = Self::index_of(&result, from)?;
                    result.fields[index].name = to.clone();
                }
                SchemaChange::ReorderFields { order } => {
                    let mut reordered = Vec::with_capacity(order.len());
                    for name in order {
                        let index = Self::index_of(&result, name)?;
                        reordered.push(result.fields[index].clone());
                    }
                    if reordered.len() != result.fields.len() {
                        return Err(MeshError::validation("reorder must list every field exactly once"));
                    }
                    result.fields = reordered;
                }
                SchemaChange::UpdateSchema {
                    description,
                    display_field,
                    auto_purge,
                } => {
                    result.description = description.clone();
                    result.display_field = display_field.clone();
                    result.auto_purge = *auto_purge;
                }
            }
        }

        Ok(result)
    }

    fn index_of(definition: &SchemaDefinition, name: &str) -> MeshResult<usize> {
        definition
            .fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| MeshError::validation(format!("field '{}' does not exist", name)))
    }
}
