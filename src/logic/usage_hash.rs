use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{Branch, Id, SchemaVersion};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    schema_version_id: Id,
    branch_id: Id,
    /// Replacement map in name order
    replacements: Vec<(String, Id)>,
}

/// Fingerprint of the microschema versions a schema version would embed on a
/// branch. Two schema versions hash equal on a branch exactly when every
/// microschema they can embed resolves to the same version.
#[derive(Debug, Default)]
pub struct MicroschemaUsageHasher {
    memo: Mutex<HashMap<MemoKey, String>>,
}

impl MicroschemaUsageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the microschema versions `schema_version` references on `branch`.
    ///
    /// `replacements` (microschema name -> version id) take precedence over the
    /// branch assignments. Names with no assignment at all are left out.
    pub fn compute_hash(
        &self,
        schema_version: &SchemaVersion,
        branch: &Branch,
        replacements: &BTreeMap<String, Id>,
    ) -> String {
        let key = MemoKey {
            schema_version_id: schema_version.id.clone(),
            branch_id: branch.id.clone(),
            replacements: replacements
                .iter()
                .map(|(name, id)| (name.clone(), id.clone()))
                .collect(),
        };
        if let Some(hash) = self.memo.lock().get(&key) {
            return hash.clone();
        }

        // BTreeSet iteration keeps the lines sorted by microschema name
        let mut hasher = Sha256::new();
        for name in schema_version.definition.microschema_references() {
            let Some(version_id) = replacements
                .get(&name)
                .or_else(|| branch.microschema_versions.get(&name))
            else {
                continue;
            };
            hasher.update(format!("{}:{}\n", name, version_id));
        }
        let hash = hex::encode(hasher.finalize());

        self.memo.lock().insert(key, hash.clone());
        hash
    }

    /// Forget every memoized hash computed against `branch_id`
    pub fn invalidate_branch(&self, branch_id: &Id) {
        self.memo.lock().retain(|key, _| &key.branch_id != branch_id);
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }

    /// Names of the micronode fields of `schema_version` that allow `microschema`
    pub fn fields_using_microschema(schema_version: &SchemaVersion, microschema: &str) -> BTreeSet<String> {
        schema_version
            .definition
            .fields
            .iter()
            .filter(|field| field.references_microschemas() && field.allows(microschema))
            .map(|field| field.name.clone())
            .collect()
    }

    pub fn uses_microschema(schema_version: &SchemaVersion, microschema: &str) -> bool {
        !Self::fields_using_microschema(schema_version, microschema).is_empty()
    }
}
