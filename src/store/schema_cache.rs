use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

use crate::error::{MeshError, MeshResult};
use crate::logic::validate::DefinitionValidator;
use crate::model::{FieldSchema, SchemaKind, SchemaVersion};
use crate::store::traits::SchemaVersionStore;

/// Validated, indexed form of a stored schema version
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub version: SchemaVersion,
    /// Field name -> position in `version.definition.fields`
    field_index: HashMap<String, usize>,
    pub microschema_refs: BTreeSet<String>,
}

impl CompiledSchema {
    pub fn compile(version: SchemaVersion) -> MeshResult<Self> {
        DefinitionValidator::validate(version.kind, &version.definition)?;
        let field_index = version
            .definition
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.name.clone(), index))
            .collect();
        let microschema_refs = version.definition.microschema_references();
        Ok(Self {
            version,
            field_index,
            microschema_refs,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.field_index
            .get(name)
            .and_then(|index| self.version.definition.fields.get(*index))
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::of(&self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: SchemaKind,
    pub name: String,
    pub version: u32,
}

impl CacheKey {
    pub fn new(kind: SchemaKind, name: impl Into<String>, version: u32) -> Self {
        Self {
            kind,
            name: name.into(),
            version,
        }
    }

    pub fn of(version: &SchemaVersion) -> Self {
        Self::new(version.kind, version.name.clone(), version.version)
    }
}

type Slot = Arc<OnceCell<Arc<CompiledSchema>>>;

/// Compiled schemas keyed by (kind, name, version).
///
/// Entries never expire; writers call [`SchemaCache::invalidate`]. Concurrent
/// misses on one key share a single compilation through the slot's `OnceCell`.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<CacheKey, Slot>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &CacheKey) -> Slot {
        if let Some(slot) = self.entries.read().await.get(key) {
            return slot.clone();
        }
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().clone()
    }

    /// Drop a slot whose initialization failed, unless it was replaced or
    /// filled by a later caller in the meantime
    async fn discard(&self, key: &CacheKey, slot: &Slot) {
        let mut entries = self.entries.write().await;
        if let Some(current) = entries.get(key) {
            if Arc::ptr_eq(current, slot) && !current.initialized() {
                entries.remove(key);
            }
        }
    }

    /// Compiled form of a version, loading it from `store` on a miss
    pub async fn get<S>(
        &self,
        store: &S,
        kind: SchemaKind,
        name: &str,
        version: u32,
    ) -> MeshResult<Arc<CompiledSchema>>
    where
        S: SchemaVersionStore + ?Sized,
    {
        let key = CacheKey::new(kind, name, version);
        let slot = self.slot(&key).await;
        match slot.get_or_try_init(|| Self::load(store, kind, name, version)).await {
            Ok(compiled) => Ok(compiled.clone()),
            Err(err) => {
                self.discard(&key, &slot).await;
                Err(err)
            }
        }
    }

    async fn load<S>(store: &S, kind: SchemaKind, name: &str, version: u32) -> MeshResult<Arc<CompiledSchema>>
    where
        S: SchemaVersionStore + ?Sized,
    {
        log::debug!("Compiling {} '{}' v{}", kind, name, version);
        let stored = store
            .find_version(kind, name, version)
            .await?
            .ok_or_else(|| MeshError::not_found(kind.as_str(), format!("{}@{}", name, version)))?;
        CompiledSchema::compile(stored).map(Arc::new)
    }

    /// Compiled form of an already loaded version
    pub async fn get_for_version(&self, version: &SchemaVersion) -> MeshResult<Arc<CompiledSchema>> {
        let key = CacheKey::of(version);
        let slot = self.slot(&key).await;
        let compiled = slot
            .get_or_try_init(|| async { CompiledSchema::compile(version.clone()).map(Arc::new) })
            .await;
        match compiled {
            Ok(compiled) => Ok(compiled.clone()),
            Err(err) => {
                self.discard(&key, &slot).await;
                Err(err)
            }
        }
    }

    pub async fn invalidate(&self, kind: SchemaKind, name: &str, version: u32) {
        self.entries.write().await.remove(&CacheKey::new(kind, name, version));
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of compiled entries
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, kind: SchemaKind, name: &str, version: u32) -> bool {
        self.entries
            .read()
            .await
            .get(&CacheKey::new(kind, name, version))
            .map_or(false, |slot| slot.initialized())
    }
}
