use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{MeshError, MeshResult};
use crate::logic::diff::SchemaDiff;
use crate::logic::validate::DefinitionValidator;
use crate::model::{Branch, FieldRename, Id, SchemaDefinition, SchemaKind, SchemaVersion};
use crate::store::schema_cache::{CompiledSchema, SchemaCache};
use crate::store::traits::{BranchStore, SchemaVersionStore, Store};

/// Owns the version chains of schemas and microschemas
pub struct SchemaRegistry<S: Store + ?Sized> {
    store: Arc<S>,
    cache: Arc<SchemaCache>,
}

impl<S: Store + ?Sized> Clone for SchemaRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S: Store + ?Sized> SchemaRegistry<S> {
    pub fn new(store: Arc<S>, cache: Arc<SchemaCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Start a new chain. Fails with a conflict if the name is taken.
    pub async fn create_schema(&self, kind: SchemaKind, definition: SchemaDefinition) -> MeshResult<SchemaVersion> {
        self.check_definition(kind, &definition).await?;

        if self.store.get_root_version(kind, &definition.name).await?.is_some() {
            return Err(MeshError::conflict(format!("{} '{}' already exists", kind, definition.name)));
        }

        let version = SchemaVersion::root(kind, definition);
        if !self.store.append_version(version.clone()).await? {
            return Err(MeshError::conflict(format!("{} '{}' already exists", kind, version.name)));
        }
        self.cache.invalidate(kind, &version.name, version.version).await;

        log::info!("Created {} '{}' v{} ({})", kind, version.name, version.version, version.id);
        Ok(version)
    }

    /// Append a version to an existing chain.
    ///
    /// `expected_version` is the version number the caller based its edit on;
    /// when set and no longer latest the update fails with a conflict.
    pub async fn update_schema(
        &self,
        kind: SchemaKind,
        name: &str,
        definition: SchemaDefinition,
        renames: &[FieldRename],
        expected_version: Option<u32>,
    ) -> MeshResult<SchemaVersion> {
        if definition.name != name {
            return Err(MeshError::validation(format!(
                "{} '{}' cannot be renamed to '{}'",
                kind, name, definition.name
            )));
        }

        let latest = self
            .store
            .get_latest_version(kind, name)
            .await?
            .ok_or_else(|| MeshError::not_found(kind.as_str(), name))?;

        if let Some(expected) = expected_version {
            if expected != latest.version {
                return Err(MeshError::conflict(format!(
                    "{} '{}' is at version {}, update was based on version {}",
                    kind, name, latest.version, expected
                )));
            }
        }

        self.check_definition(kind, &definition).await?;

        let changes = SchemaDiff::diff(&latest.definition, &definition, renames)?;
        if changes.is_empty() {
            return Err(MeshError::validation(format!(
                "{} '{}' has no changes compared to version {}",
                kind, name, latest.version
            )));
        }

        let version = latest.successor(definition, changes);
        if !self.store.append_version(version.clone()).await? {
            return Err(MeshError::conflict(format!(
                "{} '{}' version {} was superseded concurrently",
                kind, name, latest.version
            )));
        }
        self.cache.invalidate(kind, &version.name, version.version).await;

        log::info!(
            "Created {} '{}' v{} ({} change(s))",
            kind,
            version.name,
            version.version,
            version.changes.len()
        );
        Ok(version)
    }

    /// Create the first version of a chain, or append to it if it exists
    pub async fn create_version(
        &self,
        kind: SchemaKind,
        definition: SchemaDefinition,
        renames: &[FieldRename],
    ) -> MeshResult<SchemaVersion> {
        match self.store.get_latest_version(kind, &definition.name).await? {
            Some(latest) => {
                let name = latest.name.clone();
                self.update_schema(kind, &name, definition, renames, None).await
            }
            None if renames.is_empty() => self.create_schema(kind, definition).await,
            None => Err(MeshError::validation("renames require an existing version")),
        }
    }

    async fn check_definition(&self, kind: SchemaKind, definition: &SchemaDefinition) -> MeshResult<()> {
        DefinitionValidator::validate(kind, definition)?;

        for microschema in definition.microschema_references() {
            if self
                .store
                .get_root_version(SchemaKind::Microschema, &microschema)
                .await?
                .is_none()
            {
                return Err(MeshError::validation(format!(
                    "{} '{}' references unknown microschema '{}'",
                    kind, definition.name, microschema
                )));
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &Id) -> MeshResult<SchemaVersion> {
        self.store
            .get_version(id)
            .await?
            .ok_or_else(|| MeshError::not_found("schema version", id.clone()))
    }

    pub async fn find(&self, kind: SchemaKind, name: &str, version: u32) -> MeshResult<SchemaVersion> {
        self.store
            .find_version(kind, name, version)
            .await?
            .ok_or_else(|| MeshError::not_found(kind.as_str(), format!("{}@{}", name, version)))
    }

    pub async fn latest(&self, kind: SchemaKind, name: &str) -> MeshResult<SchemaVersion> {
        self.store
            .get_latest_version(kind, name)
            .await?
            .ok_or_else(|| MeshError::not_found(kind.as_str(), name))
    }

    pub async fn compiled(&self, version: &SchemaVersion) -> MeshResult<Arc<CompiledSchema>> {
        self.cache.get(self.store.as_ref(), version.kind, &version.name, version.version).await
    }

    pub fn chain(&self, kind: SchemaKind, name: &str) -> VersionChain<S> {
        VersionChain::new(self.store.clone(), kind, name)
    }

    /// Versions after `from` up to and including `to`, following `next`.
    /// Fails with a conflict when `to` is not ahead of `from`.
    pub async fn versions_between(&self, from: &SchemaVersion, to: &SchemaVersion) -> MeshResult<Vec<SchemaVersion>> {
        if from.kind != to.kind || from.name != to.name {
            return Err(MeshError::validation(format!(
                "{} '{}' and {} '{}' belong to different chains",
                from.kind, from.name, to.kind, to.name
            )));
        }

        if from.id == to.id {
            return Ok(Vec::new());
        }

        let mut steps = Vec::new();
        let mut cursor = from.next.clone();
        while let Some(id) = cursor {
            let version = self.get(&id).await?;
            cursor = version.next.clone();
            let reached = version.id == to.id;
            steps.push(version);
            if reached {
                return Ok(steps);
            }
        }

        Err(MeshError::conflict(format!(
            "{} '{}' version {} is not ahead of version {}",
            to.kind, to.name, to.version, from.version
        )))
    }

    /// Branches pinning any version of `version`'s chain, with the pinned version
    pub async fn referenced_branches(&self, version: &SchemaVersion) -> MeshResult<Vec<(Branch, SchemaVersion)>> {
        let mut referenced = Vec::new();
        for branch in self.store.list_branches(None).await? {
            let Some(pinned_id) = branch.assigned(version.kind, &version.name).cloned() else {
                continue;
            };
            let pinned = self.get(&pinned_id).await?;
            referenced.push((branch, pinned));
        }
        Ok(referenced)
    }
}

enum ChainCursor {
    Start,
    Next(Id),
    Done,
}

/// Lazy walk over a chain from the root to the latest version.
///
/// Each call to [`VersionChain::next`] loads one version from the store.
pub struct VersionChain<S: Store + ?Sized> {
    store: Arc<S>,
    kind: SchemaKind,
    name: String,
    cursor: ChainCursor,
    seen: HashSet<Id>,
}

impl<S: Store + ?Sized> VersionChain<S> {
    fn new(store: Arc<S>, kind: SchemaKind, name: &str) -> Self {
        Self {
            store,
            kind,
            name: name.to_string(),
            cursor: ChainCursor::Start,
            seen: HashSet::new(),
        }
    }

    pub async fn next(&mut self) -> MeshResult<Option<SchemaVersion>> {
        let version = match &self.cursor {
            ChainCursor::Done => return Ok(None),
            ChainCursor::Start => self.store.get_root_version(self.kind, &self.name).await?,
            ChainCursor::Next(id) => Some(
                self.store
                    .get_version(id)
                    .await?
                    .ok_or_else(|| MeshError::not_found("schema version", id.clone()))?,
            ),
        };

        let Some(version) = version else {
            self.cursor = ChainCursor::Done;
            return Ok(None);
        };
        if !self.seen.insert(version.id.clone()) {
            self.cursor = ChainCursor::Done;
            return Err(MeshError::JobExecution(format!(
                "{} '{}' chain loops back to version {}",
                self.kind, self.name, version.version
            )));
        }

        self.cursor = match &version.next {
            Some(next) => ChainCursor::Next(next.clone()),
            None => ChainCursor::Done,
        };
        Ok(Some(version))
    }

    /// Start again from the root on the next call to `next`
    pub fn restart(&mut self) {
        self.cursor = ChainCursor::Start;
        self.seen.clear();
    }

    pub async fn collect_all(&mut self) -> MeshResult<Vec<SchemaVersion>> {
        let mut versions = Vec::new();
        while let Some(version) = self.next().await? {
            versions.push(version);
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSchema, FieldType, SchemaChange};
    use crate::store::memory::MemoryStore;
    use crate::store::traits::BranchStore;

    fn registry() -> SchemaRegistry<MemoryStore> {
        SchemaRegistry::new(Arc::new(MemoryStore::new()), Arc::new(SchemaCache::new()))
    }

    fn article() -> SchemaDefinition {
        SchemaDefinition::new("article")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("views", FieldType::Number))
    }

    #[tokio::test]
    async fn test_chain_grows_by_one() {
        let registry = registry();
        let v1 = registry.create_version(SchemaKind::Schema, article(), &[]).await.unwrap();
        assert_eq!(v1.version, 1);

        let v2_def = article().with_field(FieldSchema::new("teaser", FieldType::String));
        let v2 = registry.create_version(SchemaKind::Schema, v2_def, &[]).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous.as_deref(), Some(v1.id.as_str()));
        assert!(matches!(&v2.changes[..], [SchemaChange::AddField { .. }]));

        let stored_v1 = registry.get(&v1.id).await.unwrap();
        assert_eq!(stored_v1.next.as_deref(), Some(v2.id.as_str()));

        let mut chain = registry.chain(SchemaKind::Schema, "article");
        let versions = chain.collect_all().await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
        assert!(chain.next().await.unwrap().is_none());

        chain.restart();
        assert_eq!(chain.next().await.unwrap().unwrap().id, v1.id);
    }

    #[tokio::test]
    async fn test_duplicate_create_and_unchanged_update() {
        let registry = registry();
        registry.create_schema(SchemaKind::Schema, article()).await.unwrap();

        let err = registry.create_schema(SchemaKind::Schema, article()).await.unwrap_err();
        assert!(err.is_conflict());

        let err = registry.create_version(SchemaKind::Schema, article(), &[]).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("no changes"));
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let registry = registry();
        registry.create_schema(SchemaKind::Schema, article()).await.unwrap();
        let v2_def = article().with_field(FieldSchema::new("teaser", FieldType::String));
        registry
            .update_schema(SchemaKind::Schema, "article", v2_def, &[], Some(1))
            .await
            .unwrap();

        let v3_def = article().with_field(FieldSchema::new("summary", FieldType::String));
        let err = registry
            .update_schema(SchemaKind::Schema, "article", v3_def, &[], Some(1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unknown_microschema_is_rejected() {
        let registry = registry();
        let definition = article().with_field(FieldSchema::new("teaser", FieldType::Micronode).with_allow(&["quote"]));
        let err = registry.create_schema(SchemaKind::Schema, definition.clone()).await.unwrap_err();
        assert!(err.is_validation());

        let quote = SchemaDefinition::new("quote").with_field(FieldSchema::new("text", FieldType::String));
        registry.create_schema(SchemaKind::Microschema, quote).await.unwrap();
        registry.create_schema(SchemaKind::Schema, definition).await.unwrap();
    }

    #[tokio::test]
    async fn test_versions_between() {
        let registry = registry();
        let v1 = registry.create_schema(SchemaKind::Schema, article()).await.unwrap();
        let v2 = registry
            .create_version(SchemaKind::Schema, article().with_field(FieldSchema::new("a", FieldType::String)), &[])
            .await
            .unwrap();
        let v3 = registry
            .create_version(
                SchemaKind::Schema,
                article()
                    .with_field(FieldSchema::new("a", FieldType::String))
                    .with_field(FieldSchema::new("b", FieldType::String)),
                &[],
            )
            .await
            .unwrap();
        let v1 = registry.get(&v1.id).await.unwrap();

        let steps = registry.versions_between(&v1, &v3).await.unwrap();
        assert_eq!(steps.iter().map(|v| v.id.clone()).collect::<Vec<_>>(), vec![v2.id.clone(), v3.id.clone()]);
        assert!(registry.versions_between(&v1, &v1).await.unwrap().is_empty());

        let v3 = registry.get(&v3.id).await.unwrap();
        let err = registry.versions_between(&v3, &v1).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_referenced_branches() {
        let registry = registry();
        let v1 = registry.create_schema(SchemaKind::Schema, article()).await.unwrap();
        let mut main = Branch::new_initial("project-1".into(), "main".into());
        main.assign(&v1);
        registry.store().upsert_branch(main.clone()).await.unwrap();
        let other = Branch::new_initial("project-1".into(), "empty".into());
        registry.store().upsert_branch(other).await.unwrap();

        let referenced = registry.referenced_branches(&v1).await.unwrap();
        assert_eq!(referenced.len(), 1);
        assert_eq!(referenced[0].0.id, main.id);
        assert_eq!(referenced[0].1.id, v1.id);
    }
}
