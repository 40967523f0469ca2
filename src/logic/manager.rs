use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::MigrationConfig;
use crate::error::{MeshError, MeshResult};
use crate::logic::assignment::BranchAssignment;
use crate::logic::executor::MigrationExecutor;
use crate::logic::queue::JobQueue;
use crate::logic::registry::SchemaRegistry;
use crate::logic::usage_hash::MicroschemaUsageHasher;
use crate::model::{
    Branch, FieldRename, Id, JobFilter, MigrationEvent, MigrationJob, SchemaDefinition, SchemaKind, SchemaVersion,
};
use crate::store::schema_cache::SchemaCache;
use crate::store::traits::{BranchStore, Store};

/// Entry point for callers: schema edits, branch assignments, job
/// administration and migration events, all sharing one store, cache,
/// queue and hash memo
pub struct SchemaManager<S: Store + ?Sized + 'static> {
    registry: SchemaRegistry<S>,
    assignment: BranchAssignment<S>,
    queue: JobQueue<S>,
    hasher: Arc<MicroschemaUsageHasher>,
    executor: MigrationExecutor<S>,
}

impl<S: Store + ?Sized + 'static> Clone for SchemaManager<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            assignment: self.assignment.clone(),
            queue: self.queue.clone(),
            hasher: self.hasher.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<S: Store + ?Sized + 'static> SchemaManager<S> {
    pub fn new(store: Arc<S>, config: &MigrationConfig) -> Self {
        let registry = SchemaRegistry::new(store.clone(), Arc::new(SchemaCache::new()));
        let queue = JobQueue::new(store);
        let hasher = Arc::new(MicroschemaUsageHasher::new());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let executor = MigrationExecutor::new(
            registry.clone(),
            queue.clone(),
            hasher.clone(),
            events,
            config.bucket_size,
        );
        let assignment = BranchAssignment::new(registry.clone(), queue.clone(), hasher.clone());
        Self {
            registry,
            assignment,
            queue,
            hasher,
            executor,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry<S> {
        &self.registry
    }

    pub fn assignment(&self) -> &BranchAssignment<S> {
        &self.assignment
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    /// Handle for a [`crate::logic::MigrationWorker`]
    pub fn executor(&self) -> MigrationExecutor<S> {
        self.executor.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.executor.subscribe()
    }

    // Schemas

    pub async fn create_schema(&self, definition: SchemaDefinition) -> MeshResult<SchemaVersion> {
        self.registry.create_schema(SchemaKind::Schema, definition).await
    }

    pub async fn create_microschema(&self, definition: SchemaDefinition) -> MeshResult<SchemaVersion> {
        self.registry.create_schema(SchemaKind::Microschema, definition).await
    }

    pub async fn update_schema(
        &self,
        kind: SchemaKind,
        definition: SchemaDefinition,
        renames: &[FieldRename],
        expected_version: Option<u32>,
    ) -> MeshResult<SchemaVersion> {
        let name = definition.name.clone();
        self.registry
            .update_schema(kind, &name, definition, renames, expected_version)
            .await
    }

    pub async fn versions(&self, kind: SchemaKind, name: &str) -> MeshResult<Vec<SchemaVersion>> {
        self.registry.chain(kind, name).collect_all().await
    }

    // Branches

    pub async fn create_branch(
        &self,
        project_id: &Id,
        name: &str,
        base_branch_id: Option<&Id>,
    ) -> MeshResult<(Branch, Option<MigrationJob>)> {
        self.assignment.create_branch(project_id, name, base_branch_id).await
    }

    /// Pin a schema or microschema version, whichever `version` is
    pub async fn assign_version(
        &self,
        branch_id: &Id,
        version: &SchemaVersion,
        force: bool,
    ) -> MeshResult<Option<MigrationJob>> {
        match version.kind {
            SchemaKind::Schema => self.assignment.assign_schema_version(branch_id, version, force).await,
            SchemaKind::Microschema => {
                self.assignment
                    .assign_microschema_version(branch_id, version, force)
                    .await
            }
        }
    }

    /// Pin the latest version of `name` on the branch
    pub async fn assign_latest(&self, branch_id: &Id, kind: SchemaKind, name: &str) -> MeshResult<Option<MigrationJob>> {
        let latest = self.registry.latest(kind, name).await?;
        self.assign_version(branch_id, &latest, false).await
    }

    pub async fn remaining_count(&self, branch_id: &Id, kind: SchemaKind, name: &str) -> MeshResult<usize> {
        self.assignment.remaining_count(branch_id, kind, name).await
    }

    pub async fn migrate_remaining(&self, branch_id: &Id, kind: SchemaKind) -> MeshResult<Vec<MigrationJob>> {
        self.assignment.migrate_remaining(branch_id, kind).await
    }

    /// Usage hash of a schema version on a branch, by id
    pub async fn compute_hash(
        &self,
        schema_version_id: &Id,
        branch_id: &Id,
        replacements: &BTreeMap<String, Id>,
    ) -> MeshResult<String> {
        let version = self.registry.get(schema_version_id).await?;
        let branch = self
            .registry
            .store()
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| MeshError::not_found("branch", branch_id.clone()))?;
        Ok(self.hasher.compute_hash(&version, &branch, replacements))
    }

    // Jobs

    pub async fn enqueue_version_purge(
        &self,
        project_id: &Id,
        before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> MeshResult<MigrationJob> {
        self.queue.enqueue_version_purge(project_id, before).await
    }

    pub async fn job(&self, job_id: &Id) -> MeshResult<MigrationJob> {
        self.queue.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> MeshResult<Vec<MigrationJob>> {
        self.queue.list(filter).await
    }

    pub async fn retry_job(&self, job_id: &Id) -> MeshResult<MigrationJob> {
        self.queue.retry(job_id).await
    }

    pub async fn delete_job(&self, job_id: &Id) -> MeshResult<()> {
        self.queue.delete(job_id).await
    }

    pub async fn purge_failed_jobs(&self) -> MeshResult<usize> {
        self.queue.purge_failed().await
    }

    pub async fn clear_jobs(&self) -> MeshResult<usize> {
        self.queue.clear().await
    }

    /// Run queued jobs inline until none is eligible
    pub async fn run_pending(&self) -> MeshResult<Vec<MigrationJob>> {
        self.executor.drain().await
    }
}
