use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::error::{MeshError, MeshResult};
use crate::logic::coerce::{migrate_fields, FieldMigrationError};
use crate::logic::queue::JobQueue;
use crate::logic::registry::SchemaRegistry;
use crate::logic::usage_hash::MicroschemaUsageHasher;
use crate::model::{
    ContainerEdge, ContainerError, ContainerType, EdgeCursor, FieldContainer, FieldValue, Id, JobError, JobKind,
    JobStatus, MigrationEvent, MigrationJob, MigrationOutcome, SchemaChange, SchemaDefinition, SchemaKind,
    SchemaVersion,
};
use crate::store::traits::{BranchStore, ContainerStore, Store};

/// What every container of one job is rewritten with
struct MigrationPlan {
    from: SchemaVersion,
    to: SchemaVersion,
    /// Change sets of every version after `from` up to `to`, in chain order
    changes: Vec<SchemaChange>,
    target: SchemaDefinition,
}

impl MigrationPlan {
    fn container_error(
        &self,
        edge: &ContainerEdge,
        container: &FieldContainer,
        field: Option<String>,
        message: impl Into<String>,
    ) -> ContainerError {
        ContainerError {
            container_id: container.id.clone(),
            node_id: edge.node_id.clone(),
            language: edge.language.clone(),
            container_type: edge.container_type,
            field,
            message: message.into(),
        }
    }

    /// Successor fields for a schema migration
    fn migrate_schema_fields(&self, container: &FieldContainer) -> Result<BTreeMap<String, FieldValue>, FieldMigrationError> {
        migrate_fields(&container.fields, &self.changes, &self.target)
    }

    /// Successor fields for a microschema migration: every micronode of
    /// `from`, held directly or in a list, is rewritten and moved to `to`
    fn migrate_micronodes(&self, container: &FieldContainer) -> Result<BTreeMap<String, FieldValue>, FieldMigrationError> {
        let mut fields = container.fields.clone();
        for (name, value) in fields.iter_mut() {
            let in_field = |error: FieldMigrationError| FieldMigrationError {
                field: Some(match error.field {
                    Some(inner) => format!("{}.{}", name, inner),
                    None => name.clone(),
                }),
                message: error.message,
            };
            match value {
                FieldValue::Micronode(micronode) => self.rewrite_micronode(micronode).map_err(in_field)?,
                FieldValue::List(items) => {
                    for item in items.iter_mut() {
                        if let FieldValue::Micronode(micronode) = item {
                            self.rewrite_micronode(micronode).map_err(in_field)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(fields)
    }

    fn rewrite_micronode(&self, micronode: &mut crate::model::Micronode) -> Result<(), FieldMigrationError> {
        if micronode.version_id != self.from.id {
            return Ok(());
        }
        micronode.fields = migrate_fields(&micronode.fields, &self.changes, &self.target)?;
        micronode.version_id = self.to.id.clone();
        Ok(())
    }
}

/// Runs claimed migration jobs to completion and records their outcome
pub struct MigrationExecutor<S: Store + ?Sized + 'static> {
    registry: SchemaRegistry<S>,
    queue: JobQueue<S>,
    hasher: Arc<MicroschemaUsageHasher>,
    events: broadcast::Sender<MigrationEvent>,
    bucket_size: usize,
}

impl<S: Store + ?Sized + 'static> Clone for MigrationExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            hasher: self.hasher.clone(),
            events: self.events.clone(),
            bucket_size: self.bucket_size,
        }
    }
}

impl<S: Store + ?Sized + 'static> MigrationExecutor<S> {
    pub fn new(
        registry: SchemaRegistry<S>,
        queue: JobQueue<S>,
        hasher: Arc<MicroschemaUsageHasher>,
        events: broadcast::Sender<MigrationEvent>,
        bucket_size: usize,
    ) -> Self {
        Self {
            registry,
            queue,
            hasher,
            events,
            bucket_size: bucket_size.max(1),
        }
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    fn store(&self) -> &Arc<S> {
        self.registry.store()
    }

    /// Run a claimed job and move it to its terminal state.
    ///
    /// Never returns an error: anything that goes wrong ends up on the job.
    /// Returns `None` only if the outcome itself could not be recorded.
    pub async fn process(&self, job: MigrationJob) -> Option<MigrationJob> {
        let finished = match self.execute(&job).await {
            Ok(errors) if errors.is_empty() => self.queue.complete(&job.id).await,
            Ok(errors) => {
                for error in &errors {
                    log::warn!("Job {}: {}", job.id, error);
                }
                self.queue.fail(&job.id, JobError::from_container_errors(errors)).await
            }
            Err(err) => {
                log::error!("Job {} ({}) aborted: {}", job.id, job.job_type(), err);
                self.queue.fail(&job.id, JobError::new(err.to_string())).await
            }
        };

        let finished = match finished {
            Ok(finished) => finished,
            Err(err) => {
                log::error!("Could not record outcome of job {}: {}", job.id, err);
                return None;
            }
        };

        if let Some(branch_id) = finished.branch_id() {
            if finished.status == JobStatus::Completed {
                self.hasher.invalidate_branch(branch_id);
            }
        }

        let outcome = match &finished.error {
            None => MigrationOutcome::Completed,
            Some(error) => MigrationOutcome::Failed {
                message: error.message.clone(),
            },
        };
        // No subscribers is fine
        let _ = self.events.send(MigrationEvent::for_job(&finished, outcome));

        Some(finished)
    }

    /// Claim and process jobs until none is eligible
    pub async fn drain(&self) -> MeshResult<Vec<MigrationJob>> {
        let mut finished = Vec::new();
        while let Some(job) = self.queue.claim_next().await? {
            if let Some(job) = self.process(job).await {
                finished.push(job);
            }
        }
        Ok(finished)
    }

    async fn execute(&self, job: &MigrationJob) -> MeshResult<Vec<ContainerError>> {
        match &job.kind {
            JobKind::Schema {
                branch_id,
                from_version,
                to_version,
            } => {
                let plan = self.plan(SchemaKind::Schema, from_version, to_version).await?;
                self.migrate_branch_content(branch_id, Arc::new(plan)).await
            }
            JobKind::Microschema {
                branch_id,
                from_version,
                to_version,
            } => {
                let plan = self.plan(SchemaKind::Microschema, from_version, to_version).await?;
                self.migrate_branch_content(branch_id, Arc::new(plan)).await
            }
            JobKind::Branch {
                branch_id,
                from_version,
                to_version,
            } => {
                self.copy_base_branch(branch_id).await?;
                match (from_version, to_version) {
                    (Some(from), Some(to)) => {
                        let plan = self.plan(SchemaKind::Schema, from, to).await?;
                        self.migrate_branch_content(branch_id, Arc::new(plan)).await
                    }
                    _ => Ok(Vec::new()),
                }
            }
            JobKind::VersionPurge { project_id, before } => {
                self.purge_versions(project_id, *before).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn plan(&self, kind: SchemaKind, from_id: &Id, to_id: &Id) -> MeshResult<MigrationPlan> {
        let from = self.registry.get(from_id).await?;
        let to = self.registry.get(to_id).await?;
        if from.kind != kind || to.kind != kind {
            return Err(MeshError::JobExecution(format!(
                "{} migration between {} '{}' and {} '{}'",
                kind, from.kind, from.name, to.kind, to.name
            )));
        }

        let steps = self.registry.versions_between(&from, &to).await?;
        self.registry.compiled(&from).await?;
        let target = self.registry.compiled(&to).await?;

        Ok(MigrationPlan {
            changes: steps.into_iter().flat_map(|step| step.changes).collect(),
            target: target.version.definition.clone(),
            from,
            to,
        })
    }

    /// Page through the branch's containers still on `plan.from` and migrate
    /// each bucket concurrently. Failed containers keep their version; the
    /// keyset cursor moves past them so they are not revisited.
    async fn migrate_branch_content(&self, branch_id: &Id, plan: Arc<MigrationPlan>) -> MeshResult<Vec<ContainerError>> {
        if self.store().get_branch(branch_id).await?.is_none() {
            return Err(MeshError::not_found("branch", branch_id.clone()));
        }

        let mut errors = Vec::new();
        let mut migrated = 0usize;
        for container_type in ContainerType::ALL {
            let mut cursor: Option<EdgeCursor> = None;
            loop {
                let page = match plan.from.kind {
                    SchemaKind::Schema => {
                        self.store()
                            .list_edges_at_version(branch_id, &plan.from.id, container_type, cursor.as_ref(), self.bucket_size)
                            .await?
                    }
                    SchemaKind::Microschema => {
                        self.store()
                            .list_edges_with_micronode_version(
                                branch_id,
                                &plan.from.id,
                                container_type,
                                cursor.as_ref(),
                                self.bucket_size,
                            )
                            .await?
                    }
                };
                let Some((last, _)) = page.last() else {
                    break;
                };
                cursor = Some(last.cursor());
                let full_page = page.len() == self.bucket_size;

                let mut bucket = JoinSet::new();
                for (edge, container) in page {
                    let store = self.store().clone();
                    let plan = plan.clone();
                    bucket.spawn(async move { Self::migrate_container(store, edge, container, plan).await });
                }
                while let Some(result) = bucket.join_next().await {
                    match result {
                        Ok(Ok(true)) => migrated += 1,
                        Ok(Ok(false)) => {}
                        Ok(Err(error)) => errors.push(error),
                        Err(err) => return Err(MeshError::JobExecution(format!("container task failed: {}", err))),
                    }
                }

                if !full_page {
                    break;
                }
            }
        }

        log::info!(
            "Migrated {} container(s) of {} '{}' v{} -> v{} on branch {} ({} failed)",
            migrated,
            plan.from.kind,
            plan.from.name,
            plan.from.version,
            plan.to.version,
            branch_id,
            errors.len()
        );
        Ok(errors)
    }

    /// `Ok(false)` when the container needed no work
    async fn migrate_container(
        store: Arc<S>,
        edge: ContainerEdge,
        container: FieldContainer,
        plan: Arc<MigrationPlan>,
    ) -> Result<bool, ContainerError> {
        let fields = match plan.from.kind {
            SchemaKind::Schema => {
                if container.schema_version_id == plan.to.id {
                    return Ok(false);
                }
                plan.migrate_schema_fields(&container)
            }
            SchemaKind::Microschema => {
                if !container.holds_micronode_version(&plan.from.id) {
                    return Ok(false);
                }
                plan.migrate_micronodes(&container)
            }
        }
        .map_err(|error| plan.container_error(&edge, &container, error.field, error.message))?;

        let version_id = match plan.from.kind {
            SchemaKind::Schema => &plan.to.id,
            SchemaKind::Microschema => &container.schema_version_id,
        };
        let successor = container.successor(version_id, fields);

        match store.commit_successor(&edge.key(), successor).await {
            Ok(true) => Ok(true),
            Ok(false) => Err(plan.container_error(&edge, &container, None, "container was modified concurrently")),
            Err(err) => Err(plan.container_error(&edge, &container, None, format!("{:#}", err))),
        }
    }

    /// Point the branch at every container of its base branch, then mark it migrated
    async fn copy_base_branch(&self, branch_id: &Id) -> MeshResult<()> {
        let branch = self
            .store()
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| MeshError::not_found("branch", branch_id.clone()))?;
        if branch.migrated {
            log::debug!("Branch {} already migrated", branch_id);
            return Ok(());
        }
        let base_id = branch
            .base_branch_id
            .clone()
            .ok_or_else(|| MeshError::JobExecution(format!("branch {} has no base branch", branch_id)))?;

        let mut copied = 0usize;
        for container_type in ContainerType::ALL {
            let mut cursor: Option<EdgeCursor> = None;
            loop {
                let page = self
                    .store()
                    .list_edges(&base_id, container_type, cursor.as_ref(), self.bucket_size)
                    .await?;
                let Some(last) = page.last() else {
                    break;
                };
                cursor = Some(last.cursor());
                let full_page = page.len() == self.bucket_size;

                for edge in page {
                    let copy = ContainerEdge {
                        branch_id: branch_id.clone(),
                        ..edge
                    };
                    if self.store().get_edge(&copy.key()).await?.is_none() {
                        self.store().set_edge(copy).await?;
                        copied += 1;
                    }
                }

                if !full_page {
                    break;
                }
            }
        }

        // Re-read so assignments written meanwhile are kept
        let mut branch = self
            .store()
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| MeshError::not_found("branch", branch_id.clone()))?;
        branch.migrated = true;
        self.store().upsert_branch(branch).await?;

        log::info!("Copied {} edge(s) from branch {} to branch {}", copied, base_id, branch_id);
        Ok(())
    }

    /// Delete container history no branch points at, older than `before`
    async fn purge_versions(&self, project_id: &Id, before: Option<DateTime<Utc>>) -> MeshResult<usize> {
        let mut purged = 0usize;
        for branch in self.store().list_branches(Some(project_id)).await? {
            for container_type in ContainerType::ALL {
                let mut cursor: Option<EdgeCursor> = None;
                loop {
                    let page = self
                        .store()
                        .list_edges(&branch.id, container_type, cursor.as_ref(), self.bucket_size)
                        .await?;
                    let Some(last) = page.last() else {
                        break;
                    };
                    cursor = Some(last.cursor());
                    let full_page = page.len() == self.bucket_size;

                    for edge in &page {
                        purged += self.purge_history(&edge.container_id, before).await?;
                    }

                    if !full_page {
                        break;
                    }
                }
            }
        }

        log::info!("Purged {} container version(s) of project {}", purged, project_id);
        Ok(purged)
    }

    async fn purge_history(&self, head_id: &Id, before: Option<DateTime<Utc>>) -> MeshResult<usize> {
        let Some(head) = self.store().get_container(head_id).await? else {
            return Ok(0);
        };

        let mut purged = 0;
        let mut cursor = head.previous;
        while let Some(id) = cursor {
            let Some(container) = self.store().get_container(&id).await? else {
                break;
            };
            cursor = container.previous.clone();

            let old_enough = before.map_or(true, |before| container.created_at < before);
            if old_enough
                && !self.store().is_container_referenced(&container.id).await?
                && self.store().delete_container_version(&container.id).await?
            {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSchema, FieldType, Micronode};
    use crate::store::memory::MemoryStore;
    use crate::store::schema_cache::SchemaCache;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: SchemaRegistry<MemoryStore>,
        executor: MigrationExecutor<MemoryStore>,
    }

    fn fixture(bucket_size: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = SchemaRegistry::new(store.clone(), Arc::new(SchemaCache::new()));
        let queue = JobQueue::new(store.clone());
        let (events, _) = broadcast::channel(16);
        let executor = MigrationExecutor::new(
            registry.clone(),
            queue,
            Arc::new(MicroschemaUsageHasher::new()),
            events,
            bucket_size,
        );
        Fixture {
            store,
            registry,
            executor,
        }
    }

    async fn add_container(store: &MemoryStore, branch_id: &str, node: &str, version: &Id, fields: Vec<(&str, FieldValue)>) {
        let fields = fields.into_iter().map(|(name, value)| (name.to_string(), value)).collect();
        let container = FieldContainer::new(node, "en", version.clone(), fields);
        store.insert_container(container.clone()).await.unwrap();
        store
            .set_edge(ContainerEdge::new(branch_id, &container, ContainerType::Draft))
            .await
            .unwrap();
    }

    async fn branch(store: &MemoryStore) -> Id {
        let branch = crate::model::Branch::new_initial("p-1".into(), "main".into());
        store.upsert_branch(branch.clone()).await.unwrap();
        branch.id
    }

    #[tokio::test]
    async fn test_schema_job_pages_past_failures() {
        let f = fixture(2);
        let branch_id = branch(&f.store).await;
        let v1 = f
            .registry
            .create_schema(
                SchemaKind::Schema,
                SchemaDefinition::new("product").with_field(FieldSchema::new("price", FieldType::String)),
            )
            .await
            .unwrap();
        let v2 = f
            .registry
            .create_version(
                SchemaKind::Schema,
                SchemaDefinition::new("product").with_field(FieldSchema::new("price", FieldType::Number)),
                &[],
            )
            .await
            .unwrap();

        for (node, price) in [("n1", "1"), ("n2", "abc"), ("n3", "3"), ("n4", "4.5"), ("n5", "x")] {
            add_container(&f.store, &branch_id, node, &v1.id, vec![("price", FieldValue::String(price.into()))]).await;
        }

        f.executor
            .queue()
            .enqueue_schema_migration(&branch_id, &v1.id, &v2.id)
            .await
            .unwrap();
        let finished = f.executor.drain().await.unwrap();
        assert_eq!(finished.len(), 1);
        let job = &finished[0];
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.as_ref().unwrap();
        let mut failed: Vec<&str> = error.container_errors.iter().map(|e| e.node_id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["n2", "n5"]);
        assert_eq!(error.container_errors[0].field.as_deref(), Some("price"));

        assert_eq!(f.store.count_edges_at_version(&branch_id, &v2.id).await.unwrap(), 3);
        assert_eq!(f.store.count_edges_at_version(&branch_id, &v1.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let f = fixture(10);
        let branch_id = branch(&f.store).await;
        let v1 = f
            .registry
            .create_schema(
                SchemaKind::Schema,
                SchemaDefinition::new("article").with_field(FieldSchema::new("title", FieldType::String)),
            )
            .await
            .unwrap();
        let v2 = f
            .registry
            .create_version(
                SchemaKind::Schema,
                SchemaDefinition::new("article")
                    .with_field(FieldSchema::new("title", FieldType::String))
                    .with_field(FieldSchema::new("teaser", FieldType::String)),
                &[],
            )
            .await
            .unwrap();
        add_container(&f.store, &branch_id, "n1", &v1.id, vec![("title", FieldValue::String("Hi".into()))]).await;

        for _ in 0..2 {
            f.executor
                .queue()
                .enqueue_schema_migration(&branch_id, &v1.id, &v2.id)
                .await
                .unwrap();
            let finished = f.executor.drain().await.unwrap();
            assert_eq!(finished[0].status, JobStatus::Completed);
        }
        assert_eq!(f.store.count_containers_at_version(&v2.id).await.unwrap(), 1);
        assert_eq!(f.store.count_containers_at_version(&v1.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_microschema_job_rewrites_micronodes() {
        let f = fixture(10);
        let branch_id = branch(&f.store).await;
        let q1 = f
            .registry
            .create_schema(
                SchemaKind::Microschema,
                SchemaDefinition::new("quote").with_field(FieldSchema::new("text", FieldType::String)),
            )
            .await
            .unwrap();
        let page = f
            .registry
            .create_schema(
                SchemaKind::Schema,
                SchemaDefinition::new("page")
                    .with_field(FieldSchema::list("quotes", FieldType::Micronode).with_allow(&["quote"])),
            )
            .await
            .unwrap();
        let q2 = f
            .registry
            .create_version(
                SchemaKind::Microschema,
                SchemaDefinition::new("quote")
                    .with_field(FieldSchema::new("text", FieldType::String))
                    .with_field(FieldSchema::new("author", FieldType::String).with_default(serde_json::json!("anon"))),
                &[],
            )
            .await
            .unwrap();

        let quote = Micronode::new("quote", q1.id.clone()).with_field("text", FieldValue::String("Hello".into()));
        add_container(
            &f.store,
            &branch_id,
            "n1",
            &page.id,
            vec![("quotes", FieldValue::List(vec![FieldValue::Micronode(quote)]))],
        )
        .await;

        let mut events = f.executor.subscribe();
        f.executor
            .queue()
            .enqueue_microschema_migration(&branch_id, &q1.id, &q2.id)
            .await
            .unwrap();
        let finished = f.executor.drain().await.unwrap();
        assert_eq!(finished[0].status, JobStatus::Completed);
        assert!(events.recv().await.unwrap().is_success());

        assert_eq!(f.store.count_edges_with_micronode_version(&branch_id, &q1.id).await.unwrap(), 0);
        let page_v1 = f
            .store
            .list_edges_with_micronode_version(&branch_id, &q2.id, ContainerType::Draft, None, 10)
            .await
            .unwrap();
        let (_, container) = &page_v1[0];
        assert_eq!(container.schema_version_id, page.id);
        let FieldValue::List(items) = &container.fields["quotes"] else {
            panic!("expected a list");
        };
        let FieldValue::Micronode(micronode) = &items[0] else {
            panic!("expected a micronode");
        };
        assert_eq!(micronode.fields["author"], FieldValue::String("anon".into()));
    }

    #[tokio::test]
    async fn test_branch_job_copies_edges() {
        let f = fixture(1);
        let base_id = branch(&f.store).await;
        let base = f.store.get_branch(&base_id).await.unwrap().unwrap();
        for node in ["n1", "n2", "n3"] {
            add_container(&f.store, &base_id, node, &"v1".to_string(), Vec::new()).await;
        }
        let fork = crate::model::Branch::new_from_branch(&base, "feature".into());
        f.store.upsert_branch(fork.clone()).await.unwrap();

        f.executor.queue().enqueue_branch_migration(&fork.id).await.unwrap();
        let finished = f.executor.drain().await.unwrap();
        assert_eq!(finished[0].status, JobStatus::Completed);

        let copied = f.store.list_edges(&fork.id, ContainerType::Draft, None, 10).await.unwrap();
        assert_eq!(copied.len(), 3);
        assert!(f.store.get_branch(&fork.id).await.unwrap().unwrap().migrated);
    }

    #[tokio::test]
    async fn test_unknown_version_fails_job() {
        let f = fixture(10);
        let branch_id = branch(&f.store).await;
        f.executor
            .queue()
            .enqueue_schema_migration(&branch_id, &"missing".to_string(), &"other".to_string())
            .await
            .unwrap();
        let finished = f.executor.drain().await.unwrap();
        assert_eq!(finished[0].status, JobStatus::Failed);
        assert!(finished[0].error.as_ref().unwrap().message.contains("not found"));
    }
}
