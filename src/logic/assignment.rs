use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{MeshError, MeshResult};
use crate::logic::queue::JobQueue;
use crate::logic::registry::SchemaRegistry;
use crate::logic::usage_hash::MicroschemaUsageHasher;
use crate::model::{Branch, Id, MigrationJob, SchemaKind, SchemaVersion};
use crate::store::traits::{BranchStore, ContainerStore, Store};

/// Pins schema and microschema versions to branches and schedules the
/// migrations that follow from a change
pub struct BranchAssignment<S: Store + ?Sized> {
    registry: SchemaRegistry<S>,
    queue: JobQueue<S>,
    hasher: Arc<MicroschemaUsageHasher>,
    locks: Arc<Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>>,
    project_locks: Arc<Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>>,
}

impl<S: Store + ?Sized> Clone for BranchAssignment<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            hasher: self.hasher.clone(),
            locks: self.locks.clone(),
            project_locks: self.project_locks.clone(),
        }
    }
}

impl<S: Store + ?Sized> BranchAssignment<S> {
    pub fn new(registry: SchemaRegistry<S>, queue: JobQueue<S>, hasher: Arc<MicroschemaUsageHasher>) -> Self {
        Self {
            registry,
            queue,
            hasher,
            locks: Arc::new(Mutex::new(HashMap::new())),
            project_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serializes read-modify-write of one branch
    async fn lock_branch(&self, branch_id: &Id) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(branch_id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Serializes branch creation within one project
    async fn lock_project(&self, project_id: &Id) -> OwnedMutexGuard<()> {
        let lock = self.project_locks.lock().entry(project_id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    async fn branch(&self, branch_id: &Id) -> MeshResult<Branch> {
        self.registry
            .store()
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| MeshError::not_found("branch", branch_id.clone()))
    }

    pub async fn assign_schema_version(
        &self,
        branch_id: &Id,
        version: &SchemaVersion,
        force: bool,
    ) -> MeshResult<Option<MigrationJob>> {
        if version.kind != SchemaKind::Schema {
            return Err(MeshError::validation(format!("'{}' is not a schema version", version.name)));
        }
        self.assign(branch_id, version, force).await
    }

    pub async fn assign_microschema_version(
        &self,
        branch_id: &Id,
        version: &SchemaVersion,
        force: bool,
    ) -> MeshResult<Option<MigrationJob>> {
        if version.kind != SchemaKind::Microschema {
            return Err(MeshError::validation(format!("'{}' is not a microschema version", version.name)));
        }
        self.assign(branch_id, version, force).await
    }

    async fn assign(&self, branch_id: &Id, version: &SchemaVersion, force: bool) -> MeshResult<Option<MigrationJob>> {
        let _guard = self.lock_branch(branch_id).await;

        let mut branch = self.branch(branch_id).await?;
        let version = self.registry.get(&version.id).await?;

        let previous = match branch.assigned(version.kind, &version.name) {
            Some(current) if *current == version.id => return Ok(None),
            Some(current) => Some(self.registry.get(current).await?),
            None => None,
        };

        if let (Some(previous), false) = (&previous, force) {
            self.registry.versions_between(previous, &version).await?;
        }

        branch.assign(&version);
        self.registry.store().upsert_branch(branch).await?;
        if version.kind == SchemaKind::Microschema {
            self.hasher.invalidate_branch(branch_id);
        }
        log::info!(
            "Assigned {} '{}' v{} to branch {}",
            version.kind,
            version.name,
            version.version,
            branch_id
        );

        // A forced step backwards leaves existing content alone
        let Some(previous) = previous.filter(|previous| previous.version < version.version) else {
            return Ok(None);
        };
        // Content may still sit on an older version whose job has not run yet
        if self.pending_below(branch_id, &version).await? == 0 {
            return Ok(None);
        }
        let job = self.enqueue_migration(branch_id, &previous, &version).await?;
        Ok(Some(job))
    }

    async fn enqueue_migration(&self, branch_id: &Id, from: &SchemaVersion, to: &SchemaVersion) -> MeshResult<MigrationJob> {
        match to.kind {
            SchemaKind::Schema => self.queue.enqueue_schema_migration(branch_id, &from.id, &to.id).await,
            SchemaKind::Microschema => {
                self.queue
                    .enqueue_microschema_migration(branch_id, &from.id, &to.id)
                    .await
            }
        }
    }

    /// Containers of the branch still on `version`
    async fn pending_count(&self, branch_id: &Id, version: &SchemaVersion) -> MeshResult<usize> {
        let store = self.registry.store();
        let count = match version.kind {
            SchemaKind::Schema => store.count_edges_at_version(branch_id, &version.id).await?,
            SchemaKind::Microschema => store.count_edges_with_micronode_version(branch_id, &version.id).await?,
        };
        Ok(count)
    }

    /// Containers of the branch on any version of the chain older than `version`
    async fn pending_below(&self, branch_id: &Id, version: &SchemaVersion) -> MeshResult<usize> {
        let mut pending = 0;
        for older in self.registry.chain(version.kind, &version.name).collect_all().await? {
            if older.version < version.version {
                pending += self.pending_count(branch_id, &older).await?;
            }
        }
        Ok(pending)
    }

    pub async fn assigned_version(&self, branch_id: &Id, kind: SchemaKind, name: &str) -> MeshResult<SchemaVersion> {
        let branch = self.branch(branch_id).await?;
        let version_id = branch
            .assigned(kind, name)
            .ok_or_else(|| MeshError::not_found(kind.as_str(), format!("{} on branch {}", name, branch_id)))?;
        self.registry.get(version_id).await
    }

    pub async fn assigned_versions(&self, branch_id: &Id, kind: SchemaKind) -> MeshResult<Vec<SchemaVersion>> {
        let branch = self.branch(branch_id).await?;
        let mut versions = Vec::new();
        for version_id in branch.assignments(kind).values() {
            versions.push(self.registry.get(version_id).await?);
        }
        Ok(versions)
    }

    /// Enqueue a migration for every older version that still has content on
    /// the branch, for every pinned schema or microschema
    pub async fn migrate_remaining(&self, branch_id: &Id, kind: SchemaKind) -> MeshResult<Vec<MigrationJob>> {
        let mut jobs = Vec::new();
        for pinned in self.assigned_versions(branch_id, kind).await? {
            let chain = self.registry.chain(kind, &pinned.name).collect_all().await?;
            for older in chain.iter().filter(|version| version.version < pinned.version) {
                if self.pending_count(branch_id, older).await? > 0 {
                    jobs.push(self.enqueue_migration(branch_id, older, &pinned).await?);
                }
            }
        }
        log::info!("Enqueued {} remaining {} migration(s) for branch {}", jobs.len(), kind, branch_id);
        Ok(jobs)
    }

    /// Containers of the branch not yet at the version pinned for `name`
    pub async fn remaining_count(&self, branch_id: &Id, kind: SchemaKind, name: &str) -> MeshResult<usize> {
        let pinned = self.assigned_version(branch_id, kind, name).await?;
        let mut remaining = 0;
        for version in self.registry.chain(kind, name).collect_all().await? {
            if version.id != pinned.id {
                remaining += self.pending_count(branch_id, &version).await?;
            }
        }
        Ok(remaining)
    }

    /// Create a branch in a project. A branch forked from `base_branch_id`
    /// inherits its assignments and gets a branch migration job that copies
    /// the base branch content.
    pub async fn create_branch(
        &self,
        project_id: &Id,
        name: &str,
        base_branch_id: Option<&Id>,
    ) -> MeshResult<(Branch, Option<MigrationJob>)> {
        if name.trim().is_empty() {
            return Err(MeshError::validation("branch name must not be empty"));
        }
        let _project = self.lock_project(project_id).await;
        let store = self.registry.store();
        let existing = store.list_branches(Some(project_id)).await?;
        if existing.iter().any(|branch| branch.name == name) {
            return Err(MeshError::conflict(format!(
                "branch '{}' already exists in project {}",
                name, project_id
            )));
        }

        let branch = match base_branch_id {
            None if existing.is_empty() => Branch::new_initial(project_id.clone(), name.to_string()),
            None => return Err(MeshError::validation("a base branch is required once a project has branches")),
            Some(base_id) => {
                let base = self.branch(base_id).await?;
                if &base.project_id != project_id {
                    return Err(MeshError::validation(format!(
                        "base branch {} belongs to another project",
                        base_id
                    )));
                }
                let mut branch = Branch::new_from_branch(&base, name.to_string());
                branch.latest = true;
                branch
            }
        };

        for other in existing.iter().filter(|other| other.latest) {
            let _guard = self.lock_branch(&other.id).await;
            // Only the flag changes; assignments made since the listing stay
            let mut current = self.branch(&other.id).await?;
            current.latest = false;
            store.upsert_branch(current).await?;
        }
        store.upsert_branch(branch.clone()).await?;
        log::info!("Created branch '{}' ({}) in project {}", branch.name, branch.id, project_id);

        let job = match base_branch_id {
            Some(_) => Some(self.queue.enqueue_branch_migration(&branch.id).await?),
            None => None,
        };
        Ok((branch, job))
    }
}
