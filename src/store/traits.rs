use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{
    Branch, ContainerEdge, ContainerType, EdgeCursor, EdgeKey, FieldContainer, Id, JobError, JobFilter,
    JobStatus, MigrationJob, SchemaKind, SchemaVersion,
};

#[async_trait::async_trait]
pub trait SchemaVersionStore: Send + Sync {
    async fn get_version(&self, id: &Id) -> Result<Option<SchemaVersion>>;
    async fn find_version(&self, kind: SchemaKind, name: &str, version: u32) -> Result<Option<SchemaVersion>>;
    /// First version of the chain (`previous == None`)
    async fn get_root_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>>;
    /// Last version of the chain (`next == None`)
    async fn get_latest_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>>;
    async fn list_names(&self, kind: SchemaKind) -> Result<Vec<String>>;
    /// Insert a version and link it as `next` of its predecessor in one transaction.
    /// Returns false (and writes nothing) if the predecessor already has a
    /// successor, or, for a root version, if the name already has a chain.
    async fn append_version(&self, version: SchemaVersion) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>>;
    /// All branches, or the branches of one project
    async fn list_branches(&self, project_id: Option<&Id>) -> Result<Vec<Branch>>;
    async fn upsert_branch(&self, branch: Branch) -> Result<()>;
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: MigrationJob) -> Result<()>;
    async fn get_job(&self, id: &Id) -> Result<Option<MigrationJob>>;
    /// Matching jobs in creation order
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<MigrationJob>>;
    /// Atomically move the oldest queued job whose scope has no started job
    /// to `Started`. Each job can be claimed by exactly one caller.
    async fn claim_next_job(&self, started_at: DateTime<Utc>) -> Result<Option<MigrationJob>>;
    /// Compare-and-set `Started -> status`; `None` if the job is not started
    async fn finish_job(
        &self,
        id: &Id,
        status: JobStatus,
        error: Option<JobError>,
        stopped_at: DateTime<Utc>,
    ) -> Result<Option<MigrationJob>>;
    async fn delete_jobs_with_status(&self, status: JobStatus) -> Result<usize>;
    /// Delete a job unless it is started; false if missing or started
    async fn delete_job(&self, id: &Id) -> Result<bool>;
    /// Delete every job; `None` (nothing deleted) while any job is started
    async fn clear_jobs(&self) -> Result<Option<usize>>;
}

#[async_trait::async_trait]
pub trait ContainerStore: Send + Sync {
    async fn get_container(&self, id: &Id) -> Result<Option<FieldContainer>>;
    async fn insert_container(&self, container: FieldContainer) -> Result<()>;
    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<ContainerEdge>>;
    async fn set_edge(&self, edge: ContainerEdge) -> Result<()>;
    /// Edges of one branch and type ordered by (node, language), after `after`
    async fn list_edges(
        &self,
        branch_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<ContainerEdge>>;
    /// Like `list_edges`, restricted to edges whose container is at `version_id`
    async fn list_edges_at_version(
        &self,
        branch_id: &Id,
        version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>>;
    /// Like `list_edges`, restricted to containers holding a micronode of `microschema_version_id`
    async fn list_edges_with_micronode_version(
        &self,
        branch_id: &Id,
        microschema_version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>>;
    /// Edges of the branch (any type) pointing at containers of `version_id`
    async fn count_edges_at_version(&self, branch_id: &Id, version_id: &Id) -> Result<usize>;
    async fn count_edges_with_micronode_version(&self, branch_id: &Id, microschema_version_id: &Id) -> Result<usize>;
    /// All containers of a version, including history no edge points at
    async fn count_containers_at_version(&self, version_id: &Id) -> Result<usize>;
    /// In one transaction: insert `successor`, add it to `previous.next` and repoint
    /// the edge. Returns false (nothing written) if the edge no longer points at
    /// `successor.previous`.
    async fn commit_successor(&self, key: &EdgeKey, successor: FieldContainer) -> Result<bool>;
    async fn is_container_referenced(&self, id: &Id) -> Result<bool>;
    /// Remove a history container and splice its neighbours together: every
    /// successor gets the removed container's predecessor, and the
    /// predecessor takes over all of its successors
    async fn delete_container_version(&self, id: &Id) -> Result<bool>;
}

pub trait Store: SchemaVersionStore + BranchStore + JobStore + ContainerStore + Send + Sync {}
