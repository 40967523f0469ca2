//! In-memory store implementation
//!
//! All state lives behind one `parking_lot::RwLock`. Multi-step writes run
//! through [`MemoryStore::transaction`] under the write lock. Closures check
//! every precondition before their first write, so an `Err` or a refused
//! write leaves the state untouched. Intended for tests and single-process
//! deployments.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use crate::model::{
    Branch, ContainerEdge, ContainerType, EdgeCursor, EdgeKey, FieldContainer, Id, JobError, JobFilter,
    JobStatus, MigrationJob, SchemaKind, SchemaVersion,
};
use crate::store::traits::{BranchStore, ContainerStore, JobStore, SchemaVersionStore, Store};

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    versions: HashMap<Id, SchemaVersion>,
    branches: HashMap<Id, Branch>,
    /// Jobs keyed by insertion sequence, which is creation order
    jobs: BTreeMap<u64, MigrationJob>,
    job_sequence: HashMap<Id, u64>,
    next_sequence: u64,
    containers: HashMap<Id, FieldContainer>,
    edges: BTreeMap<EdgeKey, ContainerEdge>,
}

impl MemoryState {
    fn chain_versions(&self, kind: SchemaKind, name: &str) -> impl Iterator<Item = &SchemaVersion> + '_ {
        let name = name.to_string();
        self.versions
            .values()
            .filter(move |version| version.kind == kind && version.name == name)
    }

    fn job_mut(&mut self, id: &Id) -> Option<&mut MigrationJob> {
        let sequence = self.job_sequence.get(id)?;
        self.jobs.get_mut(sequence)
    }

    fn branch_edges<'a>(
        &'a self,
        branch_id: &'a Id,
        container_type: ContainerType,
        after: Option<&'a EdgeCursor>,
    ) -> impl Iterator<Item = &'a ContainerEdge> + 'a {
        self.edges.values().filter(move |edge| {
            &edge.branch_id == branch_id
                && edge.container_type == container_type
                && after.map_or(true, |cursor| edge.cursor() > *cursor)
        })
    }

    fn with_container(&self, edge: &ContainerEdge) -> Option<(ContainerEdge, FieldContainer)> {
        self.containers
            .get(&edge.container_id)
            .map(|container| (edge.clone(), container.clone()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("version_count", &state.versions.len())
            .field("branch_count", &state.branches.len())
            .field("job_count", &state.jobs.len())
            .field("container_count", &state.containers.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the live state. `f` must finish all
    /// of its checks before it mutates anything.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl SchemaVersionStore for MemoryStore {
    async fn get_version(&self, id: &Id) -> Result<Option<SchemaVersion>> {
        Ok(self.state.read().versions.get(id).cloned())
    }

    async fn find_version(&self, kind: SchemaKind, name: &str, version: u32) -> Result<Option<SchemaVersion>> {
        Ok(self
            .state
            .read()
            .chain_versions(kind, name)
            .find(|candidate| candidate.version == version)
            .cloned())
    }

    async fn get_root_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>> {
        Ok(self
            .state
            .read()
            .chain_versions(kind, name)
            .find(|version| version.previous.is_none())
            .cloned())
    }

    async fn get_latest_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>> {
        Ok(self
            .state
            .read()
            .chain_versions(kind, name)
            .find(|version| version.next.is_none())
            .cloned())
    }

    async fn list_names(&self, kind: SchemaKind) -> Result<Vec<String>> {
        let state = self.state.read();
        let mut names: Vec<String> = state
            .versions
            .values()
            .filter(|version| version.kind == kind && version.previous.is_none())
            .map(|version| version.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn append_version(&self, version: SchemaVersion) -> Result<bool> {
        self.transaction(|state| {
            match &version.previous {
                Some(previous_id) => {
                    let previous = state
                        .versions
                        .get_mut(previous_id)
                        .ok_or_else(|| anyhow!("Previous version not found: {}", previous_id))?;
                    if previous.next.is_some() {
                        return Ok(false);
                    }
                    previous.next = Some(version.id.clone());
                }
                None => {
                    if state.chain_versions(version.kind, &version.name).next().is_some() {
                        return Ok(false);
                    }
                }
            }
            state.versions.insert(version.id.clone(), version);
            Ok(true)
        })
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        Ok(self.state.read().branches.get(id).cloned())
    }

    async fn list_branches(&self, project_id: Option<&Id>) -> Result<Vec<Branch>> {
        let state = self.state.read();
        let mut branches: Vec<Branch> = state
            .branches
            .values()
            .filter(|branch| project_id.map_or(true, |project_id| &branch.project_id == project_id))
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(branches)
    }

    async fn upsert_branch(&self, branch: Branch) -> Result<()> {
        self.state.write().branches.insert(branch.id.clone(), branch);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: MigrationJob) -> Result<()> {
        let mut state = self.state.write();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.job_sequence.insert(job.id.clone(), sequence);
        state.jobs.insert(sequence, job);
        Ok(())
    }

    async fn get_job(&self, id: &Id) -> Result<Option<MigrationJob>> {
        let state = self.state.read();
        Ok(state
            .job_sequence
            .get(id)
            .and_then(|sequence| state.jobs.get(sequence))
            .cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<MigrationJob>> {
        Ok(self
            .state
            .read()
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    async fn claim_next_job(&self, started_at: DateTime<Utc>) -> Result<Option<MigrationJob>> {
        let mut state = self.state.write();
        let busy_scopes: HashSet<String> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Started)
            .map(|job| job.kind.scope())
            .collect();

        let candidate = state
            .jobs
            .iter()
            .find(|(_, job)| job.status == JobStatus::Queued && !busy_scopes.contains(&job.kind.scope()))
            .map(|(sequence, _)| *sequence);

        Ok(candidate.and_then(|sequence| {
            state.jobs.get_mut(&sequence).map(|job| {
                job.status = JobStatus::Started;
                job.started_at = Some(started_at);
                job.clone()
            })
        }))
    }

    async fn finish_job(
        &self,
        id: &Id,
        status: JobStatus,
        error: Option<JobError>,
        stopped_at: DateTime<Utc>,
    ) -> Result<Option<MigrationJob>> {
        let mut state = self.state.write();
        let Some(job) = state.job_mut(id) else {
            return Ok(None);
        };
        if !job.status.can_transition_to(status) || job.status != JobStatus::Started {
            return Ok(None);
        }
        job.status = status;
        job.error = error;
        job.stopped_at = Some(stopped_at);
        Ok(Some(job.clone()))
    }

    async fn delete_jobs_with_status(&self, status: JobStatus) -> Result<usize> {
        let mut state = self.state.write();
        let doomed: Vec<(u64, Id)> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.status == status)
            .map(|(sequence, job)| (*sequence, job.id.clone()))
            .collect();
        for (sequence, id) in &doomed {
            state.jobs.remove(sequence);
            state.job_sequence.remove(id);
        }
        Ok(doomed.len())
    }

    async fn delete_job(&self, id: &Id) -> Result<bool> {
        let mut state = self.state.write();
        let Some(sequence) = state.job_sequence.get(id).copied() else {
            return Ok(false);
        };
        if state.jobs.get(&sequence).map(|job| job.status) == Some(JobStatus::Started) {
            return Ok(false);
        }
        state.jobs.remove(&sequence);
        state.job_sequence.remove(id);
        Ok(true)
    }

    async fn clear_jobs(&self) -> Result<Option<usize>> {
        let mut state = self.state.write();
        if state.jobs.values().any(|job| job.status == JobStatus::Started) {
            return Ok(None);
        }
        let count = state.jobs.len();
        state.jobs.clear();
        state.job_sequence.clear();
        Ok(Some(count))
    }
}

#[async_trait::async_trait]
impl ContainerStore for MemoryStore {
    async fn get_container(&self, id: &Id) -> Result<Option<FieldContainer>> {
        Ok(self.state.read().containers.get(id).cloned())
    }

    async fn insert_container(&self, container: FieldContainer) -> Result<()> {
        self.state.write().containers.insert(container.id.clone(), container);
        Ok(())
    }

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<ContainerEdge>> {
        Ok(self.state.read().edges.get(key).cloned())
    }

    async fn set_edge(&self, edge: ContainerEdge) -> Result<()> {
        let mut state = self.state.write();
        if !state.containers.contains_key(&edge.container_id) {
            return Err(anyhow!("Container not found: {}", edge.container_id));
        }
        state.edges.insert(edge.key(), edge);
        Ok(())
    }

    async fn list_edges(
        &self,
        branch_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<ContainerEdge>> {
        let state = self.state.read();
        let mut edges: Vec<ContainerEdge> = state.branch_edges(branch_id, container_type, after).cloned().collect();
        edges.sort_by_key(|edge| edge.cursor());
        edges.truncate(limit);
        Ok(edges)
    }

    async fn list_edges_at_version(
        &self,
        branch_id: &Id,
        version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>> {
        let state = self.state.read();
        let mut page: Vec<(ContainerEdge, FieldContainer)> = state
            .branch_edges(branch_id, container_type, after)
            .filter_map(|edge| state.with_container(edge))
            .filter(|(_, container)| &container.schema_version_id == version_id)
            .collect();
        page.sort_by_key(|(edge, _)| edge.cursor());
        page.truncate(limit);
        Ok(page)
    }

    async fn list_edges_with_micronode_version(
        &self,
        branch_id: &Id,
        microschema_version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>> {
        let state = self.state.read();
        let mut page: Vec<(ContainerEdge, FieldContainer)> = state
            .branch_edges(branch_id, container_type, after)
            .filter_map(|edge| state.with_container(edge))
            .filter(|(_, container)| container.holds_micronode_version(microschema_version_id))
            .collect();
        page.sort_by_key(|(edge, _)| edge.cursor());
        page.truncate(limit);
        Ok(page)
    }

    async fn count_edges_at_version(&self, branch_id: &Id, version_id: &Id) -> Result<usize> {
        let state = self.state.read();
        Ok(state
            .edges
            .values()
            .filter(|edge| &edge.branch_id == branch_id)
            .filter_map(|edge| state.containers.get(&edge.container_id))
            .filter(|container| &container.schema_version_id == version_id)
            .count())
    }

    async fn count_edges_with_micronode_version(&self, branch_id: &Id, microschema_version_id: &Id) -> Result<usize> {
        let state = self.state.read();
        Ok(state
            .edges
            .values()
            .filter(|edge| &edge.branch_id == branch_id)
            .filter_map(|edge| state.containers.get(&edge.container_id))
            .filter(|container| container.holds_micronode_version(microschema_version_id))
            .count())
    }

    async fn count_containers_at_version(&self, version_id: &Id) -> Result<usize> {
        Ok(self
            .state
            .read()
            .containers
            .values()
            .filter(|container| &container.schema_version_id == version_id)
            .count())
    }

    async fn commit_successor(&self, key: &EdgeKey, successor: FieldContainer) -> Result<bool> {
        self.transaction(|state| {
            let previous_id = successor
                .previous
                .clone()
                .ok_or_else(|| anyhow!("Successor container {} has no predecessor", successor.id))?;
            match state.edges.get(key) {
                Some(edge) if edge.container_id == previous_id => {}
                _ => return Ok(false),
            }
            if state.containers.contains_key(&successor.id) {
                return Err(anyhow!("Container {} already exists", successor.id));
            }
            let previous = state
                .containers
                .get_mut(&previous_id)
                .ok_or_else(|| anyhow!("Container not found: {}", previous_id))?;
            previous.next.insert(successor.id.clone());

            if let Some(edge) = state.edges.get_mut(key) {
                edge.container_id = successor.id.clone();
            }
            state.containers.insert(successor.id.clone(), successor);
            Ok(true)
        })
    }

    async fn is_container_referenced(&self, id: &Id) -> Result<bool> {
        Ok(self.state.read().edges.values().any(|edge| &edge.container_id == id))
    }

    async fn delete_container_version(&self, id: &Id) -> Result<bool> {
        self.transaction(|state| {
            if state.edges.values().any(|edge| &edge.container_id == id) {
                return Err(anyhow!("Container {} is still referenced by a branch", id));
            }
            let Some(removed) = state.containers.remove(id) else {
                return Ok(false);
            };
            if let Some(previous) = removed.previous.as_ref().and_then(|p| state.containers.get_mut(p)) {
                previous.next.remove(&removed.id);
                previous.next.extend(removed.next.iter().cloned());
            }
            for next_id in &removed.next {
                if let Some(next) = state.containers.get_mut(next_id) {
                    next.previous = removed.previous.clone();
                }
            }
            Ok(true)
        })
    }
}

impl Store for MemoryStore {}
