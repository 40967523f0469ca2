use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{MeshError, MeshResult};
use crate::model::{now, Id, JobError, JobFilter, JobKind, JobStatus, MigrationJob};
use crate::store::traits::{JobStore, Store};

/// Persistent FIFO of migration jobs.
///
/// Jobs sharing a scope (a branch, or a project for purges) run one at a time
/// in creation order; different scopes interleave.
pub struct JobQueue<S: Store + ?Sized> {
    store: Arc<S>,
    notify: Arc<Notify>,
}

impl<S: Store + ?Sized> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<S: Store + ?Sized> JobQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Woken whenever a job is enqueued
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn enqueue(&self, kind: JobKind) -> MeshResult<MigrationJob> {
        self.insert(MigrationJob::new(kind)).await
    }

    async fn insert(&self, job: MigrationJob) -> MeshResult<MigrationJob> {
        self.store.insert_job(job.clone()).await?;
        log::debug!("Enqueued {} job {} ({})", job.job_type(), job.id, job.kind.scope());
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(job)
    }

    pub async fn enqueue_schema_migration(&self, branch_id: &Id, from: &Id, to: &Id) -> MeshResult<MigrationJob> {
        self.enqueue(JobKind::Schema {
            branch_id: branch_id.clone(),
            from_version: from.clone(),
            to_version: to.clone(),
        })
        .await
    }

    pub async fn enqueue_microschema_migration(
        &self,
        branch_id: &Id,
        from: &Id,
        to: &Id,
    ) -> MeshResult<MigrationJob> {
        self.enqueue(JobKind::Microschema {
            branch_id: branch_id.clone(),
            from_version: from.clone(),
            to_version: to.clone(),
        })
        .await
    }

    pub async fn enqueue_branch_migration(&self, branch_id: &Id) -> MeshResult<MigrationJob> {
        self.enqueue(JobKind::Branch {
            branch_id: branch_id.clone(),
            from_version: None,
            to_version: None,
        })
        .await
    }

    pub async fn enqueue_version_purge(
        &self,
        project_id: &Id,
        before: Option<DateTime<Utc>>,
    ) -> MeshResult<MigrationJob> {
        self.enqueue(JobKind::VersionPurge {
            project_id: project_id.clone(),
            before,
        })
        .await
    }

    /// Oldest eligible queued job, now started; `None` when nothing is eligible
    pub async fn claim_next(&self) -> MeshResult<Option<MigrationJob>> {
        let job = self.store.claim_next_job(now()).await?;
        if let Some(job) = &job {
            log::info!("Claimed {} job {} ({})", job.job_type(), job.id, job.kind.scope());
        }
        Ok(job)
    }

    pub async fn complete(&self, job_id: &Id) -> MeshResult<MigrationJob> {
        let job = self.finish(job_id, JobStatus::Completed, None).await?;
        log::info!("Completed {} job {}", job.job_type(), job.id);
        Ok(job)
    }

    pub async fn fail(&self, job_id: &Id, error: JobError) -> MeshResult<MigrationJob> {
        let job = self.finish(job_id, JobStatus::Failed, Some(error)).await?;
        log::info!(
            "Failed {} job {}: {}",
            job.job_type(),
            job.id,
            job.error.as_ref().map(|error| error.message.as_str()).unwrap_or_default()
        );
        Ok(job)
    }

    async fn finish(&self, job_id: &Id, status: JobStatus, error: Option<JobError>) -> MeshResult<MigrationJob> {
        match self.store.finish_job(job_id, status, error, now()).await? {
            Some(job) => Ok(job),
            None => {
                let current = self.get(job_id).await?;
                Err(MeshError::conflict(format!(
                    "job {} cannot move from {} to {}",
                    job_id, current.status, status
                )))
            }
        }
    }

    /// Delete every failed job, returning how many were removed
    pub async fn purge_failed(&self) -> MeshResult<usize> {
        let count = self.store.delete_jobs_with_status(JobStatus::Failed).await?;
        log::info!("Purged {} failed job(s)", count);
        Ok(count)
    }

    /// Delete every job; refused while a job is running
    pub async fn clear(&self) -> MeshResult<usize> {
        match self.store.clear_jobs().await? {
            Some(count) => {
                log::info!("Cleared {} job(s)", count);
                Ok(count)
            }
            None => Err(MeshError::conflict("cannot clear the job queue while a job is running")),
        }
    }

    pub async fn get(&self, job_id: &Id) -> MeshResult<MigrationJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| MeshError::not_found("job", job_id.clone()))
    }

    pub async fn list(&self, filter: &JobFilter) -> MeshResult<Vec<MigrationJob>> {
        Ok(self.store.list_jobs(filter).await?)
    }

    pub async fn delete(&self, job_id: &Id) -> MeshResult<()> {
        if self.store.delete_job(job_id).await? {
            return Ok(());
        }
        let job = self.get(job_id).await?;
        Err(MeshError::conflict(format!("job {} is {} and cannot be deleted", job.id, job.status)))
    }

    /// Enqueue a fresh copy of a failed job
    pub async fn retry(&self, job_id: &Id) -> MeshResult<MigrationJob> {
        let failed = self.get(job_id).await?;
        if failed.status != JobStatus::Failed {
            return Err(MeshError::conflict(format!(
                "only failed jobs can be retried, job {} is {}",
                failed.id, failed.status
            )));
        }
        let mut job = MigrationJob::new(failed.kind.clone());
        job.retry_of = Some(failed.id.clone());
        self.insert(job).await
    }
}
