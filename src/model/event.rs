use serde::{Deserialize, Serialize};

use crate::model::{Id, JobType, MigrationJob};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum MigrationOutcome {
    Completed,
    Failed { message: String },
}

/// Emitted when a job reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub job_id: Id,
    pub job_type: JobType,
    pub branch_id: Option<Id>,
    #[serde(flatten)]
    pub outcome: MigrationOutcome,
}

impl MigrationEvent {
    pub fn for_job(job: &MigrationJob, outcome: MigrationOutcome) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type(),
            branch_id: job.branch_id().cloned(),
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == MigrationOutcome::Completed
    }
}
