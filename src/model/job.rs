use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{generate_id, now, ContainerType, Id};

/// Job state machine: `Queued -> Started -> {Completed | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "started" => Some(JobStatus::Started),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Started)
                | (JobStatus::Started, JobStatus::Completed)
                | (JobStatus::Started, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Schema,
    Microschema,
    Branch,
    VersionPurge,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Schema => "schema",
            JobType::Microschema => "microschema",
            JobType::Branch => "branch",
            JobType::VersionPurge => "versionpurge",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job payload; the variant determines the job type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    Schema {
        branch_id: Id,
        from_version: Id,
        to_version: Id,
    },
    Microschema {
        branch_id: Id,
        from_version: Id,
        to_version: Id,
    },
    Branch {
        branch_id: Id,
        #[serde(default)]
        from_version: Option<Id>,
        #[serde(default)]
        to_version: Option<Id>,
    },
    VersionPurge {
        project_id: Id,
        /// Only containers created before this instant are purged
        #[serde(default)]
        before: Option<DateTime<Utc>>,
    },
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Schema { .. } => JobType::Schema,
            JobKind::Microschema { .. } => JobType::Microschema,
            JobKind::Branch { .. } => JobType::Branch,
            JobKind::VersionPurge { .. } => JobType::VersionPurge,
        }
    }

    pub fn branch_id(&self) -> Option<&Id> {
        match self {
            JobKind::Schema { branch_id, .. }
            | JobKind::Microschema { branch_id, .. }
            | JobKind::Branch { branch_id, .. } => Some(branch_id),
            JobKind::VersionPurge { .. } => None,
        }
    }

    /// Ordering scope: jobs sharing a scope run one at a time in creation order
    pub fn scope(&self) -> String {
        match self {
            JobKind::VersionPurge { project_id, .. } => format!("project:{}", project_id),
            _ => format!("branch:{}", self.branch_id().map(String::as_str).unwrap_or_default()),
        }
    }
}

/// Per-container failure collected during a migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerError {
    pub container_id: Id,
    pub node_id: Id,
    pub language: String,
    pub container_type: ContainerType,
    pub field: Option<String>,
    pub message: String,
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container {} (node {}, {}, {})",
            self.container_id, self.node_id, self.language, self.container_type
        )?;
        if let Some(field) = &self.field {
            write!(f, " field '{}'", field)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Failure detail recorded on a failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default)]
    pub container_errors: Vec<ContainerError>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            container_errors: Vec::new(),
        }
    }

    pub fn from_container_errors(container_errors: Vec<ContainerError>) -> Self {
        Self {
            message: format!("{} container(s) failed to migrate", container_errors.len()),
            container_errors,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Id,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Failed job this one re-enqueues
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Id>,
}

impl MigrationJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: generate_id(),
            kind,
            status: JobStatus::Queued,
            created_at: now(),
            started_at: None,
            stopped_at: None,
            error: None,
            retry_of: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    pub fn branch_id(&self) -> Option<&Id> {
        self.kind.branch_id()
    }
}

/// Criteria for listing jobs; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub branch_id: Option<Id>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &MigrationJob) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self.job_type.map_or(true, |job_type| job.job_type() == job_type)
            && self
                .branch_id
                .as_ref()
                .map_or(true, |branch_id| job.branch_id() == Some(branch_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Started));
        assert!(JobStatus::Started.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Started));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_kind_json_and_scope() {
        let kind = JobKind::VersionPurge {
            project_id: "p-1".into(),
            before: None,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "versionpurge");
        assert_eq!(kind.job_type(), JobType::VersionPurge);
        assert_eq!(kind.scope(), "project:p-1");
        assert!(kind.branch_id().is_none());

        let kind = JobKind::Schema {
            branch_id: "b-1".into(),
            from_version: "v1".into(),
            to_version: "v2".into(),
        };
        assert_eq!(kind.scope(), "branch:b-1");
        let back: JobKind = serde_json::from_value(serde_json::to_value(&kind).unwrap()).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_filter_matches() {
        let job = MigrationJob::new(JobKind::Microschema {
            branch_id: "b-1".into(),
            from_version: "m1".into(),
            to_version: "m2".into(),
        });
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::with_status(JobStatus::Queued).matches(&job));
        assert!(!JobFilter::with_status(JobStatus::Failed).matches(&job));

        let filter = JobFilter {
            job_type: Some(JobType::Microschema),
            branch_id: Some("b-2".into()),
            ..JobFilter::default()
        };
        assert!(!filter.matches(&job));
    }
}
