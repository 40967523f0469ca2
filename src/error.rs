use crate::model::{ContainerError, Id};

/// Errors surfaced by the schema/migration core.
///
/// Validation, conflict and not-found errors are returned synchronously to
/// the caller. Container errors are collected by the executor and end up on
/// the job; they are never returned from an assignment call.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: Id },

    #[error("container migration failed: {0}")]
    MigrationContainer(ContainerError),

    #[error("job execution failed: {0}")]
    JobExecution(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn validation(message: impl Into<String>) -> Self {
        MeshError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MeshError::Conflict(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<Id>) -> Self {
        MeshError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, MeshError::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MeshError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound { .. })
    }
}
