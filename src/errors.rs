//! Typed error hierarchy for the run lifecycle engine.
//!
//! Two top-level enums cover the two sides of the engine:
//! - `RunError`: everything a caller of the lifecycle API can branch on
//! - `QueueError`: failures talking to the external job queue backend

use thiserror::Error;
use uuid::Uuid;

use crate::run::models::RunStatus;

pub type Result<T, E = RunError> = std::result::Result<T, E>;

/// Errors surfaced by the Run/Task lifecycle operations.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("Project named '{name}' already exists")]
    DuplicateProject { name: String },

    #[error("task_id is already set for run {id}")]
    AlreadyQueued { id: Uuid },

    #[error("Log message cannot contain line returns (either CR or LF)")]
    InvalidLogMessage,

    #[error("Cannot execute this action until all previous pipeline runs are completed.")]
    NotAllowedToStart { id: Uuid },

    #[error("Cannot execute this action until all associated pipeline runs are completed.")]
    RunInProgress { project_id: Uuid },

    #[error("Run {id} cannot be deleted while {status}")]
    NotDeletable { id: Uuid, status: RunStatus },

    #[error("Run {id} cannot be stopped while {status}")]
    NotStoppable { id: Uuid, status: RunStatus },

    #[error("Run {id} task fields are inconsistent: {reason}")]
    LifecycleCorruption { id: Uuid, reason: String },

    #[error("Invalid exit code {exitcode}: exit codes must be zero or positive")]
    InvalidExitCode { exitcode: i32 },

    #[error("Pipeline '{name}' is not registered")]
    UnknownPipeline { name: String },

    #[error("Field runner_version already set to {version}")]
    VersionAlreadySet { version: String },

    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl RunError {
    /// True for errors raised because the requested transition is not legal
    /// from the run's current state.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            RunError::AlreadyQueued { .. }
                | RunError::NotAllowedToStart { .. }
                | RunError::RunInProgress { .. }
                | RunError::NotDeletable { .. }
                | RunError::NotStoppable { .. }
                | RunError::InvalidLogMessage
                | RunError::InvalidExitCode { .. }
        )
    }
}

/// Errors from the job queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job queue unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_already_queued_carries_id() {
        let id = Uuid::new_v4();
        let err = RunError::AlreadyQueued { id };
        match &err {
            RunError::AlreadyQueued { id: got } => assert_eq!(*got, id),
            _ => panic!("Expected AlreadyQueued"),
        }
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn run_error_not_deletable_mentions_status() {
        let err = RunError::NotDeletable {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
        };
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn precondition_violations_are_flagged() {
        assert!(RunError::InvalidLogMessage.is_precondition_violation());
        assert!(RunError::NotAllowedToStart { id: Uuid::nil() }.is_precondition_violation());
        assert!(
            RunError::RunInProgress {
                project_id: Uuid::nil()
            }
            .is_precondition_violation()
        );
        assert!(
            RunError::NotStoppable {
                id: Uuid::nil(),
                status: RunStatus::Success
            }
            .is_precondition_violation()
        );
        assert!(!RunError::RunNotFound { id: Uuid::nil() }.is_precondition_violation());
        assert!(
            !RunError::LifecycleCorruption {
                id: Uuid::nil(),
                reason: "x".into()
            }
            .is_precondition_violation()
        );
    }

    #[test]
    fn queue_error_converts_into_run_error() {
        let err: RunError = QueueError::Unavailable("connection refused".into()).into();
        match &err {
            RunError::Queue(q) => assert!(q.is_unavailable()),
            _ => panic!("Expected RunError::Queue"),
        }
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn database_error_converts_from_anyhow() {
        let err: RunError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, RunError::Database(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&RunError::InvalidLogMessage);
        assert_std_error(&QueueError::Unavailable("x".into()));
    }
}
