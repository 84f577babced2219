use thiserror::Error;

use super::types::{CallerMode, TrackId, TransitionMode};
use crate::ontology::OntologyError;

/// Coarse classification callers use to map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Rejected,
    InvalidConfiguration,
    Internal,
    ServiceUnavailable,
    Conflict,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow track {0} not found")]
    TrackNotFound(TrackId),

    #[error("reference {0} not found")]
    ReferenceNotFound(i64),

    #[error("no transition from '{from}' to '{to}' for {org}")]
    NoTransition { org: String, from: String, to: String },

    #[error("requirement '{requirement}' not met for transition from '{from}' to '{to}'")]
    RequirementNotMet {
        requirement: String,
        from: String,
        to: String,
    },

    #[error("transition rule {rule_id} is {mode} but was requested by a {caller} caller")]
    ModeMismatch {
        rule_id: i64,
        mode: TransitionMode,
        caller: CallerMode,
    },

    #[error("reference {reference_id} already carries '{tag}' for {org}")]
    DuplicateState {
        reference_id: i64,
        org: String,
        tag: String,
    },

    #[error("reference {reference_id} already has a '{process}' track for {org}")]
    ProcessAlreadyTracked {
        reference_id: i64,
        org: String,
        process: String,
    },

    #[error("subtask state inconsistent: {0}")]
    SubtaskInconsistency(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid workflow configuration: {0}")]
    InvalidConfiguration(String),

    #[error("ambiguous transition: rules {rule_ids:?} all match {detail}")]
    AmbiguousTransition { rule_ids: Vec<i64>, detail: String },

    #[error("action '{action}' failed: {source}")]
    ActionFailed {
        action: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("concurrent update of workflow track {0}")]
    Conflict(TrackId),

    #[error("ontology service unavailable: {0}")]
    ServiceUnavailable(#[from] OntologyError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::TrackNotFound(_)
            | WorkflowError::ReferenceNotFound(_)
            | WorkflowError::NoTransition { .. } => ErrorKind::NotFound,
            WorkflowError::RequirementNotMet { .. }
            | WorkflowError::ModeMismatch { .. }
            | WorkflowError::DuplicateState { .. }
            | WorkflowError::ProcessAlreadyTracked { .. }
            | WorkflowError::SubtaskInconsistency(_) => ErrorKind::Rejected,
            WorkflowError::InvalidArgument(_)
            | WorkflowError::InvalidConfiguration(_)
            | WorkflowError::AmbiguousTransition { .. } => ErrorKind::InvalidConfiguration,
            WorkflowError::ActionFailed { .. } | WorkflowError::Storage(_) => ErrorKind::Internal,
            WorkflowError::Conflict(_) => ErrorKind::Conflict,
            WorkflowError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
        }
    }

    /// Structured rejections surface unchanged from actions; anything else
    /// is wrapped so the caller sees which action broke.
    pub fn from_action(action: &str, err: WorkflowError) -> WorkflowError {
        match err.kind() {
            ErrorKind::Internal => match err {
                already @ WorkflowError::ActionFailed { .. } => already,
                other => WorkflowError::ActionFailed {
                    action: action.to_string(),
                    source: Box::new(other),
                },
            },
            _ => err,
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Storage(err.to_string())
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(WorkflowError::TrackNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            WorkflowError::SubtaskInconsistency("x".into()).kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            WorkflowError::AmbiguousTransition {
                rule_ids: vec![1, 2],
                detail: "x".into()
            }
            .kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(WorkflowError::Conflict(3).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_action_errors_wrapped_only_when_internal() {
        let rejected = WorkflowError::from_action(
            "sub_task_complete",
            WorkflowError::SubtaskInconsistency("already complete".into()),
        );
        assert!(matches!(rejected, WorkflowError::SubtaskInconsistency(_)));

        let wrapped = WorkflowError::from_action("add_subtasks", WorkflowError::Storage("disk".into()));
        match wrapped {
            WorkflowError::ActionFailed { action, .. } => assert_eq!(action, "add_subtasks"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
