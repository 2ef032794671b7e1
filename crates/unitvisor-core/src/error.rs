use unitvisor_runtime::{ExecutionError, TransitionError};

use crate::collaborators::CollaboratorError;

/// Broad classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    ApprovalRejected,
    Registry,
    Timeout,
    Crash,
    Operation,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("approval rejected: {0}")]
    ApprovalRejected(String),
    #[error("{0}")]
    Registry(String),
    #[error("unit `{0}` failed to respond to the request in time")]
    Timeout(String),
    #[error("unit `{id}` crashed: {message}")]
    Crashed { id: String, message: String },
    #[error("unit `{0}` crashed with updated source code")]
    CrashedWithUpdatedSource(String),
    #[error("unit `{0}` not found")]
    NotFound(String),
    #[error("unit `{0}` is already started")]
    AlreadyRunning(String),
    #[error("unit `{0}` is not running")]
    NotRunning(String),
    #[error("unit `{0}` is disabled")]
    Disabled(String),
    #[error("unit `{0}` is blocked and cannot be enabled")]
    Blocked(String),
    #[error("unit `{0}` is currently being installed; try again later")]
    Installing(String),
    #[error("too many requests from `{0}` are waiting for the unit to start; try again later")]
    AdmissionRejected(String),
    #[error(
        "unit `{id}@{installed}` is already installed and no version within `{range}` can replace it"
    )]
    NoSatisfyingVersion {
        id: String,
        installed: String,
        range: String,
    },
    #[error("rollback snapshot for unit `{0}` already exists")]
    SnapshotExists(String),
    #[error("no rollback snapshot exists for unit `{0}`")]
    SnapshotMissing(String),
    #[error("active reference count for unit `{0}` is already zero")]
    References(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Collaborator(CollaboratorError),
    #[error("state codec: {0}")]
    Codec(String),
}

impl UnitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitError::Validation(_) | UnitError::NoSatisfyingVersion { .. } => {
                ErrorKind::Validation
            }
            UnitError::Unauthorized(_) => ErrorKind::Authorization,
            UnitError::ApprovalRejected(_) => ErrorKind::ApprovalRejected,
            UnitError::Registry(_) => ErrorKind::Registry,
            UnitError::Timeout(_) => ErrorKind::Timeout,
            UnitError::Crashed { .. }
            | UnitError::CrashedWithUpdatedSource(_)
            | UnitError::Execution(_) => ErrorKind::Crash,
            _ => ErrorKind::Operation,
        }
    }
}

impl From<CollaboratorError> for UnitError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Rejected(reason) => UnitError::ApprovalRejected(reason),
            other => UnitError::Collaborator(other),
        }
    }
}

impl From<serde_json::Error> for UnitError {
    fn from(err: serde_json::Error) -> Self {
        UnitError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_rejections_become_approval_rejections() {
        let err = UnitError::from(CollaboratorError::Rejected("user declined".into()));
        assert_eq!(err.kind(), ErrorKind::ApprovalRejected);
        assert_eq!(err.to_string(), "approval rejected: user declined");

        let err = UnitError::from(CollaboratorError::Unavailable("offline".into()));
        assert_eq!(err.kind(), ErrorKind::Operation);
    }

    #[test]
    fn timeout_message_names_the_unit() {
        let err = UnitError::Timeout("local:slow".into());
        assert_eq!(
            err.to_string(),
            "unit `local:slow` failed to respond to the request in time"
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
