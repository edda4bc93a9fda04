use conduit_ops::{OperationKey, SourceError, StartError};
use conduit_protocol::ProblemDetails;

use crate::collaborators::StoreError;
use crate::record::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} is already in progress")]
    Duplicate(OperationKey),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl ControllerError {
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::Validation(_) => "validation_failed",
            ControllerError::Duplicate(_) => "operation_in_progress",
            ControllerError::AlreadyExists(_) => "already_exists",
            ControllerError::NotFound(_) => "not_found",
            ControllerError::Store(_) => "store_error",
            ControllerError::Source(_) => "source_error",
        }
    }

    /// Duplicate starts are a notice for the user, not a failed operation.
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            ControllerError::Duplicate(_) | ControllerError::AlreadyExists(_)
        )
    }
}

impl From<StartError> for ControllerError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Duplicate(key) => ControllerError::Duplicate(key),
            StartError::Transition(err) => {
                ControllerError::Source(SourceError::Rejected(err.to_string()))
            }
        }
    }
}

impl From<&ControllerError> for ProblemDetails {
    fn from(err: &ControllerError) -> Self {
        let (title, status) = match err {
            ControllerError::Validation(_) => ("Invalid Request", 400),
            ControllerError::Duplicate(_) => ("Already In Progress", 409),
            ControllerError::AlreadyExists(_) => ("Already Exists", 409),
            ControllerError::NotFound(_) => ("Not Found", 404),
            ControllerError::Store(_) => ("Store Unavailable", 503),
            ControllerError::Source(_) => ("Upstream Error", 502),
        };
        ProblemDetails::new(err.code(), title, status).with_detail(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_conflict_problem() {
        let err = ControllerError::from(StartError::Duplicate(OperationKey::model_pull("llama3")));
        let problem = ProblemDetails::from(&err);
        assert_eq!(problem.status, 409);
        assert_eq!(problem.code.as_deref(), Some("operation_in_progress"));
        assert!(problem
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("already in progress")));
        assert!(err.is_notice());
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ControllerError::from(ValidationError::single("server x", "url", "required"));
        assert_eq!(ProblemDetails::from(&err).status, 400);
        assert!(!err.is_notice());
    }
}
