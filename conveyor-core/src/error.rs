//! Error taxonomy for pipeline execution

use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while resolving, executing or reporting a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A runtime parameter is missing, undeclared or outside its declared domain
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// An external command exited with a non-zero status
    #[error("command `{command}` failed with exit code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    /// An external command ran longer than allowed
    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimedOut { command: String, timeout: Duration },

    /// An external command could not be started at all
    #[error("failed to start `{program}`: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A stage body exceeded the stage timeout
    #[error("stage '{stage}' exceeded its timeout of {timeout:?}")]
    StageTimedOut { stage: String, timeout: Duration },

    /// The named credential is not registered in the store
    #[error("credential '{0}' is not registered")]
    CredentialNotFound(String),

    /// The credential exists but has the wrong shape for the requested binding
    #[error("credential '{name}' is not a {expected} credential")]
    CredentialKindMismatch { name: String, expected: &'static str },

    /// Nobody approved the gated stage within the allowed window
    #[error("approval for stage '{stage}' timed out after {timeout:?}")]
    ApprovalTimedOut { stage: String, timeout: Duration },

    /// An approver explicitly rejected the gated stage
    #[error("approval for stage '{stage}' was rejected: {reason}")]
    ApprovalRejected { stage: String, reason: String },

    /// A status event could not be delivered (non-fatal)
    ///
    /// `retryable` is false when repeating the delivery cannot succeed, such
    /// as a rejected token or an unknown commit.
    #[error("status delivery failed: {message}")]
    StatusDeliveryFailed { message: String, retryable: bool },

    /// The end-of-run notification could not be sent (non-fatal)
    #[error("notification failed: {0}")]
    NotificationFailed(String),

    /// A step referenced a variable that is not defined for the run
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// An archive step matched nothing and empty archives are not allowed
    #[error("no files matched archive pattern '{0}'")]
    NothingToArchive(String),

    /// The pipeline definition is structurally invalid
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Exit code of the failed command, if this error came from one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Whether repeating the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StatusDeliveryFailed { retryable, .. } => *retryable,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_exposes_exit_code() {
        let err = PipelineError::CommandFailed {
            command: "make build".to_string(),
            exit_code: 2,
        };
        assert_eq!(err.exit_code(), Some(2));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_only_transient_delivery_failures_are_retryable() {
        let unavailable = PipelineError::StatusDeliveryFailed {
            message: "503 maintenance".to_string(),
            retryable: true,
        };
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.to_string(), "status delivery failed: 503 maintenance");

        let rejected = PipelineError::StatusDeliveryFailed {
            message: "401 bad credentials".to_string(),
            retryable: false,
        };
        assert!(!rejected.is_retryable());
        assert!(!PipelineError::CredentialNotFound("scm-token".to_string()).is_retryable());
    }
}
