use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InstanceId;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("Provision timed out after {budget:?} waiting for instance {instance_id}")]
    ProvisionTimeout {
        instance_id: String,
        budget: Duration,
    },

    #[error("Compute {operation} did not finish within {budget:?}")]
    AllocatorTimeout {
        operation: &'static str,
        budget: Duration,
    },

    #[error("Worker {instance_id} could not be terminated: {cause}")]
    WorkerLeaked {
        instance_id: InstanceId,
        cause: String,
    },

    #[error("Processing script not found: {0}")]
    ScriptMissing(String),

    #[error("Worker launch failed: {0}")]
    LaunchFailed(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Record conflict: {0}")]
    RecordConflict(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Invalid upload signature")]
    InvalidSignature,

    #[error("Upload location expired: {0}")]
    UploadExpired(String),

    #[error("Upload location already used: {0}")]
    UploadRedeemed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Operator-facing classification of the failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::ObjectNotFound(_)
            | PipelineError::ScriptMissing(_) => ErrorClass::ObjectNotFound,
            PipelineError::AllocationConflict(_) => {
                ErrorClass::AllocationConflict
            }
            PipelineError::ProvisionTimeout { .. }
            | PipelineError::AllocatorTimeout { .. } => {
                ErrorClass::ProvisionTimeout
            }
            PipelineError::WorkerLeaked { .. } => ErrorClass::WorkerLeaked,
            PipelineError::LaunchFailed(_) | PipelineError::TransientIo(_) => {
                ErrorClass::TransientIo
            }
            PipelineError::PermissionDenied(_)
            | PipelineError::InvalidSignature
            | PipelineError::UploadExpired(_) => ErrorClass::PermissionDenied,
            PipelineError::RecordNotFound(_)
            | PipelineError::RecordConflict(_)
            | PipelineError::UploadRedeemed(_)
            | PipelineError::Invalid(_)
            | PipelineError::Serialization(_)
            | PipelineError::Internal(_) => ErrorClass::Invalid,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.class().disposition()
    }

    pub fn is_allocation_conflict(&self) -> bool {
        matches!(self, PipelineError::AllocationConflict(_))
    }

    /// Instance left running because teardown failed.
    pub fn orphaned_instance(&self) -> Option<&InstanceId> {
        match self {
            PipelineError::WorkerLeaked { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}

/// Error taxonomy shared by the dispatcher, the dead-letter channel and the
/// operator surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ObjectNotFound,
    AllocationConflict,
    ProvisionTimeout,
    TransientIo,
    PermissionDenied,
    /// A worker outlived a failed provisioning attempt.
    WorkerLeaked,
    Invalid,
}

impl ErrorClass {
    /// How a failure of this class is handled when it reaches the
    /// dispatcher. `AllocationConflict` is tolerated inside `ensure_role`;
    /// if one escapes past it the event is redelivered. A leaked worker is
    /// never retried, since a redelivery would launch another one.
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorClass::AllocationConflict
            | ErrorClass::ProvisionTimeout
            | ErrorClass::TransientIo => Disposition::Retry,
            ErrorClass::ObjectNotFound
            | ErrorClass::PermissionDenied
            | ErrorClass::WorkerLeaked
            | ErrorClass::Invalid => Disposition::DeadLetter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ObjectNotFound => "object_not_found",
            ErrorClass::AllocationConflict => "allocation_conflict",
            ErrorClass::ProvisionTimeout => "provision_timeout",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::WorkerLeaked => "worker_leaked",
            ErrorClass::Invalid => "invalid",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Retry,
    DeadLetter,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classes_are_dead_lettered() {
        assert_eq!(
            PipelineError::PermissionDenied("x".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            PipelineError::ObjectNotFound("x".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            PipelineError::Invalid("x".into()).disposition(),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn transient_classes_are_retried() {
        assert_eq!(
            PipelineError::TransientIo("x".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            PipelineError::LaunchFailed("x".into()).disposition(),
            Disposition::Retry
        );
        let timeout = PipelineError::ProvisionTimeout {
            instance_id: "i-1".into(),
            budget: Duration::from_secs(1),
        };
        assert_eq!(timeout.class(), ErrorClass::ProvisionTimeout);
        assert_eq!(timeout.disposition(), Disposition::Retry);

        let stalled = PipelineError::AllocatorTimeout {
            operation: "launch",
            budget: Duration::from_secs(1),
        };
        assert_eq!(stalled.disposition(), Disposition::Retry);
    }

    #[test]
    fn leaked_worker_is_dead_lettered_with_its_instance() {
        let instance_id = InstanceId::generate();
        let err = PipelineError::WorkerLeaked {
            instance_id: instance_id.clone(),
            cause: "terminate refused".into(),
        };
        assert_eq!(err.class(), ErrorClass::WorkerLeaked);
        assert_eq!(err.disposition(), Disposition::DeadLetter);
        assert_eq!(err.orphaned_instance(), Some(&instance_id));
        assert!(err.to_string().contains(instance_id.as_str()));
        assert_eq!(
            PipelineError::ScriptMissing("uploads/scripts/process.sh".into()).disposition(),
            Disposition::DeadLetter
        );
    }
}
