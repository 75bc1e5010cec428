//! Data model shared by the store, the feed, the dispatcher and the
//! provisioner.

pub mod change;
pub mod ids;
pub mod provision;
pub mod record;

pub use change::{ChangeEvent, ChangeKind, SequenceToken};
pub use ids::{InstanceId, PartitionId, RecordId};
pub use provision::{
    Capability, CapabilityProfile, GrantedRole, IdempotencyKey, ObjectLocator,
    ProvisionRequest, WorkerHandle,
};
pub use record::UploadRecord;
