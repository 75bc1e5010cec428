use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{InstanceId, RecordId};
use crate::access::PolicyDocument;

/// Address of a stored object.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Capability requested for a worker. Only one size is offered today.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    #[default]
    Small,
}

/// Resource bundle the allocator is asked for.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub name: String,
    pub instance_type: String,
    pub vcpus: u16,
    pub memory_mib: u32,
}

impl CapabilityProfile {
    pub fn for_capability(capability: Capability, instance_type: &str) -> Self {
        match capability {
            Capability::Small => Self {
                name: "small".to_string(),
                instance_type: instance_type.to_string(),
                vcpus: 1,
                memory_mib: 1024,
            },
        }
    }
}

/// Key used by the provisioner to suppress duplicate launches.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn for_record(record_id: &RecordId) -> Self {
        Self(record_id.to_string())
    }

    pub fn for_revision(record_id: &RecordId, digest: &str) -> Self {
        Self(format!("{record_id}#{digest}"))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub record_id: RecordId,
    pub object_locator: ObjectLocator,
    pub desired_capability: Capability,
    pub timeout_budget: Duration,
    pub idempotency_key: IdempotencyKey,
}

/// Role plus the scoped session policy a worker was launched with.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedRole {
    pub role_name: String,
    pub policy: PolicyDocument,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub instance_id: InstanceId,
    pub record_id: RecordId,
    pub idempotency_key: IdempotencyKey,
    pub granted_role: GrantedRole,
    pub launched_at: DateTime<Utc>,
}
