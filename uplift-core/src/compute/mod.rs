//! Compute allocator seam: execution roles and single-use worker instances.

pub mod bootstrap;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    access::{Action, PolicyDocument, Resource},
    error::Result,
    types::{CapabilityProfile, InstanceId},
};

pub use bootstrap::BootstrapPayload;
pub use memory::{InMemoryComputeAllocator, LaunchRecord, Readiness};

/// Shared execution role the workers assume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub name: String,
    /// Service allowed to assume the role.
    pub trusted_service: String,
    /// Upper bound of what any worker can do; each launch narrows it further
    /// with a session policy.
    pub policy: PolicyDocument,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleOutcome {
    Created,
    Reused,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub role: RoleSpec,
    pub profile: CapabilityProfile,
    /// Base64 JSON [`BootstrapPayload`].
    pub user_data: String,
    pub session_policy: PolicyDocument,
    pub tags: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Effective permission of the launched worker: allowed by the role and
    /// by the session policy.
    pub fn permits(&self, action: Action, resource: &Resource) -> bool {
        self.role.policy.allows(action, resource)
            && self.session_policy.allows(action, resource)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum InstanceState {
    Pending,
    Running,
    Failed(String),
    Terminated,
}

#[async_trait]
pub trait ComputeAllocator: Send + Sync {
    /// Create the role. An existing role is reported as
    /// `AllocationConflict`.
    async fn create_role(&self, spec: &RoleSpec) -> Result<()>;

    /// Create the role if absent. "Already exists" is success.
    async fn ensure_role(&self, spec: &RoleSpec) -> Result<RoleOutcome> {
        match self.create_role(spec).await {
            Ok(()) => Ok(RoleOutcome::Created),
            Err(err) if err.is_allocation_conflict() => Ok(RoleOutcome::Reused),
            Err(err) => Err(err),
        }
    }

    async fn launch(&self, request: LaunchRequest) -> Result<InstanceId>;

    async fn describe(&self, id: &InstanceId) -> Result<InstanceState>;

    async fn terminate(&self, id: &InstanceId) -> Result<()>;
}
