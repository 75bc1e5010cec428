use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ComputeAllocator, InstanceState, LaunchRequest, RoleSpec};
use crate::{
    error::{PipelineError, Result},
    types::InstanceId,
};

/// How launched instances progress when described.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Readiness {
    /// Running on the first describe.
    #[default]
    Immediate,
    /// Pending for this many describes, then running.
    AfterPolls(u32),
    /// Pending forever.
    Never,
    /// Failed on the first describe.
    Fail,
}

/// A launch the allocator accepted.
#[derive(Clone, Debug)]
pub struct LaunchRecord {
    pub instance_id: InstanceId,
    pub request: LaunchRequest,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Instance {
    state: InstanceState,
    pending_polls: Option<u32>,
    fail_on_describe: bool,
}

#[derive(Debug, Default)]
struct AllocatorState {
    roles: HashMap<String, RoleSpec>,
    role_creations: u32,
    instances: HashMap<InstanceId, Instance>,
    launches: Vec<LaunchRecord>,
    terminated: Vec<InstanceId>,
    failing_launches: u32,
    failing_terminations: u32,
}

/// Scriptable allocator used by tests and the local server.
#[derive(Debug, Default)]
pub struct InMemoryComputeAllocator {
    readiness: Mutex<Readiness>,
    state: Mutex<AllocatorState>,
}

impl InMemoryComputeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readiness(readiness: Readiness) -> Self {
        Self {
            readiness: Mutex::new(readiness),
            state: Mutex::default(),
        }
    }

    /// Applies to instances launched after the call.
    pub async fn set_readiness(&self, readiness: Readiness) {
        *self.readiness.lock().await = readiness;
    }

    /// Make the next `count` launches fail with a transient error.
    pub async fn fail_next_launches(&self, count: u32) {
        self.state.lock().await.failing_launches = count;
    }

    /// Make the next `count` terminate calls fail, leaving the instance up.
    pub async fn fail_next_terminations(&self, count: u32) {
        self.state.lock().await.failing_terminations = count;
    }

    /// Register a role as if another deployment had created it.
    pub async fn preexisting_role(&self, spec: RoleSpec) {
        self.state.lock().await.roles.insert(spec.name.clone(), spec);
    }

    pub async fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().await.launches.clone()
    }

    pub async fn launch_count(&self) -> usize {
        self.state.lock().await.launches.len()
    }

    pub async fn terminated(&self) -> Vec<InstanceId> {
        self.state.lock().await.terminated.clone()
    }

    pub async fn role_creations(&self) -> u32 {
        self.state.lock().await.role_creations
    }

    pub async fn has_role(&self, name: &str) -> bool {
        self.state.lock().await.roles.contains_key(name)
    }
}

#[async_trait]
impl ComputeAllocator for InMemoryComputeAllocator {
    async fn create_role(&self, spec: &RoleSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.roles.contains_key(&spec.name) {
            return Err(PipelineError::AllocationConflict(format!(
                "role {} already exists",
                spec.name
            )));
        }
        state.roles.insert(spec.name.clone(), spec.clone());
        state.role_creations += 1;
        Ok(())
    }

    async fn launch(&self, request: LaunchRequest) -> Result<InstanceId> {
        let readiness = *self.readiness.lock().await;
        let mut state = self.state.lock().await;

        if state.failing_launches > 0 {
            state.failing_launches -= 1;
            return Err(PipelineError::LaunchFailed(
                "insufficient capacity".to_string(),
            ));
        }
        if !state.roles.contains_key(&request.role.name) {
            return Err(PipelineError::Invalid(format!(
                "role {} does not exist",
                request.role.name
            )));
        }

        let instance_id = InstanceId::generate();
        let (pending_polls, fail_on_describe) = match readiness {
            Readiness::Immediate => (Some(0), false),
            Readiness::AfterPolls(polls) => (Some(polls), false),
            Readiness::Never => (None, false),
            Readiness::Fail => (Some(0), true),
        };
        state.instances.insert(
            instance_id.clone(),
            Instance {
                state: InstanceState::Pending,
                pending_polls,
                fail_on_describe,
            },
        );
        state.launches.push(LaunchRecord {
            instance_id: instance_id.clone(),
            request,
            launched_at: Utc::now(),
        });
        debug!(%instance_id, "instance launched");
        Ok(instance_id)
    }

    async fn describe(&self, id: &InstanceId) -> Result<InstanceState> {
        let mut state = self.state.lock().await;
        let instance = state.instances.get_mut(id).ok_or_else(|| {
            PipelineError::Invalid(format!("unknown instance {id}"))
        })?;

        if instance.state == InstanceState::Pending {
            if instance.fail_on_describe {
                instance.state = InstanceState::Failed("boot failure".to_string());
            } else if let Some(remaining) = instance.pending_polls.as_mut() {
                if *remaining == 0 {
                    instance.state = InstanceState::Running;
                } else {
                    *remaining -= 1;
                }
            }
        }
        Ok(instance.state.clone())
    }

    async fn terminate(&self, id: &InstanceId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_terminations > 0 {
            state.failing_terminations -= 1;
            return Err(PipelineError::TransientIo(format!(
                "terminate {id} rejected"
            )));
        }
        let instance = state.instances.get_mut(id).ok_or_else(|| {
            PipelineError::Invalid(format!("unknown instance {id}"))
        })?;
        instance.state = InstanceState::Terminated;
        state.terminated.push(id.clone());
        Ok(())
    }
}
