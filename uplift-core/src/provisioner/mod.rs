//! Turns a [`ProvisionRequest`] into a running, narrowly scoped worker.
//!
//! The provisioner holds no locks. Duplicate suppression relies on the
//! [`WorkerLedger`]: a lookup before launching catches plain redeliveries, and
//! a conditional insert after the worker is up settles races between
//! concurrent invocations. The loser of such a race terminates its own
//! instance and hands back the winner's handle.
//!
//! Every allocator call shares the request's timeout budget. A worker that
//! cannot be torn down is reported as [`PipelineError::WorkerLeaked`] so the
//! event is dead-lettered with the instance id instead of launching another.

pub mod ledger;
pub mod script;

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    access::{AccessGuard, Action, PolicyDocument, Resource, Statement},
    compute::{
        BootstrapPayload, ComputeAllocator, InstanceState, LaunchRequest,
        RoleOutcome, RoleSpec,
    },
    config::{ProvisionConfig, StorageConfig},
    error::{PipelineError, Result},
    objects::ObjectStore,
    types::{
        CapabilityProfile, GrantedRole, InstanceId, ObjectLocator,
        ProvisionRequest, WorkerHandle,
    },
};

pub use ledger::{InMemoryWorkerLedger, LedgerInsert, WorkerLedger};
pub use script::{ScriptPublisher, script_locator};

/// Service principal allowed to assume the worker role.
pub const WORKER_TRUSTED_SERVICE: &str = "compute.uplift";

const TEARDOWN_ATTEMPTS: u32 = 3;

/// Bound `operation` by the provisioning deadline.
async fn within<T>(
    deadline: Instant,
    budget: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::AllocatorTimeout { operation, budget }),
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch (or find) the worker for `request`. Safe to call repeatedly
    /// with the same idempotency key.
    async fn provision(&self, request: ProvisionRequest) -> Result<WorkerHandle>;
}

pub struct ComputeProvisioner {
    objects: Arc<dyn ObjectStore>,
    compute: Arc<dyn ComputeAllocator>,
    ledger: Arc<dyn WorkerLedger>,
    guard: AccessGuard,
    config: ProvisionConfig,
    storage: StorageConfig,
}

impl std::fmt::Debug for ComputeProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeProvisioner")
            .field("principal", &self.guard.principal())
            .field("config", &self.config)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl ComputeProvisioner {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        compute: Arc<dyn ComputeAllocator>,
        ledger: Arc<dyn WorkerLedger>,
        guard: AccessGuard,
        config: ProvisionConfig,
        storage: StorageConfig,
    ) -> Self {
        Self {
            objects,
            compute,
            ledger,
            guard,
            config,
            storage,
        }
    }

    /// The shared execution role. Its policy bounds every worker; the session
    /// policy attached to each launch narrows it to one record.
    pub fn role_spec(&self) -> RoleSpec {
        RoleSpec {
            name: self.config.role_name.clone(),
            trusted_service: WORKER_TRUSTED_SERVICE.to_string(),
            policy: PolicyDocument::new(vec![
                Statement::new(
                    [Action::ObjectGet, Action::ObjectHead],
                    [format!("object/{}/*", self.storage.bucket)],
                ),
                Statement::new(
                    [Action::RecordGet, Action::RecordPut],
                    [format!("record/{}/*", self.storage.table_name)],
                ),
            ]),
        }
    }

    fn script_locator(&self) -> ObjectLocator {
        script_locator(&self.config, &self.storage)
    }

    async fn ensure_present(
        &self,
        locator: &ObjectLocator,
        missing: impl FnOnce(String) -> PipelineError,
    ) -> Result<()> {
        self.guard.check(Action::ObjectHead, &Resource::object(locator))?;
        match self.objects.head(locator).await? {
            Some(_) => Ok(()),
            None => Err(missing(locator.to_string())),
        }
    }

    fn session_policy(&self, request: &ProvisionRequest) -> PolicyDocument {
        let mut policy = PolicyDocument::worker_session(
            &request.object_locator,
            &self.storage.table_name,
            &request.record_id,
        );
        policy.statements.push(Statement::new(
            [Action::ObjectGet],
            [Resource::object(&self.script_locator()).to_string()],
        ));
        policy
    }

    fn launch_request(
        &self,
        request: &ProvisionRequest,
        role: RoleSpec,
        session_policy: PolicyDocument,
    ) -> Result<LaunchRequest> {
        let user_data = BootstrapPayload {
            record_id: request.record_id.clone(),
            object: request.object_locator.clone(),
            table_name: self.storage.table_name.clone(),
            script: self.script_locator(),
        }
        .encode()?;

        let mut tags = BTreeMap::new();
        tags.insert("uplift:record-id".to_string(), request.record_id.to_string());
        tags.insert(
            "uplift:idempotency-key".to_string(),
            request.idempotency_key.to_string(),
        );

        Ok(LaunchRequest {
            role,
            profile: CapabilityProfile::for_capability(
                request.desired_capability,
                &self.config.instance_type,
            ),
            user_data,
            session_policy,
            tags,
        })
    }

    async fn wait_until_running(&self, instance_id: &InstanceId) -> Result<()> {
        let resource = Resource::instance(instance_id);
        let interval = self.config.ready_poll_interval();
        loop {
            self.guard.check(Action::InstanceDescribe, &resource)?;
            match self.compute.describe(instance_id).await? {
                InstanceState::Running => return Ok(()),
                InstanceState::Pending => tokio::time::sleep(interval).await,
                InstanceState::Failed(reason) => {
                    return Err(PipelineError::LaunchFailed(format!(
                        "instance {instance_id} failed before running: {reason}"
                    )));
                }
                InstanceState::Terminated => {
                    return Err(PipelineError::LaunchFailed(format!(
                        "instance {instance_id} terminated before running"
                    )));
                }
            }
        }
    }

    /// Terminate a worker that must not keep running. Retried a few times;
    /// if it still stands the instance id is surfaced as `WorkerLeaked`.
    async fn teardown(&self, instance_id: &InstanceId) -> Result<()> {
        let leaked = |cause: String| PipelineError::WorkerLeaked {
            instance_id: instance_id.clone(),
            cause,
        };
        self.guard
            .check(Action::InstanceTerminate, &Resource::instance(instance_id))
            .map_err(|err| leaked(err.to_string()))?;

        let mut attempt = 1;
        loop {
            match self.compute.terminate(instance_id).await {
                Ok(()) => {
                    info!(
                        target: "uplift::provision",
                        %instance_id,
                        "terminated partial worker"
                    );
                    return Ok(());
                }
                Err(err) if attempt < TEARDOWN_ATTEMPTS => {
                    warn!(
                        target: "uplift::provision",
                        %instance_id,
                        attempt,
                        error = %err,
                        "terminate failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.ready_poll_interval()).await;
                }
                Err(err) => {
                    error!(
                        target: "uplift::provision",
                        %instance_id,
                        error = %err,
                        "worker left running after failed teardown"
                    );
                    return Err(leaked(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl Provisioner for ComputeProvisioner {
    #[instrument(
        target = "uplift::provision",
        skip_all,
        fields(record_id = %request.record_id, key = %request.idempotency_key)
    )]
    async fn provision(&self, request: ProvisionRequest) -> Result<WorkerHandle> {
        self.ensure_present(&request.object_locator, PipelineError::ObjectNotFound)
            .await?;

        let window = self.config.idempotency_window();
        if let Some(existing) =
            self.ledger.recent(&request.idempotency_key, window).await?
        {
            debug!(
                target: "uplift::provision",
                instance_id = %existing.instance_id,
                "worker already provisioned"
            );
            return Ok(existing);
        }

        self.ensure_present(&self.script_locator(), PipelineError::ScriptMissing)
            .await?;

        let budget = request.timeout_budget;
        let deadline = Instant::now() + budget;

        let role = self.role_spec();
        let role_resource = Resource::role(&role.name);
        self.guard.check(Action::RoleEnsure, &role_resource)?;
        match within(deadline, budget, "ensure_role", self.compute.ensure_role(&role))
            .await?
        {
            RoleOutcome::Created => {
                info!(target: "uplift::provision", role = %role.name, "execution role created")
            }
            RoleOutcome::Reused => {
                debug!(target: "uplift::provision", role = %role.name, "execution role reused")
            }
        }

        let session_policy = self.session_policy(&request);
        let launch = self.launch_request(&request, role, session_policy.clone())?;
        self.guard.check(Action::RolePass, &role_resource)?;
        self.guard.check(Action::InstanceLaunch, &Resource::new_instance())?;
        let instance_id = within(deadline, budget, "launch", self.compute.launch(launch))
            .await
            .inspect_err(|err| {
                if matches!(err, PipelineError::AllocatorTimeout { .. }) {
                    warn!(
                        target: "uplift::provision",
                        ?budget,
                        "launch did not return; outcome unknown"
                    );
                }
            })?;
        info!(target: "uplift::provision", %instance_id, "worker launched");

        match tokio::time::timeout_at(deadline, self.wait_until_running(&instance_id))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.teardown(&instance_id).await?;
                return Err(err);
            }
            Err(_) => {
                warn!(
                    target: "uplift::provision",
                    %instance_id,
                    ?budget,
                    "worker not running within budget"
                );
                self.teardown(&instance_id).await?;
                return Err(PipelineError::ProvisionTimeout {
                    instance_id: instance_id.to_string(),
                    budget,
                });
            }
        }

        let handle = WorkerHandle {
            instance_id: instance_id.clone(),
            record_id: request.record_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            granted_role: GrantedRole {
                role_name: self.config.role_name.clone(),
                policy: session_policy,
            },
            launched_at: Utc::now(),
        };

        match self.ledger.record(handle.clone(), window).await {
            Ok(LedgerInsert::Recorded) => {
                info!(target: "uplift::provision", %instance_id, "worker running");
                Ok(handle)
            }
            Ok(LedgerInsert::Existing(winner)) => {
                info!(
                    target: "uplift::provision",
                    %instance_id,
                    winner = %winner.instance_id,
                    "lost provisioning race, releasing duplicate worker"
                );
                self.teardown(&instance_id).await?;
                Ok(winner)
            }
            Err(err) => {
                self.teardown(&instance_id).await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::{AuthorizationTable, Principal},
        compute::{InMemoryComputeAllocator, Readiness},
        config::PipelineConfig,
        objects::InMemoryObjectStore,
        types::{Capability, IdempotencyKey, RecordId},
    };

    struct Harness {
        objects: Arc<InMemoryObjectStore>,
        compute: Arc<InMemoryComputeAllocator>,
        ledger: Arc<InMemoryWorkerLedger>,
        provisioner: ComputeProvisioner,
        config: PipelineConfig,
    }

    fn harness(readiness: Readiness) -> Harness {
        harness_with(readiness, AuthorizationTable::standard(&PipelineConfig::default()))
    }

    fn harness_with(readiness: Readiness, table: AuthorizationTable) -> Harness {
        let mut config = PipelineConfig::default();
        config.provision.ready_poll_interval_ms = 1_000;
        let objects = Arc::new(InMemoryObjectStore::new());
        let compute = Arc::new(InMemoryComputeAllocator::with_readiness(readiness));
        let ledger = Arc::new(InMemoryWorkerLedger::new());
        let provisioner = ComputeProvisioner::new(
            objects.clone(),
            compute.clone(),
            ledger.clone(),
            AccessGuard::new(Arc::new(table), Principal::ChangeHandler),
            config.provision.clone(),
            config.storage.clone(),
        );
        Harness {
            objects,
            compute,
            ledger,
            provisioner,
            config,
        }
    }

    fn request(h: &Harness, id: &str) -> ProvisionRequest {
        let record_id = RecordId::new(id).unwrap();
        ProvisionRequest {
            object_locator: ObjectLocator::new(&h.config.storage.bucket, id),
            idempotency_key: IdempotencyKey::for_record(&record_id),
            record_id,
            desired_capability: Capability::Small,
            timeout_budget: Duration::from_secs(10),
        }
    }

    async fn put_object(h: &Harness, id: &str) {
        h.objects
            .put(&ObjectLocator::new(&h.config.storage.bucket, id), b"x".to_vec(), None)
            .await
            .unwrap();
    }

    async fn upload(h: &Harness, id: &str) {
        let script = script_locator(&h.config.provision, &h.config.storage);
        h.objects
            .put(&script, b"#!/bin/sh\n".to_vec(), None)
            .await
            .unwrap();
        put_object(h, id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn launches_scoped_worker_for_existing_object() {
        let h = harness(Readiness::AfterPolls(1));
        upload(&h, "f1").await;

        let handle = h.provisioner.provision(request(&h, "f1")).await.unwrap();
        assert_eq!(handle.record_id.as_str(), "f1");
        assert_eq!(handle.granted_role.role_name, "uplift-worker");

        let launches = h.compute.launches().await;
        assert_eq!(launches.len(), 1);
        let launch = &launches[0].request;
        assert_eq!(launch.profile.instance_type, "t2.micro");
        let own = ObjectLocator::new("uploads", "f1");
        let other = ObjectLocator::new("uploads", "f2");
        let f1 = RecordId::new("f1").unwrap();
        let f2 = RecordId::new("f2").unwrap();
        assert!(launch.permits(Action::ObjectGet, &Resource::object(&own)));
        assert!(launch.permits(Action::RecordPut, &Resource::record("file-table", &f1)));
        assert!(!launch.permits(Action::ObjectGet, &Resource::object(&other)));
        assert!(!launch.permits(Action::RecordPut, &Resource::record("file-table", &f2)));
        assert!(!launch.permits(Action::ObjectPut, &Resource::object(&own)));

        let payload = BootstrapPayload::decode(&launch.user_data).unwrap();
        assert_eq!(payload.record_id, f1);
        assert_eq!(payload.object, own);
        assert_eq!(h.ledger.len().await, 1);
    }

    #[tokio::test]
    async fn missing_object_fails_before_allocation() {
        let h = harness(Readiness::Immediate);
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ObjectNotFound(_)));
        assert_eq!(h.compute.launch_count().await, 0);
        assert!(!h.compute.has_role("uplift-worker").await);
    }

    #[tokio::test]
    async fn missing_script_fails_before_allocation() {
        let h = harness(Readiness::Immediate);
        put_object(&h, "f1").await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        match err {
            PipelineError::ScriptMissing(location) => {
                assert_eq!(location, "uploads/scripts/process.sh");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.compute.launch_count().await, 0);
        assert!(!h.compute.has_role("uplift-worker").await);
    }

    #[tokio::test]
    async fn repeated_request_returns_recorded_handle() {
        let h = harness(Readiness::Immediate);
        upload(&h, "f1").await;
        let first = h.provisioner.provision(request(&h, "f1")).await.unwrap();
        let second = h.provisioner.provision(request(&h, "f1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.compute.launch_count().await, 1);
    }

    #[tokio::test]
    async fn existing_role_is_reused() {
        let h = harness(Readiness::Immediate);
        h.compute.preexisting_role(h.provisioner.role_spec()).await;
        upload(&h, "f1").await;
        h.provisioner.provision(request(&h, "f1")).await.unwrap();
        assert_eq!(h.compute.role_creations().await, 0);
        assert_eq!(h.compute.launch_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_worker_times_out_and_is_terminated() {
        let h = harness(Readiness::Never);
        upload(&h, "f1").await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProvisionTimeout { .. }));

        let launches = h.compute.launches().await;
        assert_eq!(h.compute.terminated().await, vec![launches[0].instance_id.clone()]);
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_is_retried_before_reporting() {
        let h = harness(Readiness::Never);
        upload(&h, "f1").await;
        h.compute.fail_next_terminations(1).await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProvisionTimeout { .. }));
        assert_eq!(h.compute.terminated().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unterminated_worker_is_reported_with_its_instance() {
        let h = harness(Readiness::Never);
        upload(&h, "f1").await;
        h.compute.fail_next_terminations(10).await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();

        let launches = h.compute.launches().await;
        assert_eq!(err.orphaned_instance(), Some(&launches[0].instance_id));
        assert!(matches!(err, PipelineError::WorkerLeaked { .. }));
        assert!(h.compute.terminated().await.is_empty());
        assert!(h.ledger.is_empty().await);
    }

    /// Allocator whose launch call never returns.
    struct StalledLaunch(InMemoryComputeAllocator);

    #[async_trait]
    impl ComputeAllocator for StalledLaunch {
        async fn create_role(&self, spec: &RoleSpec) -> Result<()> {
            self.0.create_role(spec).await
        }

        async fn launch(&self, _request: LaunchRequest) -> Result<InstanceId> {
            std::future::pending().await
        }

        async fn describe(&self, id: &InstanceId) -> Result<InstanceState> {
            self.0.describe(id).await
        }

        async fn terminate(&self, id: &InstanceId) -> Result<()> {
            self.0.terminate(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_launch_is_bounded_by_budget() {
        let h = harness(Readiness::Immediate);
        upload(&h, "f1").await;
        let provisioner = ComputeProvisioner::new(
            h.objects.clone(),
            Arc::new(StalledLaunch(InMemoryComputeAllocator::new())),
            h.ledger.clone(),
            AccessGuard::new(
                Arc::new(AuthorizationTable::standard(&h.config)),
                Principal::ChangeHandler,
            ),
            h.config.provision.clone(),
            h.config.storage.clone(),
        );

        let err = provisioner.provision(request(&h, "f1")).await.unwrap_err();
        match err {
            PipelineError::AllocatorTimeout { operation, budget } => {
                assert_eq!(operation, "launch");
                assert_eq!(budget, Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn boot_failure_is_transient_and_cleaned_up() {
        let h = harness(Readiness::Fail);
        upload(&h, "f1").await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::LaunchFailed(_)));
        assert_eq!(h.compute.terminated().await.len(), 1);
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn missing_grant_is_permission_denied() {
        let h = harness_with(Readiness::Immediate, AuthorizationTable::new());
        upload(&h, "f1").await;
        let err = h.provisioner.provision(request(&h, "f1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::PermissionDenied(_)));
        assert_eq!(h.compute.launch_count().await, 0);
    }

    /// Ledger whose lookup always misses, as if a concurrent invocation
    /// recorded its handle right after our check.
    struct RacingLedger(InMemoryWorkerLedger);

    #[async_trait]
    impl WorkerLedger for RacingLedger {
        async fn recent(
            &self,
            _key: &IdempotencyKey,
            _window: Duration,
        ) -> Result<Option<WorkerHandle>> {
            Ok(None)
        }

        async fn record(
            &self,
            handle: WorkerHandle,
            window: Duration,
        ) -> Result<LedgerInsert> {
            self.0.record(handle, window).await
        }
    }

    #[tokio::test]
    async fn losing_a_race_terminates_own_worker_and_returns_winner() {
        let h = harness(Readiness::Immediate);
        upload(&h, "f1").await;
        let winner = h.provisioner.provision(request(&h, "f1")).await.unwrap();

        let racing = Arc::new(RacingLedger(InMemoryWorkerLedger::new()));
        racing
            .0
            .record(winner.clone(), Duration::from_secs(3_600))
            .await
            .unwrap();
        let loser = ComputeProvisioner::new(
            h.objects.clone(),
            h.compute.clone(),
            racing,
            AccessGuard::new(
                Arc::new(AuthorizationTable::standard(&h.config)),
                Principal::ChangeHandler,
            ),
            h.config.provision.clone(),
            h.config.storage.clone(),
        );

        let handle = loser.provision(request(&h, "f1")).await.unwrap();
        assert_eq!(handle, winner);
        let launches = h.compute.launches().await;
        assert_eq!(launches.len(), 2);
        assert_eq!(h.compute.terminated().await, vec![launches[1].instance_id.clone()]);
    }
}
