//! Change dispatcher: decides which record mutations provision a worker and
//! turns provisioning failures into retry or dead-letter verdicts.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, warn, Instrument};

use crate::{
    config::{PipelineConfig, TriggerPolicy},
    error::{Disposition, ErrorClass, PipelineError, Result},
    provisioner::Provisioner,
    types::{
        Capability, ChangeEvent, ChangeKind, IdempotencyKey, InstanceId, ObjectLocator,
        ProvisionRequest, UploadRecord, WorkerHandle,
    },
};

/// Why an event did not provision anything.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The record was deleted.
    Removal,
    /// An update under [`TriggerPolicy::FirstSeenOnly`].
    AlreadySeen,
    /// An update that left the attributes unchanged.
    NoOpUpdate,
}

/// Outcome of dispatching a single change event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Provisioned(WorkerHandle),
    Skipped(SkipReason),
    Retry { error: String, class: ErrorClass },
    DeadLetter {
        error: String,
        class: ErrorClass,
        orphaned_instance: Option<InstanceId>,
    },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(self, DispatchStatus::Retry { .. })
    }

    fn from_error(err: PipelineError) -> Self {
        let class = err.class();
        let orphaned_instance = err.orphaned_instance().cloned();
        let error = err.to_string();
        match class.disposition() {
            Disposition::Retry => {
                debug!(target: "uplift::dispatch", %error, class = class.as_str(), "provisioning failed, will retry");
                DispatchStatus::Retry { error, class }
            }
            Disposition::DeadLetter => {
                warn!(target: "uplift::dispatch", %error, class = class.as_str(), "dead-lettering event due to fatal error");
                DispatchStatus::DeadLetter {
                    error,
                    class,
                    orphaned_instance,
                }
            }
        }
    }
}

/// Contract the pipeline runtime drives for every delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent) -> DispatchStatus;
}

enum Plan {
    Skip(SkipReason),
    Provision(ProvisionRequest),
}

pub struct ChangeDispatcher {
    provisioner: Arc<dyn Provisioner>,
    policy: TriggerPolicy,
    bucket: String,
    object_prefix: String,
    capability: Capability,
    timeout_budget: Duration,
}

impl std::fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDispatcher")
            .field("policy", &self.policy)
            .field("bucket", &self.bucket)
            .field("timeout_budget", &self.timeout_budget)
            .finish_non_exhaustive()
    }
}

impl ChangeDispatcher {
    pub fn new(provisioner: Arc<dyn Provisioner>, config: &PipelineConfig) -> Self {
        Self {
            provisioner,
            policy: config.trigger,
            bucket: config.storage.bucket.clone(),
            object_prefix: config.storage.object_prefix.clone(),
            capability: Capability::Small,
            timeout_budget: config.provision.timeout_budget(),
        }
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    fn plan(&self, event: &ChangeEvent) -> Result<Plan> {
        let new_image = match event.kind() {
            ChangeKind::Remove => return Ok(Plan::Skip(SkipReason::Removal)),
            ChangeKind::Insert | ChangeKind::Modify => {
                self.validated_image(event)?
            }
        };

        let key = match (self.policy, event.kind()) {
            (TriggerPolicy::FirstSeenOnly, ChangeKind::Modify) => {
                return Ok(Plan::Skip(SkipReason::AlreadySeen));
            }
            (TriggerPolicy::FirstSeenOnly, _) => {
                IdempotencyKey::for_record(&event.record_id)
            }
            (TriggerPolicy::OnAttributeChange, kind) => {
                if kind == ChangeKind::Modify
                    && event
                        .old_image
                        .as_ref()
                        .is_some_and(|old| old.attributes == new_image.attributes)
                {
                    return Ok(Plan::Skip(SkipReason::NoOpUpdate));
                }
                IdempotencyKey::for_revision(
                    &event.record_id,
                    &new_image.attributes_digest(),
                )
            }
        };

        Ok(Plan::Provision(ProvisionRequest {
            record_id: event.record_id.clone(),
            object_locator: ObjectLocator::new(
                &self.bucket,
                format!("{}{}", self.object_prefix, event.record_id),
            ),
            desired_capability: self.capability,
            timeout_budget: self.timeout_budget,
            idempotency_key: key,
        }))
    }

    fn validated_image<'a>(&self, event: &'a ChangeEvent) -> Result<&'a UploadRecord> {
        let image = event.new_image.as_ref().ok_or_else(|| {
            PipelineError::Invalid("change event without new image".into())
        })?;
        if image.id != event.record_id {
            return Err(PipelineError::Invalid(format!(
                "new image id {} does not match record id {}",
                image.id, event.record_id
            )));
        }
        Ok(image)
    }
}

#[async_trait]
impl EventHandler for ChangeDispatcher {
    async fn handle(&self, event: &ChangeEvent) -> DispatchStatus {
        let span = debug_span!(
            target: "uplift::dispatch",
            "dispatch",
            event_id = %event.event_id,
            record_id = %event.record_id,
            partition = %event.partition(),
            sequence = event.sequence_token.sequence,
        );

        async {
            let request = match self.plan(event) {
                Ok(Plan::Skip(reason)) => {
                    debug!(target: "uplift::dispatch", ?reason, "event skipped");
                    return DispatchStatus::Skipped(reason);
                }
                Ok(Plan::Provision(request)) => request,
                Err(err) => return DispatchStatus::from_error(err),
            };

            match self.provisioner.provision(request).await {
                Ok(handle) => {
                    debug!(
                        target: "uplift::dispatch",
                        instance_id = %handle.instance_id,
                        "event provisioned"
                    );
                    DispatchStatus::Provisioned(handle)
                }
                Err(err) => DispatchStatus::from_error(err),
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        access::PolicyDocument,
        types::{GrantedRole, InstanceId, PartitionId, RecordId, SequenceToken},
    };

    #[derive(Default)]
    struct RecordingProvisioner {
        requests: Mutex<Vec<ProvisionRequest>>,
        fail_with: Mutex<Option<fn() -> PipelineError>>,
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(&self, request: ProvisionRequest) -> Result<WorkerHandle> {
            if let Some(fail) = *self.fail_with.lock().await {
                return Err(fail());
            }
            self.requests.lock().await.push(request.clone());
            Ok(WorkerHandle {
                instance_id: InstanceId("i-test".into()),
                record_id: request.record_id,
                idempotency_key: request.idempotency_key,
                granted_role: GrantedRole {
                    role_name: "uplift-worker".into(),
                    policy: PolicyDocument::default(),
                },
                launched_at: Utc::now(),
            })
        }
    }

    fn record(id: &str, name: &str) -> UploadRecord {
        UploadRecord::new(RecordId::new(id).unwrap()).with_attribute("name", name)
    }

    fn event(old: Option<UploadRecord>, new: Option<UploadRecord>) -> ChangeEvent {
        let id = new
            .as_ref()
            .or(old.as_ref())
            .map(|r| r.id.clone())
            .unwrap();
        ChangeEvent::new(id, old, new, SequenceToken::new(PartitionId(0), 1))
    }

    fn dispatcher(
        policy: TriggerPolicy,
    ) -> (ChangeDispatcher, Arc<RecordingProvisioner>) {
        let provisioner = Arc::new(RecordingProvisioner::default());
        let mut config = PipelineConfig::default();
        config.trigger = policy;
        (ChangeDispatcher::new(provisioner.clone(), &config), provisioner)
    }

    #[tokio::test]
    async fn insert_provisions_with_record_key() {
        let (dispatcher, provisioner) = dispatcher(TriggerPolicy::FirstSeenOnly);
        let status = dispatcher.handle(&event(None, Some(record("f1", "a.csv")))).await;
        assert!(matches!(status, DispatchStatus::Provisioned(ref h) if h.record_id.as_str() == "f1"));

        let requests = provisioner.requests.lock().await;
        assert_eq!(requests[0].idempotency_key.0, "f1");
        assert_eq!(requests[0].object_locator, ObjectLocator::new("uploads", "f1"));
        assert_eq!(requests[0].desired_capability, Capability::Small);
        assert_eq!(requests[0].timeout_budget, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn first_seen_only_skips_every_update() {
        let (dispatcher, provisioner) = dispatcher(TriggerPolicy::FirstSeenOnly);
        let same = dispatcher
            .handle(&event(Some(record("f1", "a.csv")), Some(record("f1", "a.csv"))))
            .await;
        let changed = dispatcher
            .handle(&event(Some(record("f1", "a.csv")), Some(record("f1", "b.csv"))))
            .await;
        assert_eq!(same, DispatchStatus::Skipped(SkipReason::AlreadySeen));
        assert_eq!(changed, DispatchStatus::Skipped(SkipReason::AlreadySeen));
        assert!(provisioner.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn attribute_change_policy_provisions_new_revisions_only() {
        let (dispatcher, provisioner) = dispatcher(TriggerPolicy::OnAttributeChange);
        let same = dispatcher
            .handle(&event(Some(record("f1", "a.csv")), Some(record("f1", "a.csv"))))
            .await;
        assert_eq!(same, DispatchStatus::Skipped(SkipReason::NoOpUpdate));

        let changed = dispatcher
            .handle(&event(Some(record("f1", "a.csv")), Some(record("f1", "b.csv"))))
            .await;
        assert!(matches!(changed, DispatchStatus::Provisioned(_)));
        let requests = provisioner.requests.lock().await;
        let expected = format!("f1#{}", record("f1", "b.csv").attributes_digest());
        assert_eq!(requests[0].idempotency_key.0, expected);
    }

    #[tokio::test]
    async fn removals_are_skipped() {
        let (dispatcher, _) = dispatcher(TriggerPolicy::OnAttributeChange);
        let status = dispatcher.handle(&event(Some(record("f1", "a.csv")), None)).await;
        assert_eq!(status, DispatchStatus::Skipped(SkipReason::Removal));
    }

    #[tokio::test]
    async fn mismatched_image_is_dead_lettered() {
        let (dispatcher, provisioner) = dispatcher(TriggerPolicy::FirstSeenOnly);
        let mut bad = event(None, Some(record("f1", "a.csv")));
        bad.record_id = RecordId::new("f2").unwrap();
        let status = dispatcher.handle(&bad).await;
        assert!(matches!(
            status,
            DispatchStatus::DeadLetter { class: ErrorClass::Invalid, .. }
        ));
        assert!(provisioner.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn provisioner_errors_map_to_dispositions() {
        let (dispatcher, provisioner) = dispatcher(TriggerPolicy::FirstSeenOnly);
        let insert = event(None, Some(record("f1", "a.csv")));

        *provisioner.fail_with.lock().await =
            Some(|| PipelineError::TransientIo("throttled".into()));
        assert!(dispatcher.handle(&insert).await.needs_retry());

        *provisioner.fail_with.lock().await =
            Some(|| PipelineError::ObjectNotFound("uploads/f1".into()));
        assert!(matches!(
            dispatcher.handle(&insert).await,
            DispatchStatus::DeadLetter { class: ErrorClass::ObjectNotFound, .. }
        ));

        *provisioner.fail_with.lock().await =
            Some(|| PipelineError::PermissionDenied("nope".into()));
        assert!(matches!(
            dispatcher.handle(&insert).await,
            DispatchStatus::DeadLetter { class: ErrorClass::PermissionDenied, .. }
        ));
    }
}
