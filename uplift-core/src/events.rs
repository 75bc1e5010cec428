use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    dead_letter::DeadLetterReason,
    dispatcher::SkipReason,
    error::ErrorClass,
    types::{InstanceId, RecordId, SequenceToken},
};

/// Lifecycle notification emitted by the pipeline runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Id of the change event this notification is about.
    pub correlation_id: Uuid,
    pub record_id: RecordId,
    pub sequence_token: SequenceToken,
    pub emitted_at: DateTime<Utc>,
    pub payload: PipelineEventPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PipelineEventPayload {
    Received { delivery_attempt: u32 },
    Skipped { reason: SkipReason },
    Provisioned { instance_id: InstanceId },
    RetryScheduled { error: String, class: ErrorClass, retry_after_ms: u64 },
    DeadLettered {
        error: String,
        class: ErrorClass,
        reason: DeadLetterReason,
        orphaned_instance: Option<InstanceId>,
    },
}

/// In-process fan-out of [`PipelineEvent`]s. Publishing never blocks and
/// never fails; slow subscribers observe `Lagged`.
pub struct PipelineEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl fmt::Debug for PipelineEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl PipelineEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for PipelineEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
