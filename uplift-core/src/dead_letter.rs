//! Events the pipeline gave up on. Operators inspect these; nothing here is
//! retried automatically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    error::{ErrorClass, Result},
    types::{ChangeEvent, InstanceId},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// A retryable failure outlived `max_attempts`.
    RetriesExhausted,
    /// The failure can never succeed on redelivery.
    Fatal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub event: ChangeEvent,
    pub attempts: u32,
    pub error: String,
    pub class: ErrorClass,
    pub reason: DeadLetterReason,
    /// Worker still running after a failed teardown; needs manual cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_instance: Option<InstanceId>,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()>;

    async fn entries(&self) -> Result<Vec<DeadLetterEntry>>;

    async fn count(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
