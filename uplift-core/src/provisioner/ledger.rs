use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    error::Result,
    types::{IdempotencyKey, WorkerHandle},
};

/// Outcome of a conditional ledger write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LedgerInsert {
    Recorded,
    /// Another invocation recorded a live handle for the key first.
    Existing(WorkerHandle),
}

/// Durable record of launched workers, keyed by idempotency key.
#[async_trait]
pub trait WorkerLedger: Send + Sync {
    /// Handle recorded for `key` within the last `window`, if any.
    async fn recent(
        &self,
        key: &IdempotencyKey,
        window: Duration,
    ) -> Result<Option<WorkerHandle>>;

    /// Insert unless a handle younger than `window` already exists.
    async fn record(
        &self,
        handle: WorkerHandle,
        window: Duration,
    ) -> Result<LedgerInsert>;
}

fn within(handle: &WorkerHandle, window: Duration) -> bool {
    let age = Utc::now().signed_duration_since(handle.launched_at);
    chrono::Duration::from_std(window).is_ok_and(|window| age <= window)
}

#[derive(Debug, Default)]
pub struct InMemoryWorkerLedger {
    handles: Mutex<HashMap<IdempotencyKey, WorkerHandle>>,
}

impl InMemoryWorkerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}

#[async_trait]
impl WorkerLedger for InMemoryWorkerLedger {
    async fn recent(
        &self,
        key: &IdempotencyKey,
        window: Duration,
    ) -> Result<Option<WorkerHandle>> {
        Ok(self
            .handles
            .lock()
            .await
            .get(key)
            .filter(|handle| within(handle, window))
            .cloned())
    }

    async fn record(
        &self,
        handle: WorkerHandle,
        window: Duration,
    ) -> Result<LedgerInsert> {
        let mut handles = self.handles.lock().await;
        if let Some(existing) = handles.get(&handle.idempotency_key)
            && within(existing, window)
        {
            return Ok(LedgerInsert::Existing(existing.clone()));
        }
        handles.insert(handle.idempotency_key.clone(), handle);
        Ok(LedgerInsert::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::PolicyDocument,
        types::{GrantedRole, InstanceId, RecordId},
    };

    fn handle(instance: &str, age: chrono::Duration) -> WorkerHandle {
        let record_id = RecordId::new("f1").unwrap();
        WorkerHandle {
            instance_id: InstanceId(instance.into()),
            idempotency_key: IdempotencyKey::for_record(&record_id),
            record_id,
            granted_role: GrantedRole {
                role_name: "uplift-worker".into(),
                policy: PolicyDocument::default(),
            },
            launched_at: Utc::now() - age,
        }
    }

    const HOUR: Duration = Duration::from_secs(3_600);

    #[tokio::test]
    async fn second_record_for_key_returns_the_first() {
        let ledger = InMemoryWorkerLedger::new();
        let first = handle("i-1", chrono::Duration::zero());
        assert_eq!(
            ledger.record(first.clone(), HOUR).await.unwrap(),
            LedgerInsert::Recorded
        );
        assert_eq!(
            ledger.record(handle("i-2", chrono::Duration::zero()), HOUR).await.unwrap(),
            LedgerInsert::Existing(first.clone())
        );
        assert_eq!(
            ledger.recent(&first.idempotency_key, HOUR).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn handles_outside_the_window_are_ignored_and_replaced() {
        let ledger = InMemoryWorkerLedger::new();
        let stale = handle("i-1", chrono::Duration::hours(2));
        ledger.record(stale.clone(), HOUR).await.unwrap();
        assert!(ledger.recent(&stale.idempotency_key, HOUR).await.unwrap().is_none());
        assert_eq!(
            ledger.record(handle("i-2", chrono::Duration::zero()), HOUR).await.unwrap(),
            LedgerInsert::Recorded
        );
        assert_eq!(ledger.len().await, 1);
    }
}
