use std::{
    collections::HashMap,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace};

use super::{ChangeFeed, FeedBatch, PartitionLag, StartingPosition, partition_for};
use crate::{
    error::{PipelineError, Result},
    types::{ChangeEvent, PartitionId, RecordId, SequenceToken, UploadRecord},
};

#[derive(Debug, Default, Clone)]
struct Cursor {
    checkpoint: u64,
    attempts: u32,
    /// Last sequence handed out by `next_batch`.
    delivered_through: u64,
    retry_at: Option<Instant>,
    retry_not_before: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug)]
struct FeedState {
    logs: Vec<Vec<ChangeEvent>>,
    consumers: HashMap<String, Vec<Cursor>>,
}

impl FeedState {
    fn log(&self, partition: PartitionId) -> Result<&Vec<ChangeEvent>> {
        self.logs.get(partition.0 as usize).ok_or_else(|| {
            PipelineError::Invalid(format!("unknown feed partition {partition}"))
        })
    }

    fn cursor_mut(
        &mut self,
        consumer: &str,
        partition: PartitionId,
    ) -> Result<&mut Cursor> {
        self.consumers
            .get_mut(consumer)
            .ok_or_else(|| {
                PipelineError::Invalid(format!(
                    "consumer {consumer} is not attached"
                ))
            })?
            .get_mut(partition.0 as usize)
            .ok_or_else(|| {
                PipelineError::Invalid(format!(
                    "unknown feed partition {partition}"
                ))
            })
    }
}

/// Partitioned in-process change log with per-consumer checkpoints.
#[derive(Debug)]
pub struct InMemoryChangeFeed {
    partitions: u32,
    state: Mutex<FeedState>,
}

impl InMemoryChangeFeed {
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions,
            state: Mutex::new(FeedState {
                logs: vec![Vec::new(); partitions as usize],
                consumers: HashMap::new(),
            }),
        }
    }

    /// Append a mutation to the partition owning `record_id`.
    pub async fn append(
        &self,
        record_id: RecordId,
        old_image: Option<UploadRecord>,
        new_image: Option<UploadRecord>,
    ) -> ChangeEvent {
        let partition = partition_for(&record_id, self.partitions);
        let mut state = self.state.lock().await;
        let log = &mut state.logs[partition.0 as usize];
        let token = SequenceToken::new(partition, log.len() as u64 + 1);
        let event = ChangeEvent::new(record_id, old_image, new_image, token);
        trace!(
            target: "uplift::feed",
            record_id = %event.record_id,
            %partition,
            sequence = token.sequence,
            "appended change event"
        );
        log.push(event.clone());
        event
    }

    /// Re-append an existing event verbatim, as a provider would on a
    /// duplicate delivery.
    pub async fn replay(&self, event: &ChangeEvent) {
        let partition = partition_for(&event.record_id, self.partitions);
        let mut state = self.state.lock().await;
        let log = &mut state.logs[partition.0 as usize];
        let mut copy = event.clone();
        copy.sequence_token = SequenceToken::new(partition, log.len() as u64 + 1);
        log.push(copy);
    }

    pub async fn head(&self, partition: PartitionId) -> u64 {
        let state = self.state.lock().await;
        state
            .logs
            .get(partition.0 as usize)
            .map(|log| log.len() as u64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn attach(
        &self,
        consumer: &str,
        position: StartingPosition,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.consumers.contains_key(consumer) {
            return Ok(());
        }

        let cursors = state
            .logs
            .iter()
            .map(|log| Cursor {
                checkpoint: match position {
                    StartingPosition::Latest => log.len() as u64,
                    StartingPosition::TrimHorizon => 0,
                },
                ..Cursor::default()
            })
            .collect();
        state.consumers.insert(consumer.to_string(), cursors);
        debug!(target: "uplift::feed", consumer, ?position, "consumer attached");
        Ok(())
    }

    async fn next_batch(
        &self,
        consumer: &str,
        partition: PartitionId,
        max: usize,
    ) -> Result<Option<FeedBatch>> {
        let mut state = self.state.lock().await;
        let head = state.log(partition)?.len() as u64;
        let cursor = state.cursor_mut(consumer, partition)?.clone();

        if let Some(retry_at) = cursor.retry_at
            && Instant::now() < retry_at
        {
            return Ok(None);
        }
        if cursor.checkpoint >= head {
            return Ok(None);
        }

        let start = cursor.checkpoint as usize;
        let end = (start + max.max(1)).min(head as usize);
        let events = state.log(partition)?[start..end].to_vec();

        let cursor = state.cursor_mut(consumer, partition)?;
        cursor.attempts = cursor.attempts.saturating_add(1);
        cursor.delivered_through = end as u64;
        cursor.retry_at = None;
        cursor.retry_not_before = None;

        Ok(Some(FeedBatch {
            partition,
            events,
            delivery_attempt: cursor.attempts,
        }))
    }

    async fn ack(
        &self,
        consumer: &str,
        partition: PartitionId,
        sequence: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let head = state.log(partition)?.len() as u64;
        let cursor = state.cursor_mut(consumer, partition)?;
        if sequence > cursor.checkpoint {
            cursor.checkpoint = sequence.min(head);
            // The consumer moves straight on to the rest of its batch, so the
            // new head is already on its first delivery.
            cursor.attempts = u32::from(cursor.checkpoint < cursor.delivered_through);
            cursor.retry_at = None;
            cursor.retry_not_before = None;
        }
        Ok(())
    }

    async fn nack(
        &self,
        consumer: &str,
        partition: PartitionId,
        retry_after: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let cursor = state.cursor_mut(consumer, partition)?;
        cursor.retry_at = Some(Instant::now() + retry_after);
        cursor.retry_not_before = chrono::Duration::from_std(retry_after)
            .ok()
            .map(|delay| Utc::now() + delay);
        Ok(())
    }

    async fn lag(
        &self,
        consumer: &str,
        partition: PartitionId,
    ) -> Result<PartitionLag> {
        let mut state = self.state.lock().await;
        let head = state.log(partition)?.len() as u64;
        let cursor = state.cursor_mut(consumer, partition)?;
        let pending_retry = cursor
            .retry_at
            .is_some_and(|retry_at| Instant::now() < retry_at);
        Ok(PartitionLag {
            partition,
            checkpoint: cursor.checkpoint,
            head,
            pending: head.saturating_sub(cursor.checkpoint),
            delivery_attempts: cursor.attempts,
            retry_not_before: if pending_retry {
                cursor.retry_not_before
            } else {
                None
            },
        })
    }
}
