//! Change feed consumed by the pipeline runtime.
//!
//! The feed is an ordered, at-least-once log of record mutations split into
//! partitions. A record id always hashes to the same partition, so events for
//! one key are delivered in write order; nothing is promised across keys.
//!
//! Consumers track a checkpoint per partition. A batch stays at the head of
//! its partition until it is acknowledged, and every redelivery of that head
//! bumps [`FeedBatch::delivery_attempt`]. Attempts are counted for the head
//! event only: acknowledging part of a batch makes the next event the head,
//! on its first attempt.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::Result,
    types::{ChangeEvent, PartitionId, RecordId},
};

pub use memory::InMemoryChangeFeed;

/// Where a newly attached consumer starts reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// Only events appended after attaching are delivered.
    #[default]
    Latest,
    /// Replay from the oldest retained event.
    TrimHorizon,
}

/// Events handed to a consumer in one read.
#[derive(Clone, Debug)]
pub struct FeedBatch {
    pub partition: PartitionId,
    pub events: Vec<ChangeEvent>,
    /// 1 on first delivery of this head, incremented on every redelivery.
    pub delivery_attempt: u32,
}

impl FeedBatch {
    /// Attempt number of the event at `index`. Only the head can have failed
    /// before; everything behind it is on its first attempt.
    pub fn attempt_for(&self, index: usize) -> u32 {
        if index == 0 { self.delivery_attempt } else { 1 }
    }

    /// Sequence of the last event in the batch.
    pub fn through(&self) -> Option<u64> {
        self.events.last().map(|event| event.sequence_token.sequence)
    }
}

/// Backlog of one partition for one consumer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionLag {
    pub partition: PartitionId,
    /// Last acknowledged sequence (0 when nothing was acknowledged).
    pub checkpoint: u64,
    /// Last appended sequence.
    pub head: u64,
    pub pending: u64,
    pub delivery_attempts: u32,
    pub retry_not_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    fn partition_count(&self) -> u32;

    async fn attach(
        &self,
        consumer: &str,
        position: StartingPosition,
    ) -> Result<()>;

    /// Up to `max` events after the consumer's checkpoint, or `None` when the
    /// partition is drained or waiting out a retry delay.
    async fn next_batch(
        &self,
        consumer: &str,
        partition: PartitionId,
        max: usize,
    ) -> Result<Option<FeedBatch>>;

    /// Advance the checkpoint through `sequence`. The attempt count restarts
    /// for the new head: at 1 when it was delivered in the same batch, else 0.
    async fn ack(
        &self,
        consumer: &str,
        partition: PartitionId,
        sequence: u64,
    ) -> Result<()>;

    /// Keep the checkpoint and hide the partition for `retry_after`.
    async fn nack(
        &self,
        consumer: &str,
        partition: PartitionId,
        retry_after: Duration,
    ) -> Result<()>;

    async fn lag(
        &self,
        consumer: &str,
        partition: PartitionId,
    ) -> Result<PartitionLag>;
}

/// Stable partition assignment for a record id.
pub fn partition_for(record_id: &RecordId, partitions: u32) -> PartitionId {
    let digest = Sha256::digest(record_id.as_str().as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    PartitionId(prefix % partitions.max(1))
}
