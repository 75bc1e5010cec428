//! Pipeline runtime: one consumer task per feed partition.
//!
//! Each task reads a batch, hands every event to the [`EventHandler`] in
//! order and acknowledges as it goes. A retryable failure stops the batch:
//! the remaining events stay unacknowledged and the partition is hidden for
//! the backoff delay, so the feed's redelivery does the retrying. Events that
//! fail fatally, or keep failing past `max_attempts`, are moved to the
//! dead-letter channel and acknowledged so the partition keeps flowing.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    access::{Action, AuthorizationTable, Principal, Resource},
    config::{FeedConfig, PipelineConfig, RetryConfig},
    dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink},
    dispatcher::{DispatchStatus, EventHandler},
    error::{ErrorClass, Result},
    events::{PipelineEvent, PipelineEventBus, PipelineEventPayload},
    feed::{ChangeFeed, FeedBatch, PartitionLag},
    types::{ChangeEvent, InstanceId, PartitionId},
};

/// What happened to one batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchOutcome {
    pub acknowledged: usize,
    pub dead_lettered: usize,
    /// Set when the batch stopped on a retryable failure.
    pub retry_after: Option<Duration>,
}

/// Operator view of the pipeline.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub consumer: String,
    pub partitions: Vec<PartitionLag>,
    pub pending: u64,
    /// Partitions currently waiting out a retry delay.
    pub retrying: usize,
    pub dead_letters: usize,
}

pub struct PipelineRuntime {
    feed: Arc<dyn ChangeFeed>,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: Arc<PipelineEventBus>,
    authz: Arc<AuthorizationTable>,
    feed_config: FeedConfig,
    retry: RetryConfig,
    table_name: String,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("feed_config", &self.feed_config)
            .field("retry", &self.retry)
            .field("table_name", &self.table_name)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    pub fn new(
        config: &PipelineConfig,
        feed: Arc<dyn ChangeFeed>,
        handler: Arc<dyn EventHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        events: Arc<PipelineEventBus>,
        authz: Arc<AuthorizationTable>,
    ) -> Self {
        Self {
            feed,
            handler,
            dead_letters,
            events,
            authz,
            feed_config: config.feed.clone(),
            retry: config.retry.clone(),
            table_name: config.storage.table_name.clone(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.feed_config.consumer_name
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check the feed-to-handler wiring against the authorization table and
    /// register the consumer at the configured starting position.
    pub async fn attach(&self) -> Result<()> {
        self.authz
            .ensure_invoke(Principal::ChangeFeed, Principal::ChangeHandler)?;
        self.authz.authorize(
            Principal::ChangeHandler,
            Action::FeedRead,
            &Resource::feed(&self.table_name),
        )?;
        self.feed
            .attach(self.consumer(), self.feed_config.starting_position)
            .await
    }

    /// Attach and spawn one consumer task per partition.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.attach().await?;

        let partitions = self.feed.partition_count();
        let mut workers = self.workers.lock().await;
        for index in 0..partitions {
            let runtime = Arc::clone(self);
            let partition = PartitionId(index);
            workers.push(tokio::spawn(async move {
                runtime.run_partition(partition).await;
            }));
        }
        info!(
            target: "uplift::feed",
            consumer = self.consumer(),
            partitions,
            "pipeline runtime started"
        );
        Ok(())
    }

    async fn run_partition(&self, partition: PartitionId) {
        let idle = self.feed_config.idle_poll();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let wait = match self.process_partition_once(partition).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(idle),
                Err(err) => {
                    error!(
                        target: "uplift::feed",
                        %partition,
                        error = %err,
                        "partition read failed"
                    );
                    Some(idle)
                }
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }
        debug!(target: "uplift::feed", %partition, "partition consumer stopped");
    }

    /// Read and process at most one batch. `None` when nothing was
    /// deliverable.
    pub async fn process_partition_once(
        &self,
        partition: PartitionId,
    ) -> Result<Option<BatchOutcome>> {
        let batch = self
            .feed
            .next_batch(self.consumer(), partition, self.feed_config.batch_size)
            .await?;
        match batch {
            Some(batch) => self.process_batch(batch).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn process_batch(&self, batch: FeedBatch) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for (index, event) in batch.events.iter().enumerate() {
            let attempt = batch.attempt_for(index);
            self.publish(event, PipelineEventPayload::Received {
                delivery_attempt: attempt,
            });

            match self.handler.handle(event).await {
                DispatchStatus::Provisioned(handle) => {
                    self.publish(event, PipelineEventPayload::Provisioned {
                        instance_id: handle.instance_id,
                    });
                }
                DispatchStatus::Skipped(reason) => {
                    self.publish(event, PipelineEventPayload::Skipped { reason });
                }
                DispatchStatus::DeadLetter {
                    error,
                    class,
                    orphaned_instance,
                } => {
                    self.dead_letter(
                        event,
                        attempt,
                        error,
                        class,
                        DeadLetterReason::Fatal,
                        orphaned_instance,
                    )
                    .await?;
                    outcome.dead_lettered += 1;
                }
                DispatchStatus::Retry { error, class } => {
                    if attempt >= self.retry.max_attempts {
                        self.dead_letter(
                            event,
                            attempt,
                            error,
                            class,
                            DeadLetterReason::RetriesExhausted,
                            None,
                        )
                        .await?;
                        outcome.dead_lettered += 1;
                    } else {
                        let delay = self.retry.delay_for(attempt, &mut rand::rng());
                        self.feed
                            .nack(self.consumer(), batch.partition, delay)
                            .await?;
                        warn!(
                            target: "uplift::feed",
                            record_id = %event.record_id,
                            attempt,
                            ?delay,
                            %error,
                            "event scheduled for redelivery"
                        );
                        self.publish(event, PipelineEventPayload::RetryScheduled {
                            error,
                            class,
                            retry_after_ms: delay.as_millis() as u64,
                        });
                        outcome.retry_after = Some(delay);
                        return Ok(outcome);
                    }
                }
            }

            self.feed
                .ack(
                    self.consumer(),
                    batch.partition,
                    event.sequence_token.sequence,
                )
                .await?;
            outcome.acknowledged += 1;
        }

        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        attempts: u32,
        error: String,
        class: ErrorClass,
        reason: DeadLetterReason,
        orphaned_instance: Option<InstanceId>,
    ) -> Result<()> {
        warn!(
            target: "uplift::feed",
            record_id = %event.record_id,
            event_id = %event.event_id,
            attempts,
            class = class.as_str(),
            ?reason,
            orphaned_instance = orphaned_instance.as_ref().map(InstanceId::as_str),
            %error,
            "event moved to dead-letter channel"
        );
        self.dead_letters
            .push(DeadLetterEntry {
                event: event.clone(),
                attempts,
                error: error.clone(),
                class,
                reason,
                orphaned_instance: orphaned_instance.clone(),
                failed_at: Utc::now(),
            })
            .await?;
        self.publish(event, PipelineEventPayload::DeadLettered {
            error,
            class,
            reason,
            orphaned_instance,
        });
        Ok(())
    }

    fn publish(&self, event: &ChangeEvent, payload: PipelineEventPayload) {
        self.events.publish(PipelineEvent {
            correlation_id: event.event_id,
            record_id: event.record_id.clone(),
            sequence_token: event.sequence_token,
            emitted_at: Utc::now(),
            payload,
        });
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let mut partitions = Vec::new();
        for index in 0..self.feed.partition_count() {
            partitions.push(self.feed.lag(self.consumer(), PartitionId(index)).await?);
        }
        Ok(PipelineStatus {
            consumer: self.consumer().to_string(),
            pending: partitions.iter().map(|lag| lag.pending).sum(),
            retrying: partitions
                .iter()
                .filter(|lag| lag.retry_not_before.is_some())
                .count(),
            partitions,
            dead_letters: self.dead_letters.count().await?,
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "uplift::feed", "stopping pipeline runtime");
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let results = join_all(workers.into_iter().map(|handle| {
            tokio::time::timeout(Duration::from_secs(30), handle)
        }))
        .await;
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("partition task failed: {err:?}"),
                Err(_) => warn!("partition task timed out during shutdown"),
            }
        }
        Ok(())
    }
}
