use std::{path::PathBuf, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::feed::StartingPosition;

/// Global knobs that tune the pipeline.
///
/// All fields carry defaults so a deployment only has to spell out what it
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Partitioning, batch size and starting position of the change feed.
    pub feed: FeedConfig,
    /// Redelivery backoff and the attempt bound before dead-lettering.
    pub retry: RetryConfig,
    /// Worker role, instance type, readiness budget and ledger window.
    pub provision: ProvisionConfig,
    /// Bucket, key prefix and table names.
    pub storage: StorageConfig,
    /// Writable location issuance.
    pub uploads: UploadConfig,
    /// Which record mutations trigger provisioning.
    pub trigger: TriggerPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub partitions: u32,
    /// Events handed to the dispatcher per read. Kept at 1 so a poison pill
    /// only ever blocks itself.
    pub batch_size: usize,
    pub starting_position: StartingPosition,
    /// Sleep between reads when a partition has nothing deliverable.
    pub idle_poll_ms: u64,
    pub consumer_name: String,
}

impl FeedConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            batch_size: 1,
            starting_position: StartingPosition::Latest,
            idle_poll_ms: 200,
            consumer_name: "change-handler".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Deliveries of one event before it is dead-lettered.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay before jitter: `base * 2^(attempt-1)`, capped.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    /// Redelivery delay for the given (1-based) delivery attempt.
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }

        let ratio = f64::from(self.jitter_ratio.max(0.0));
        let span = ((base as f64) * ratio).max(self.jitter_min_ms as f64) as u64;
        let jitter = if span == 0 {
            0
        } else {
            rng.random_range(0..=span)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Shared execution role, created on first use.
    pub role_name: String,
    pub instance_type: String,
    /// Time a worker gets to reach `running` before it is torn down.
    pub timeout_budget_secs: u64,
    pub ready_poll_interval_ms: u64,
    /// How far back the ledger is consulted for an existing handle.
    pub idempotency_window_secs: u64,
    /// Object key of the processing script the worker bootstraps with.
    pub script_key: String,
    /// Local file published to `script_key` when the server starts. The
    /// bundled script is used when unset.
    pub script_source: Option<PathBuf>,
}

impl ProvisionConfig {
    pub fn timeout_budget(&self) -> Duration {
        Duration::from_secs(self.timeout_budget_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            role_name: "uplift-worker".to_string(),
            instance_type: "t2.micro".to_string(),
            timeout_budget_secs: 900,
            ready_poll_interval_ms: 2_000,
            idempotency_window_secs: 3_600,
            script_key: "scripts/process.sh".to_string(),
            script_source: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    /// Prepended to the file id to form the object key.
    pub object_prefix: String,
    pub table_name: String,
}

impl StorageConfig {
    pub fn object_key(&self, file_id: &str) -> String {
        format!("{}{}", self.object_prefix, file_id)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "uploads".to_string(),
            object_prefix: String::new(),
            table_name: "file-table".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base URL that issued locations point at.
    pub public_base_url: String,
    pub url_ttl_secs: u64,
    /// HMAC key for issued locations. Generated per process when empty.
    #[serde(skip_serializing)]
    pub signing_key: Zeroizing<String>,
}

impl UploadConfig {
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }
}

impl std::fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConfig")
            .field("public_base_url", &self.public_base_url)
            .field("url_ttl_secs", &self.url_ttl_secs)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            url_ttl_secs: 900,
            signing_key: Zeroizing::new(String::new()),
        }
    }
}

/// Decides whether a record mutation provisions a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Only the first write of a record provisions.
    #[default]
    FirstSeenOnly,
    /// Updates provision again when the attribute map actually changed.
    OnAttributeChange,
}
