use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ids::{PartitionId, RecordId},
    record::UploadRecord,
};

/// Position of an event inside its partition. `sequence` starts at 1 and
/// strictly increases per partition; nothing is implied across partitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SequenceToken {
    pub partition: PartitionId,
    pub sequence: u64,
}

impl SequenceToken {
    pub fn new(partition: PartitionId, sequence: u64) -> Self {
        Self {
            partition,
            sequence,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// A single mutation observed on the metadata store, carrying both images.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub record_id: RecordId,
    pub old_image: Option<UploadRecord>,
    pub new_image: Option<UploadRecord>,
    pub sequence_token: SequenceToken,
    pub recorded_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        record_id: RecordId,
        old_image: Option<UploadRecord>,
        new_image: Option<UploadRecord>,
        sequence_token: SequenceToken,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            record_id,
            old_image,
            new_image,
            sequence_token,
            recorded_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.old_image, &self.new_image) {
            (_, None) => ChangeKind::Remove,
            (None, Some(_)) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Modify,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.sequence_token.partition
    }
}
