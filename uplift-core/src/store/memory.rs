use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{MetadataStore, PutCondition};
use crate::{
    error::{PipelineError, Result},
    feed::InMemoryChangeFeed,
    types::{RecordId, UploadRecord},
};

/// Table backed by a map; commits the row, then appends to the feed.
#[derive(Debug)]
pub struct InMemoryMetadataStore {
    table: String,
    rows: RwLock<HashMap<RecordId, UploadRecord>>,
    feed: Arc<InMemoryChangeFeed>,
}

impl InMemoryMetadataStore {
    pub fn new(table: impl Into<String>, feed: Arc<InMemoryChangeFeed>) -> Self {
        Self {
            table: table.into(),
            rows: RwLock::new(HashMap::new()),
            feed,
        }
    }

    pub fn feed(&self) -> &Arc<InMemoryChangeFeed> {
        &self.feed
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn put(
        &self,
        record: UploadRecord,
        condition: PutCondition,
    ) -> Result<()> {
        // The write lock is held across the append so feed order matches
        // commit order for every key.
        let mut rows = self.rows.write().await;
        if condition == PutCondition::IfAbsent && rows.contains_key(&record.id)
        {
            return Err(PipelineError::RecordConflict(record.id.to_string()));
        }

        let previous = rows.insert(record.id.clone(), record.clone());
        debug!(
            table = %self.table,
            record_id = %record.id,
            replaced = previous.is_some(),
            "record committed"
        );
        self.feed
            .append(record.id.clone(), previous, Some(record))
            .await;
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> Result<UploadRecord> {
        self.rows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::RecordNotFound(id.to_string()))
    }
}
