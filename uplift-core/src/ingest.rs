//! The two operations clients use: obtain a writable location for a file,
//! then record its metadata.

use std::sync::Arc;

use tracing::info;

use crate::{
    access::{AccessGuard, Action, Resource},
    error::Result,
    objects::{UploadTargetIssuer, WritableLocation},
    store::{MetadataStore, PutCondition},
    types::{RecordId, UploadRecord},
};

pub struct IngestionService {
    issuer: Arc<UploadTargetIssuer>,
    store: Arc<dyn MetadataStore>,
    guard: AccessGuard,
    condition: PutCondition,
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("issuer", &self.issuer)
            .field("table", &self.store.table_name())
            .field("condition", &self.condition)
            .finish()
    }
}

impl IngestionService {
    pub fn new(
        issuer: Arc<UploadTargetIssuer>,
        store: Arc<dyn MetadataStore>,
        guard: AccessGuard,
    ) -> Self {
        Self {
            issuer,
            store,
            guard,
            condition: PutCondition::Unconditional,
        }
    }

    /// Reject writes to ids that already exist instead of updating them.
    pub fn with_put_condition(mut self, condition: PutCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn issuer(&self) -> &Arc<UploadTargetIssuer> {
        &self.issuer
    }

    pub fn issue_upload_target(&self, file_id: &str) -> Result<WritableLocation> {
        let file_id = RecordId::new(file_id)?;
        self.issuer.issue(&file_id)
    }

    pub async fn record_upload_metadata(&self, record: UploadRecord) -> Result<()> {
        self.guard.check(
            Action::RecordPut,
            &Resource::record(self.store.table_name(), &record.id),
        )?;
        let record_id = record.id.clone();
        self.store.put(record, self.condition).await?;
        info!(%record_id, "upload metadata recorded");
        Ok(())
    }
}
