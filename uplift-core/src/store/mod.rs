//! Metadata store holding one row per uploaded file.
//!
//! Writes are durable before the change feed reflects them, and every
//! successful `put` produces exactly one change event, including writes that
//! leave the row unchanged. Deciding whether such a write matters is the
//! dispatcher's job.

pub mod memory;

use async_trait::async_trait;

use crate::{
    error::Result,
    types::{RecordId, UploadRecord},
};

pub use memory::InMemoryMetadataStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum PutCondition {
    #[default]
    Unconditional,
    /// Fail with `RecordConflict` when the id already exists.
    IfAbsent,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn table_name(&self) -> &str;

    async fn put(
        &self,
        record: UploadRecord,
        condition: PutCondition,
    ) -> Result<()>;

    /// `RecordNotFound` when the id has never been written.
    async fn get(&self, id: &RecordId) -> Result<UploadRecord>;
}
