//! Object storage the uploads land in, plus the issuer of single-use
//! writable locations.

pub mod uploads;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{error::Result, types::ObjectLocator};

pub use uploads::{UploadParams, UploadTargetIssuer, WritableLocation};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub size: u64,
    pub content_type: Option<String>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of the object, `None` when absent.
    async fn head(&self, locator: &ObjectLocator) -> Result<Option<ObjectMeta>>;

    async fn get(&self, locator: &ObjectLocator) -> Result<Option<StoredObject>>;

    async fn put(
        &self,
        locator: &ObjectLocator,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<ObjectMeta>;
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectLocator, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn head(&self, locator: &ObjectLocator) -> Result<Option<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .await
            .get(locator)
            .map(|object| object.meta.clone()))
    }

    async fn get(&self, locator: &ObjectLocator) -> Result<Option<StoredObject>> {
        Ok(self.objects.read().await.get(locator).cloned())
    }

    async fn put(
        &self,
        locator: &ObjectLocator,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<ObjectMeta> {
        let meta = ObjectMeta {
            size: body.len() as u64,
            content_type,
            stored_at: Utc::now(),
        };
        self.objects.write().await.insert(
            locator.clone(),
            StoredObject {
                meta: meta.clone(),
                body,
            },
        );
        Ok(meta)
    }
}
