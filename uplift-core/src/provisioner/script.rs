//! Publishing the processing script workers bootstrap with.

use std::sync::Arc;

use tracing::info;

use crate::{
    access::{AccessGuard, Action, Resource},
    config::{ProvisionConfig, StorageConfig},
    error::Result,
    objects::{ObjectMeta, ObjectStore},
    types::ObjectLocator,
};

const SCRIPT_CONTENT_TYPE: &str = "text/x-shellscript";

/// Where the processing script lives in the bucket.
pub fn script_locator(
    provision: &ProvisionConfig,
    storage: &StorageConfig,
) -> ObjectLocator {
    ObjectLocator::new(&storage.bucket, &provision.script_key)
}

/// Writes the processing script into the object store at deploy time.
pub struct ScriptPublisher {
    objects: Arc<dyn ObjectStore>,
    guard: AccessGuard,
    locator: ObjectLocator,
}

impl std::fmt::Debug for ScriptPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptPublisher")
            .field("principal", &self.guard.principal())
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}

impl ScriptPublisher {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        guard: AccessGuard,
        provision: &ProvisionConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            objects,
            guard,
            locator: script_locator(provision, storage),
        }
    }

    pub fn locator(&self) -> &ObjectLocator {
        &self.locator
    }

    /// Replace the published script with `body`.
    pub async fn publish(&self, body: Vec<u8>) -> Result<ObjectMeta> {
        self.guard
            .check(Action::ObjectPut, &Resource::object(&self.locator))?;
        let meta = self
            .objects
            .put(&self.locator, body, Some(SCRIPT_CONTENT_TYPE.to_string()))
            .await?;
        info!(
            target: "uplift::provision",
            script = %self.locator,
            size = meta.size,
            "processing script published"
        );
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::{AuthorizationTable, Principal},
        config::PipelineConfig,
        error::PipelineError,
        objects::InMemoryObjectStore,
    };

    fn publisher(
        table: AuthorizationTable,
        principal: Principal,
    ) -> (Arc<InMemoryObjectStore>, ScriptPublisher) {
        let config = PipelineConfig::default();
        let objects = Arc::new(InMemoryObjectStore::new());
        let publisher = ScriptPublisher::new(
            objects.clone(),
            AccessGuard::new(Arc::new(table), principal),
            &config.provision,
            &config.storage,
        );
        (objects, publisher)
    }

    #[tokio::test]
    async fn publish_writes_script_under_configured_key() {
        let (objects, publisher) = publisher(
            AuthorizationTable::standard(&PipelineConfig::default()),
            Principal::Deployer,
        );
        publisher.publish(b"#!/bin/sh\n".to_vec()).await.unwrap();

        let locator = ObjectLocator::new("uploads", "scripts/process.sh");
        assert_eq!(publisher.locator(), &locator);
        let stored = objects.get(&locator).await.unwrap().unwrap();
        assert_eq!(stored.body, b"#!/bin/sh\n");
        assert_eq!(stored.meta.content_type.as_deref(), Some(SCRIPT_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn publish_requires_object_put_on_the_script() {
        let (objects, publisher) = publisher(
            AuthorizationTable::standard(&PipelineConfig::default()),
            Principal::ChangeHandler,
        );
        let err = publisher.publish(b"rm -rf /".to_vec()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PermissionDenied(_)));
        assert!(objects.head(publisher.locator()).await.unwrap().is_none());
    }
}
