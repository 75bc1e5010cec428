use std::sync::Arc;

use uplift_core::{
    access::AuthorizationTable,
    config::StorageConfig,
    dead_letter::DeadLetterSink,
    ingest::IngestionService,
    local::InMemoryPipeline,
    objects::ObjectStore,
    runtime::PipelineRuntime,
};

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub objects: Arc<dyn ObjectStore>,
    pub runtime: Arc<PipelineRuntime>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub authz: Arc<AuthorizationTable>,
    pub storage: StorageConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("ingestion", &self.ingestion)
            .field("runtime", &self.runtime)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn from_pipeline(pipeline: &InMemoryPipeline) -> Self {
        Self {
            ingestion: pipeline.ingestion.clone(),
            objects: pipeline.objects.clone(),
            runtime: pipeline.runtime.clone(),
            dead_letters: pipeline.dead_letters.clone(),
            authz: pipeline.authz.clone(),
            storage: pipeline.config.storage.clone(),
        }
    }
}
