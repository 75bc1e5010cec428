use std::sync::Arc;

use crate::{
    access::{AccessGuard, AuthorizationTable, Principal},
    compute::InMemoryComputeAllocator,
    config::PipelineConfig,
    dead_letter::InMemoryDeadLetterQueue,
    dispatcher::ChangeDispatcher,
    error::Result,
    events::PipelineEventBus,
    feed::InMemoryChangeFeed,
    ingest::IngestionService,
    objects::{InMemoryObjectStore, UploadTargetIssuer},
    provisioner::{ComputeProvisioner, InMemoryWorkerLedger, ScriptPublisher},
    runtime::PipelineRuntime,
    store::InMemoryMetadataStore,
};

/// Every component wired together over the in-memory backends. Used by the
/// local server and by tests.
#[derive(Debug, Clone)]
pub struct InMemoryPipeline {
    pub config: PipelineConfig,
    pub authz: Arc<AuthorizationTable>,
    pub feed: Arc<InMemoryChangeFeed>,
    pub store: Arc<InMemoryMetadataStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub compute: Arc<InMemoryComputeAllocator>,
    pub ledger: Arc<InMemoryWorkerLedger>,
    pub dead_letters: Arc<InMemoryDeadLetterQueue>,
    pub events: Arc<PipelineEventBus>,
    pub issuer: Arc<UploadTargetIssuer>,
    pub scripts: Arc<ScriptPublisher>,
    pub ingestion: Arc<IngestionService>,
    pub dispatcher: Arc<ChangeDispatcher>,
    pub runtime: Arc<PipelineRuntime>,
}

impl InMemoryPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_authorization(AuthorizationTable::standard(&config), config)
    }

    pub fn with_authorization(
        authz: AuthorizationTable,
        config: PipelineConfig,
    ) -> Result<Self> {
        let authz = Arc::new(authz);
        let guard = |principal| AccessGuard::new(authz.clone(), principal);

        let feed = Arc::new(InMemoryChangeFeed::new(config.feed.partitions));
        let store = Arc::new(InMemoryMetadataStore::new(
            &config.storage.table_name,
            feed.clone(),
        ));
        let objects = Arc::new(InMemoryObjectStore::new());
        let compute = Arc::new(InMemoryComputeAllocator::new());
        let ledger = Arc::new(InMemoryWorkerLedger::new());
        let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
        let events = Arc::new(PipelineEventBus::default());

        let issuer = Arc::new(UploadTargetIssuer::new(
            &config.uploads,
            config.storage.clone(),
            objects.clone(),
            guard(Principal::UploadIssuer),
        )?);
        let scripts = Arc::new(ScriptPublisher::new(
            objects.clone(),
            guard(Principal::Deployer),
            &config.provision,
            &config.storage,
        ));
        let ingestion = Arc::new(IngestionService::new(
            issuer.clone(),
            store.clone(),
            guard(Principal::Ingestion),
        ));

        let provisioner = Arc::new(ComputeProvisioner::new(
            objects.clone(),
            compute.clone(),
            ledger.clone(),
            guard(Principal::ChangeHandler),
            config.provision.clone(),
            config.storage.clone(),
        ));
        let dispatcher = Arc::new(ChangeDispatcher::new(provisioner, &config));
        let runtime = Arc::new(PipelineRuntime::new(
            &config,
            feed.clone(),
            dispatcher.clone(),
            dead_letters.clone(),
            events.clone(),
            authz.clone(),
        ));

        Ok(Self {
            config,
            authz,
            feed,
            store,
            objects,
            compute,
            ledger,
            dead_letters,
            events,
            issuer,
            scripts,
            ingestion,
            dispatcher,
            runtime,
        })
    }
}
