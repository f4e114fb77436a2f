use std::sync::Arc;

use crate::batch::BatchProcessor;
use crate::catalog::CatalogQuery;
use crate::config::Config;
use crate::ledger::TaskRegistry;
use crate::notify::NotificationSink;
use crate::observability::Metrics;
use crate::pipeline::Pipeline;
use crate::regions::RegionCatalog;
use crate::storage::StorageClient;
use crate::tasks::TaskManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<dyn TaskRegistry>,
    pub processor: Arc<dyn BatchProcessor>,
    pub catalog: Arc<dyn CatalogQuery>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub storage: Arc<StorageClient>,
    pub regions: Arc<RegionCatalog>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<dyn TaskRegistry>,
        processor: Arc<dyn BatchProcessor>,
        catalog: Arc<dyn CatalogQuery>,
        storage: StorageClient,
        regions: RegionCatalog,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            processor,
            catalog,
            notifier: None,
            storage: Arc::new(storage),
            regions: Arc::new(regions),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Request pipeline writing through `registry`, normally a unit of work.
    pub fn pipeline<'a>(&'a self, registry: &'a dyn TaskRegistry) -> Pipeline<'a> {
        Pipeline {
            regions: &self.regions,
            catalog: self.catalog.as_ref(),
            processor: self.processor.as_ref(),
            storage: &self.storage,
            registry,
            planner: &self.config.planner,
            batch: &self.config.batch,
            package_prefix: &self.config.storage.package_prefix,
            artifact_prefix: &self.config.storage.artifact_prefix,
        }
    }

    pub fn tasks<'a>(&'a self, registry: &'a dyn TaskRegistry) -> TaskManager<'a> {
        TaskManager::new(registry, self.processor.as_ref(), &self.storage)
    }
}
