use std::sync::Arc;

use chrono::{DateTime, Utc};
use magnetdb_core::{
    BucketStore, Config, Maintenance, MergeEngine, SanitizedConfig, SyncManager, SyncPublisher,
};

/// Shared application state
pub struct AppState {
    config: Config,
    engine: Arc<MergeEngine>,
    publisher: Arc<SyncPublisher>,
    maintenance: Maintenance,
    sync: Arc<SyncManager>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<MergeEngine>, sync: Arc<SyncManager>) -> Self {
        let publisher = Arc::new(SyncPublisher::new(
            Arc::clone(engine.store()),
            config.publish.clone(),
        ));
        let maintenance = Maintenance::new(Arc::clone(&engine));
        Self {
            config,
            engine,
            publisher,
            maintenance,
            sync,
            started_at: Utc::now(),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<BucketStore> {
        self.engine.store()
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    pub fn publisher(&self) -> &Arc<SyncPublisher> {
        &self.publisher
    }

    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
