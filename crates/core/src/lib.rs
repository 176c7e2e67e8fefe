pub mod config;
pub mod maintenance;
pub mod merge;
pub mod metrics;
pub mod normalize;
pub mod record;
pub mod store;
pub mod sync;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, CacheConfig, Config, ConfigError,
    MergeConfig, PeerConfig, PublishConfig, SanitizedConfig, ServerConfig, StorageConfig,
    SyncConfig,
};
pub use maintenance::{
    CorruptReport, DuplicateKey, Maintenance, MaintenanceError, RemoveBucketReport,
    SearchNameReport,
};
pub use merge::{AcceptPolicy, AcceptRule, BucketFailure, MergeEngine, MergeReport};
pub use normalize::{bucket_key, search_name, BucketKey};
pub use record::{file_time, from_file_time, parse_size_name, TorrentRecord};
pub use store::{Bucket, BucketStore, CacheStats, EvictionCache, MasterEntry, MasterIndex, StoreError, WriteHandle};
pub use sync::{
    CursorStore, Cursors, CycleReport, FileCursorStore, HttpPeerClient, PeerClient, PeerStatus,
    SyncConf, SyncError, SyncFilter, SyncManager, SyncPublisher, SyncReplicator, SyncState,
    V1Page, V2Page,
};
