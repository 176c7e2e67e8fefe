use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9117
}

/// On-disk layout of the bucket store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory for bucket files, the master index snapshot and sync cursors.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Number of directory levels a bucket file is nested under.
    /// Each level consumes two hex characters of the key digest.
    #[serde(default = "default_path_levels")]
    pub path_levels: usize,
    /// How often the master index snapshot is written to disk (seconds).
    #[serde(default = "default_master_save_interval")]
    pub master_save_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            path_levels: default_path_levels(),
            master_save_interval_secs: default_master_save_interval(),
        }
    }
}

impl StorageConfig {
    /// Directory holding the sharded bucket files.
    pub fn buckets_dir(&self) -> PathBuf {
        self.data_dir.join("fdb")
    }

    /// Path of the persisted master index snapshot.
    pub fn master_path(&self) -> PathBuf {
        self.data_dir.join("masterDb.json")
    }

    /// Directory holding per-peer replication cursors.
    pub fn sync_dir(&self) -> PathBuf {
        self.data_dir.join("sync")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("Data")
}

fn default_path_levels() -> usize {
    2
}

fn default_master_save_interval() -> u64 {
    300
}

/// Bucket cache limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// When disabled every read goes to disk.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Age after which a cached read snapshot is reloaded (seconds).
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Ceiling on concurrently open write handles.
    #[serde(default = "default_max_open_writers")]
    pub max_open_writers: usize,
    /// Number of cached buckets above which eviction kicks in.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// How many of the oldest entries one eviction pass drops.
    #[serde(default = "default_drop_take")]
    pub drop_take: usize,
    /// How often expired snapshots are purged (seconds).
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl(),
            max_open_writers: default_max_open_writers(),
            max_entries: default_max_entries(),
            drop_take: default_drop_take(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    3600
}

fn default_max_open_writers() -> usize {
    2000
}

fn default_max_entries() -> usize {
    10_000
}

fn default_drop_take() -> usize {
    200
}

fn default_purge_interval() -> u64 {
    60
}

/// Merge engine tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeConfig {
    /// Buckets of one batch merged concurrently.
    #[serde(default = "default_max_concurrent_buckets")]
    pub max_concurrent_buckets: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_buckets: default_max_concurrent_buckets(),
        }
    }
}

fn default_max_concurrent_buckets() -> usize {
    16
}

/// A remote node to replicate from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Base URL of the peer (e.g., "http://peer.example:9117")
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Pull-replication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Only records from these trackers are replicated (None = all).
    #[serde(default)]
    pub trackers: Option<Vec<String>>,
    /// Replicate records tagged "sport".
    #[serde(default = "default_true")]
    pub include_sport: bool,
    /// Pull the secondary spidr feed when a peer offers it.
    #[serde(default = "default_true")]
    pub include_spidr: bool,
    /// Pause between replication cycles (minutes).
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Lower bound applied to both cycle intervals (minutes).
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: u64,
    /// Pause between spidr passes (minutes).
    #[serde(default = "default_interval_minutes")]
    pub spidr_interval_minutes: u64,
    /// Random delay added before every cycle (seconds, inclusive range).
    #[serde(default = "default_jitter_min")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: u64,
    /// Delay before the first cycle after startup (seconds).
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Timeout for a single page request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Cursors are persisted at least this often during a long drain (seconds).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
    /// Extra attempts for a failed page before the cycle is abandoned.
    #[serde(default = "default_page_retries")]
    pub page_retries: u32,
    /// Base delay between page attempts, doubled after each failure (seconds).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            trackers: None,
            include_sport: true,
            include_spidr: true,
            interval_minutes: default_interval_minutes(),
            min_interval_minutes: default_min_interval_minutes(),
            spidr_interval_minutes: default_interval_minutes(),
            jitter_min_secs: default_jitter_min(),
            jitter_max_secs: default_jitter_max(),
            startup_delay_secs: default_startup_delay(),
            request_timeout_secs: default_request_timeout(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            page_retries: default_page_retries(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_min_interval_minutes() -> u64 {
    20
}

fn default_jitter_min() -> u64 {
    60
}

fn default_jitter_max() -> u64 {
    300
}

fn default_startup_delay() -> u64 {
    20
}

fn default_request_timeout() -> u64 {
    300
}

fn default_checkpoint_interval() -> u64 {
    300
}

fn default_page_retries() -> u32 {
    1
}

fn default_retry_backoff() -> u64 {
    60
}

/// What this node serves to peers replicating from it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishConfig {
    /// Serve the paginated bucket feed (`/sync/fdb/torrents`).
    #[serde(default = "default_true")]
    pub open_sync: bool,
    /// Serve the legacy flat feed (`/sync/torrents`).
    #[serde(default)]
    pub open_sync_v1: bool,
    /// Advertise the spidr feed.
    #[serde(default)]
    pub spidr: bool,
    /// Records per bucket-feed page (a page always holds whole buckets).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Records per legacy page.
    #[serde(default = "default_v1_take")]
    pub v1_take: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            open_sync: true,
            open_sync_v1: false,
            spidr: false,
            page_size: default_page_size(),
            v1_take: default_v1_take(),
        }
    }
}

fn default_page_size() -> usize {
    5000
}

fn default_v1_take() -> usize {
    1000
}

/// Sanitized config for logging (peer credentials redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub merge: MergeConfig,
    pub sync: SanitizedSyncConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedSyncConfig {
    pub peers: Vec<PeerConfig>,
    pub trackers: Option<Vec<String>>,
    pub include_sport: bool,
    pub include_spidr: bool,
    pub interval_minutes: u64,
    pub spidr_interval_minutes: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            storage: config.storage.clone(),
            cache: config.cache.clone(),
            merge: config.merge.clone(),
            sync: SanitizedSyncConfig {
                peers: config
                    .sync
                    .peers
                    .iter()
                    .map(|p| PeerConfig {
                        url: redact_url_credentials(&p.url),
                        enabled: p.enabled,
                    })
                    .collect(),
                trackers: config.sync.trackers.clone(),
                include_sport: config.sync.include_sport,
                include_spidr: config.sync.include_spidr,
                interval_minutes: config.sync.interval_minutes,
                spidr_interval_minutes: config.sync.spidr_interval_minutes,
            },
            publish: config.publish.clone(),
        }
    }
}

/// Replace `user:password@` in a URL with `***@`.
pub fn redact_url_credentials(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}
