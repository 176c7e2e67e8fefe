//! Replication lifecycle integration tests.
//!
//! Two in-process nodes: a source with a publisher and a replica pulling
//! from it through a loopback peer, with real bucket files and cursor files
//! on disk.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use magnetdb_core::{
    testing::{fixtures, LoopbackPeer},
    AcceptRule, Bucket, BucketKey, BucketStore, CacheConfig, CursorStore, FileCursorStore,
    MergeConfig, MergeEngine, PeerClient, PublishConfig, StorageConfig, SyncConf, SyncConfig,
    SyncError, SyncFilter, SyncPublisher, SyncReplicator, TorrentRecord, V1Page, V2Page,
};

struct Node {
    store: Arc<BucketStore>,
    engine: Arc<MergeEngine>,
    publisher: Arc<SyncPublisher>,
}

impl Node {
    async fn open(dir: &Path, publish: PublishConfig) -> Self {
        let storage = StorageConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let store = Arc::new(
            BucketStore::open(&storage, CacheConfig::default())
                .await
                .expect("Failed to open store"),
        );
        let engine = Arc::new(MergeEngine::new(Arc::clone(&store), &MergeConfig::default()));
        let publisher = Arc::new(SyncPublisher::new(Arc::clone(&store), publish));
        Self {
            store,
            engine,
            publisher,
        }
    }

    async fn ingest(&self, records: Vec<TorrentRecord>) {
        let report = self.engine.add_or_update(records, &AcceptRule::Always).await;
        assert!(report.is_success());
    }

    async fn contents(&self) -> BTreeMap<BucketKey, Bucket> {
        let mut contents = BTreeMap::new();
        for key in self.store.master().keys() {
            let bucket = self.store.open_read(&key).await.expect("Failed to read bucket");
            contents.insert(key, (*bucket).clone());
        }
        contents
    }
}

/// Source node whose bucket feed pages hold at most two records.
async fn source(dir: &TempDir) -> Node {
    let node = Node::open(
        dir.path(),
        PublishConfig {
            page_size: 2,
            spidr: true,
            ..Default::default()
        },
    )
    .await;
    for i in 0..6 {
        node.ingest(vec![fixtures::record_with_magnet(
            &format!("http://tracker.example/{i}"),
            &format!("Title {i}"),
            &format!("Original {i}"),
        )])
        .await;
    }
    node
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        page_retries: 0,
        retry_backoff_secs: 0,
        checkpoint_interval_secs: 0,
        ..Default::default()
    }
}

fn replicator(peer: Arc<dyn PeerClient>, replica: &Node, cursor_dir: &Path) -> SyncReplicator {
    SyncReplicator::new(
        peer,
        Arc::clone(&replica.engine),
        Arc::new(FileCursorStore::new(cursor_dir)),
        &sync_config(),
    )
}

/// Loopback peer that times out after serving a fixed number of pages.
struct FlakyPeer {
    inner: LoopbackPeer,
    pages_left: AtomicUsize,
}

#[async_trait]
impl PeerClient for FlakyPeer {
    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    async fn conf(&self) -> Result<SyncConf, SyncError> {
        self.inner.conf().await
    }

    async fn torrents_v1(&self, time: i64) -> Result<V1Page, SyncError> {
        self.inner.torrents_v1(time).await
    }

    async fn torrents_v2(
        &self,
        time: i64,
        start: Option<i64>,
        spidr: bool,
    ) -> Result<V2Page, SyncError> {
        self.pages_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| SyncError::Timeout)?;
        self.inner.torrents_v2(time, start, spidr).await
    }
}

#[tokio::test]
async fn test_replica_converges_to_source() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = source(&source_dir).await;
    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;

    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &replica_dir.path().join("sync"));

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.protocol, "v2");
    assert_eq!(report.applied(), 6);
    assert!(report.stats.pages >= 3);
    assert!(report.cursors.is_converged());
    assert_eq!(report.cursors.lastsync, source.store.master().max_file_time());

    assert_eq!(replica.contents().await, source.contents().await);
}

#[tokio::test]
async fn test_converged_cycle_applies_nothing() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = source(&source_dir).await;
    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;

    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &replica_dir.path().join("sync"));

    let first = replicator.run_cycle().await.unwrap();
    let master_before = replica.store.master().max_file_time();

    let second = replicator.run_cycle().await.unwrap();
    assert_eq!(second.applied(), 0);
    assert_eq!(second.cursors, first.cursors);
    // Nothing was rewritten on the replica either.
    assert_eq!(replica.store.master().max_file_time(), master_before);
}

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = source(&source_dir).await;
    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;

    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &replica_dir.path().join("sync"));

    let mut last = -1;
    for round in 0..3 {
        source
            .ingest(vec![fixtures::record(
                &format!("http://tracker.example/new/{round}"),
                &format!("Fresh {round}"),
                "Fresh",
            )])
            .await;

        let report = replicator.run_cycle().await.unwrap();
        assert!(report.cursors.lastsync >= last);
        assert!(report.applied() >= 1);
        last = report.cursors.lastsync;
    }

    assert_eq!(replica.contents().await, source.contents().await);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = source(&source_dir).await;
    let cursor_dir = replica_dir.path().join("sync");

    let resumed_from = {
        let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;
        let peer = Arc::new(FlakyPeer {
            inner: LoopbackPeer::new("http://source.test", Arc::clone(&source.publisher)),
            pages_left: AtomicUsize::new(2),
        });
        let replicator = replicator(peer, &replica, &cursor_dir);

        let err = replicator.run_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));

        let saved = FileCursorStore::new(&cursor_dir).load().await.unwrap();
        assert!(saved.lastsync > 0);
        assert_eq!(saved.starsync, -1);
        saved.lastsync
    };

    // A new process: store reopened from disk, cursors from their files.
    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;
    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &cursor_dir);

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.cursors_before.lastsync, resumed_from);
    assert!(report.applied() < 6);
    assert!(report.cursors.is_converged());

    assert_eq!(replica.contents().await, source.contents().await);
}

#[tokio::test]
async fn test_tracker_filter_limits_replica() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = Node::open(source_dir.path(), PublishConfig::default()).await;

    let mut kept = fixtures::record("http://a.example/1", "Kept", "Kept");
    kept.tracker_name = "rutor".to_string();
    let mut dropped = fixtures::record("http://b.example/1", "Dropped", "Dropped");
    dropped.tracker_name = "other".to_string();
    source.ingest(vec![kept, dropped]).await;

    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;
    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &replica_dir.path().join("sync"))
        .with_filter(SyncFilter::default().with_trackers(["rutor"]));

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.stats.received, 2);
    assert_eq!(report.applied(), 1);

    let keys: Vec<String> = replica
        .contents()
        .await
        .into_keys()
        .map(|k| k.to_string())
        .collect();
    assert_eq!(keys, vec!["kept:kept"]);
}

#[tokio::test]
async fn test_spidr_pass_pulls_everything_without_cursors() {
    let source_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let source = source(&source_dir).await;
    let replica = Node::open(replica_dir.path(), PublishConfig::default()).await;

    let cursor_dir = replica_dir.path().join("sync");
    let peer = Arc::new(LoopbackPeer::new(
        "http://source.test",
        Arc::clone(&source.publisher),
    ));
    let replicator = replicator(peer, &replica, &cursor_dir);

    let report = replicator.run_spidr_pass().await.unwrap().unwrap();
    assert_eq!(report.protocol, "spidr");
    assert_eq!(report.applied(), 6);
    assert!(!cursor_dir.join("lastsync.txt").exists());

    assert_eq!(replica.contents().await, source.contents().await);
}
