//! End-to-end replication over real HTTP.
//!
//! A source node serves its router on an ephemeral port; a replica pulls
//! from it with the HTTP peer client, exactly as a remote node would.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use magnetdb_core::{
    Config, FileCursorStore, HttpPeerClient, PublishConfig, StorageConfig, SyncConfig,
    SyncReplicator,
};
use magnetdb_server::state::AppState;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use common::{build_state, fixtures};

struct Node {
    state: Arc<AppState>,
    _dir: TempDir,
}

impl Node {
    async fn new(publish: PublishConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage: StorageConfig {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            publish,
            ..Default::default()
        };
        Self {
            state: Arc::new(build_state(config).await),
            _dir: dir,
        }
    }

    async fn serve(&self) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = magnetdb_server::api::create_router(Arc::clone(&self.state));
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    fn replicator(&self, base_url: &str) -> SyncReplicator {
        let sync = SyncConfig {
            page_retries: 0,
            retry_backoff_secs: 0,
            checkpoint_interval_secs: 0,
            ..Default::default()
        };
        let peer = Arc::new(HttpPeerClient::new(base_url, Duration::from_secs(10)).unwrap());
        SyncReplicator::new(
            peer,
            Arc::clone(self.state.engine()),
            Arc::new(FileCursorStore::for_peer(
                &self.state.config().storage.sync_dir(),
                base_url,
            )),
            &sync,
        )
    }

    async fn urls(&self) -> Vec<String> {
        let store = self.state.store();
        let mut urls = Vec::new();
        for key in store.master().keys() {
            let bucket = store.open_read(&key).await.unwrap();
            urls.extend(bucket.keys().cloned());
        }
        urls.sort();
        urls
    }
}

/// Seed `count` single-record buckets with distinct update times, one
/// second apart, so the flat feed can page through them.
async fn seed(node: &Node, count: usize) {
    let base = Utc::now() - chrono::Duration::seconds(count as i64 + 1);
    let records = (0..count)
        .map(|i| {
            let mut record = fixtures::record_with_magnet(
                &format!("http://tracker.example/{i}"),
                &format!("Film {i}"),
                &format!("Film {i}"),
            );
            record.update_time = base + chrono::Duration::seconds(i as i64);
            record
        })
        .collect();
    let report = node
        .state
        .engine()
        .add_or_update(records, &magnetdb_core::AcceptRule::Always)
        .await;
    assert!(report.is_success());
}

#[tokio::test]
async fn test_replica_pulls_bucket_feed_over_http() {
    let source = Node::new(PublishConfig {
        page_size: 3,
        ..Default::default()
    })
    .await;
    seed(&source, 8).await;
    let (url, server) = source.serve().await;

    let replica = Node::new(PublishConfig::default()).await;
    let replicator = replica.replicator(&url);

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.protocol, "v2");
    assert_eq!(report.applied(), 8);
    assert!(report.stats.pages >= 3);
    assert!(report.cursors.is_converged());
    assert_eq!(replica.urls().await, source.urls().await);

    // Nothing new upstream: the next cycle is a no-op.
    let again = replicator.run_cycle().await.unwrap();
    assert_eq!(again.applied(), 0);
    assert_eq!(again.cursors, report.cursors);

    server.abort();
}

#[tokio::test]
async fn test_replica_falls_back_to_v1_feed() {
    let source = Node::new(PublishConfig {
        open_sync: false,
        open_sync_v1: true,
        v1_take: 2,
        ..Default::default()
    })
    .await;
    seed(&source, 5).await;
    let (url, server) = source.serve().await;

    let replica = Node::new(PublishConfig::default()).await;
    let report = replica.replicator(&url).run_cycle().await.unwrap();
    assert_eq!(report.protocol, "v1");
    assert_eq!(report.applied(), 5);
    assert_eq!(replica.urls().await, source.urls().await);

    server.abort();
}

#[tokio::test]
async fn test_incremental_changes_follow_the_cursor() {
    let source = Node::new(PublishConfig::default()).await;
    seed(&source, 2).await;
    let (url, server) = source.serve().await;

    let replica = Node::new(PublishConfig::default()).await;
    let replicator = replica.replicator(&url);
    let first = replicator.run_cycle().await.unwrap();
    assert_eq!(first.applied(), 2);

    let report = source
        .state
        .engine()
        .add_or_update(
            vec![fixtures::record("http://tracker.example/late", "Late", "Late")],
            &magnetdb_core::AcceptRule::Always,
        )
        .await;
    assert!(report.is_success());

    let second = replicator.run_cycle().await.unwrap();
    assert_eq!(second.applied(), 1);
    assert!(second.cursors.lastsync > first.cursors.lastsync);
    assert_eq!(replica.urls().await, source.urls().await);

    server.abort();
}

#[tokio::test]
async fn test_dev_routes_reachable_over_loopback() {
    let source = Node::new(PublishConfig::default()).await;
    seed(&source, 1).await;
    let (url, server) = source.serve().await;

    let response = reqwest::get(format!("{}/dev/find_corrupt", url))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["total_records"], 1);

    server.abort();
}
