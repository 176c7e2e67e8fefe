//! Common test utilities for in-process API testing.
//!
//! This module provides a test fixture that builds the full router over a
//! real bucket store in a temporary directory, so handlers run against the
//! same storage code as the server.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use magnetdb_core::{
    AcceptRule, BucketStore, CacheConfig, Config, MergeConfig, MergeEngine, PublishConfig,
    ServerConfig, StorageConfig, SyncConfig, SyncManager, TorrentRecord,
};
use magnetdb_server::state::AppState;

/// Re-export fixtures for test convenience
pub use magnetdb_core::testing::fixtures;

/// Test fixture for API testing.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_conf() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.get("/sync/conf").await;
///     assert_eq!(response.status, 200);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Shared state behind the router
    pub state: Arc<AppState>,
    /// Temporary directory holding the store
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

impl TestFixture {
    /// Create a new test fixture with the default publish settings.
    pub async fn new() -> Self {
        Self::with_publish(PublishConfig::default()).await
    }

    /// Create a test fixture serving with the given publish settings.
    pub async fn with_publish(publish: PublishConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config {
            server: ServerConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0, // Not used for in-process testing
            },
            storage: StorageConfig {
                data_dir: temp_dir.path().to_path_buf(),
                ..Default::default()
            },
            cache: CacheConfig::default(),
            merge: MergeConfig::default(),
            sync: SyncConfig::default(),
            publish,
        };
        let state = Arc::new(build_state(config).await);
        let router = magnetdb_server::api::create_router(Arc::clone(&state));

        Self {
            router,
            state,
            temp_dir,
        }
    }

    /// Merge records into the store behind the router.
    pub async fn ingest(&self, records: Vec<TorrentRecord>) {
        let report = self
            .state
            .engine()
            .add_or_update(records, &AcceptRule::Always)
            .await;
        assert!(report.is_success(), "ingest failed: {:?}", report);
    }

    /// Send a GET request from a loopback client.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None, Some(loopback())).await
    }

    /// Send a POST request with JSON body from a loopback client.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body), Some(loopback())).await
    }

    /// Send a request from an arbitrary client address.
    pub async fn request_from(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        peer: SocketAddr,
    ) -> TestResponse {
        self.request(method, path, body, Some(peer)).await
    }

    /// Send a request without any client address attached.
    pub async fn request_anonymous(&self, method: &str, path: &str) -> TestResponse {
        self.request(method, path, None, None).await
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        peer: Option<SocketAddr>,
    ) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let mut request = request_builder.body(body).unwrap();
        if let Some(peer) = peer {
            request.extensions_mut().insert(ConnectInfo(peer));
        }

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).to_string();
        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body, text }
    }
}

/// Build application state over the store configured in `config`.
pub async fn build_state(config: Config) -> AppState {
    let store = Arc::new(
        BucketStore::open(&config.storage, config.cache.clone())
            .await
            .expect("Failed to open store"),
    );
    let engine = Arc::new(MergeEngine::new(store, &config.merge));
    let sync = Arc::new(
        SyncManager::new(&config.sync, Arc::clone(&engine), &config.storage.sync_dir())
            .expect("Failed to create sync manager"),
    );
    AppState::new(config, engine, sync)
}

pub fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
}

pub fn remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 40000)
}
