use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use magnetdb_core::{
    load_config, validate_config, BucketStore, MergeEngine, SanitizedConfig, SyncManager,
};
use magnetdb_server::api::create_router;
use magnetdb_server::state::AppState;
use magnetdb_server::tasks::Housekeeping;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("MAGNETDB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    let sanitized = SanitizedConfig::from(&config);
    let config_json = serde_json::to_string(&sanitized).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Configuration loaded successfully"
    );
    info!("Effective configuration: {}", config_json);

    // Open the bucket store (loads or rebuilds the master index)
    let store = Arc::new(
        BucketStore::open(&config.storage, config.cache.clone())
            .await
            .with_context(|| format!("Failed to open store at {:?}", config.storage.data_dir))?,
    );
    info!(
        buckets = store.master().len(),
        root = %store.root().display(),
        "Bucket store opened"
    );

    let engine = Arc::new(MergeEngine::new(Arc::clone(&store), &config.merge));

    // Replication
    let sync = Arc::new(
        SyncManager::new(
            &config.sync,
            Arc::clone(&engine),
            &config.storage.sync_dir(),
        )
        .context("Failed to create sync manager")?,
    );
    sync.start().await;

    // Housekeeping
    let housekeeping = Housekeeping::new(Arc::clone(&store), &config);
    housekeeping.start().await;

    // Create app state and router
    let state = Arc::new(AppState::new(config.clone(), engine, Arc::clone(&sync)));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error");

    info!("Server shutting down...");

    // Let in-flight pages finish, then persist the index
    sync.stop().await;
    housekeeping.stop().await;
    store.cache().close_writes();

    match store.save_master().await {
        Ok(buckets) => info!(buckets, "Master index saved"),
        Err(e) => warn!(error = %e, "Failed to save master index on shutdown"),
    }

    served
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
