use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::middleware::{loopback_only, metrics_middleware};
use super::{dev, handlers, sync};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Replication endpoints served to peers
    let sync_routes = Router::new()
        .route("/conf", get(sync::conf))
        .route("/fdb/torrents", get(sync::fdb_torrents))
        .route("/torrents", get(sync::torrents))
        .route("/status", get(sync::status));

    // Maintenance, loopback clients only
    let dev_routes = Router::new()
        .route("/rebuild_search_names", post(dev::rebuild_search_names))
        .route("/migrate_record", post(dev::migrate_record))
        .route("/remove_bucket", post(dev::remove_bucket))
        .route("/find_duplicate_keys", get(dev::find_duplicate_keys))
        .route("/find_corrupt", get(dev::find_corrupt))
        .route("/rebuild_master", post(dev::rebuild_master))
        .route("/save_master", post(dev::save_master))
        .layer(middleware::from_fn(loopback_only));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::metrics))
        .nest("/sync", sync_routes)
        .nest("/dev", dev_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
