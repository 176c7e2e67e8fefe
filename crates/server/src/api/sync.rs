//! Replication endpoints: what peers pull from this node.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use magnetdb_core::{PeerStatus, SyncConf, V1Page, V2Page};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::handlers::{api_error, ApiError};
use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FdbQuery {
    #[serde(default = "default_time")]
    pub time: i64,
    /// Checkpoint cursor of the caller. Accepted for compatibility; pages are
    /// selected by `time` alone.
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub spidr: bool,
}

#[derive(Debug, Deserialize)]
pub struct V1Query {
    #[serde(default = "default_time")]
    pub time: i64,
}

fn default_time() -> i64 {
    -1
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub running: bool,
    pub peers: Vec<PeerStatus>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /sync/conf
pub async fn conf(State(state): State<Arc<AppState>>) -> Json<SyncConf> {
    Json(state.publisher().conf())
}

/// GET /sync/fdb/torrents?time=&start=[&spidr=true]
///
/// Buckets changed after `time`, whole buckets only, in cursor order.
pub async fn fdb_torrents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FdbQuery>,
) -> Result<Json<V2Page>, ApiError> {
    let publisher = state.publisher();
    let config = publisher.config();

    if !config.open_sync {
        return Err(api_error(StatusCode::NOT_FOUND, "bucket feed is disabled"));
    }
    if query.spidr && !config.spidr {
        return Err(api_error(StatusCode::NOT_FOUND, "spidr feed is disabled"));
    }

    match publisher.fdb_page(query.time).await {
        Ok(page) => {
            debug!(
                time = query.time,
                start = ?query.start,
                spidr = query.spidr,
                countread = page.countread,
                nextread = page.nextread,
                "Served bucket feed page"
            );
            Ok(Json(page))
        }
        Err(e) => {
            error!(time = query.time, error = %e, "Failed to build bucket feed page");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// GET /sync/torrents?time=
///
/// Legacy flat feed, only when `publish.open_sync_v1` is set.
pub async fn torrents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<V1Query>,
) -> Result<Json<V1Page>, ApiError> {
    let publisher = state.publisher();
    if !publisher.config().open_sync_v1 {
        return Err(api_error(StatusCode::NOT_FOUND, "v1 feed is disabled"));
    }

    publisher.v1_page(query.time).await.map(Json).map_err(|e| {
        error!(time = query.time, error = %e, "Failed to build v1 feed page");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// GET /sync/status
///
/// Replication state of every configured peer.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<SyncStatusResponse> {
    let sync = state.sync();
    Json(SyncStatusResponse {
        running: sync.is_running(),
        peers: sync.statuses().await,
    })
}
