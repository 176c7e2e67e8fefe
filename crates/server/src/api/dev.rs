//! Maintenance endpoints under `/dev`.
//!
//! Every route here is behind [`loopback_only`](super::middleware::loopback_only).
//! Long scans run inside the request; callers should use a generous timeout.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use magnetdb_core::{
    BucketKey, CorruptReport, DuplicateKey, MaintenanceError, RemoveBucketReport,
    SearchNameReport,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::handlers::{api_error, ApiError};
use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MigrateRecordRequest {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MigrateRecordResponse {
    pub from: BucketKey,
    pub to: BucketKey,
}

#[derive(Debug, Deserialize)]
pub struct RemoveBucketRequest {
    pub key: String,
    /// Re-key every record to these titles instead of deleting them.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub originalname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateKeysQuery {
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub exclude_numeric: bool,
}

#[derive(Debug, Serialize)]
pub struct DuplicateKeysResponse {
    pub total: usize,
    pub keys: Vec<DuplicateKey>,
}

#[derive(Debug, Deserialize)]
pub struct FindCorruptQuery {
    #[serde(default = "default_sample")]
    pub sample: usize,
}

fn default_sample() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct MasterResponse {
    pub buckets: usize,
}

fn parse_key(raw: &str) -> Result<BucketKey, ApiError> {
    let key = BucketKey::from_raw(raw.trim());
    if !key.is_well_formed() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            MaintenanceError::InvalidKey(raw.to_string()).to_string(),
        ));
    }
    Ok(key)
}

fn maintenance_error(e: MaintenanceError) -> ApiError {
    let status = match &e {
        MaintenanceError::InvalidKey(_) | MaintenanceError::UnusableTarget(_) => {
            StatusCode::BAD_REQUEST
        }
        MaintenanceError::BucketNotFound(_) | MaintenanceError::RecordNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        MaintenanceError::MergeFailed { .. } | MaintenanceError::Store(_) => {
            error!(error = %e, "Maintenance operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /dev/rebuild_search_names
pub async fn rebuild_search_names(State(state): State<Arc<AppState>>) -> Json<SearchNameReport> {
    info!("Rebuilding search names");
    let report = state.maintenance().rebuild_search_names().await;
    if !report.failed_buckets.is_empty() {
        warn!(
            failed = report.failed_buckets.len(),
            "Search name rebuild left buckets untouched"
        );
    }
    Json(report)
}

/// POST /dev/migrate_record
pub async fn migrate_record(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MigrateRecordRequest>,
) -> Result<Json<MigrateRecordResponse>, ApiError> {
    let from = parse_key(&request.key)?;
    let to = state
        .maintenance()
        .migrate_record(&from, &request.url)
        .await
        .map_err(maintenance_error)?;
    Ok(Json(MigrateRecordResponse { from, to }))
}

/// POST /dev/remove_bucket
///
/// With both `name` and `originalname`, records are re-keyed; with neither,
/// they are deleted.
pub async fn remove_bucket(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemoveBucketRequest>,
) -> Result<Json<RemoveBucketReport>, ApiError> {
    let key = parse_key(&request.key)?;
    let rekey = match (request.name.as_deref(), request.originalname.as_deref()) {
        (Some(name), Some(originalname)) => Some((name, originalname)),
        (None, None) => None,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "name and originalname must be given together",
            ))
        }
    };

    state
        .maintenance()
        .remove_bucket(&key, rekey)
        .await
        .map(Json)
        .map_err(maintenance_error)
}

/// GET /dev/find_duplicate_keys?tracker=&exclude_numeric=
pub async fn find_duplicate_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DuplicateKeysQuery>,
) -> Json<DuplicateKeysResponse> {
    let keys = state
        .maintenance()
        .find_duplicate_keys(query.tracker.as_deref(), query.exclude_numeric)
        .await;
    Json(DuplicateKeysResponse {
        total: keys.len(),
        keys,
    })
}

/// GET /dev/find_corrupt?sample=
pub async fn find_corrupt(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FindCorruptQuery>,
) -> Json<CorruptReport> {
    Json(state.maintenance().find_corrupt(query.sample).await)
}

/// POST /dev/rebuild_master
///
/// Rescan every bucket file and persist the resulting index.
pub async fn rebuild_master(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MasterResponse>, ApiError> {
    let store = state.store();
    let buckets = store.rebuild_master().await.map_err(|e| {
        error!(error = %e, "Master index rebuild failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    store.save_master().await.map_err(|e| {
        error!(error = %e, "Failed to save rebuilt master index");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    info!(buckets, "Master index rebuilt");
    Ok(Json(MasterResponse { buckets }))
}

/// POST /dev/save_master
pub async fn save_master(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MasterResponse>, ApiError> {
    let buckets = state.store().save_master().await.map_err(|e| {
        error!(error = %e, "Failed to save master index");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(MasterResponse { buckets }))
}
