//! Pull replication between nodes.
//!
//! Each configured peer gets a [`SyncReplicator`] that probes the peer's
//! capabilities, drains its delta feed from the saved cursor through the
//! [`MergeEngine`](crate::merge::MergeEngine) and checkpoints progress. The
//! [`SyncPublisher`] answers the same protocol for peers pulling from us.
//!
//! Two protocol generations exist:
//! - v1: flat list of records changed since a time (`/sync/torrents`)
//! - v2: pages of whole buckets since a cursor (`/sync/fdb/torrents`)

mod client;
mod cursor;
mod filter;
mod manager;
mod protocol;
mod publish;
mod replicator;
mod types;

pub use client::{HttpPeerClient, PeerClient};
pub use cursor::{peer_slug, CursorStore, Cursors, FileCursorStore};
pub use filter::SyncFilter;
pub use manager::SyncManager;
pub use protocol::{DrainContext, DrainOutcome, DrainStats, SyncProtocol, V1Protocol, V2Protocol};
pub use publish::SyncPublisher;
pub use replicator::{CycleReport, PeerStatus, SyncReplicator, SyncState};
pub use types::{Collections, SyncConf, V1Item, V1Page, V2Page, WireCollection};

use thiserror::Error;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cursor persistence failed: {0}")]
    Cursor(String),
}

impl SyncError {
    /// Network and payload failures are worth another attempt; local ones are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed(_)
                | Self::Status { .. }
                | Self::Http(_)
                | Self::Malformed(_)
        )
    }
}

impl From<crate::store::StoreError> for SyncError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e.to_string())
    }
}
