//! Testing utilities and mock implementations.
//!
//! This module provides mocks for the replication seams so replicators,
//! publishers and whole two-node setups can be tested without a network.
//!
//! # Example
//!
//! ```rust,ignore
//! use magnetdb_core::testing::{fixtures, MemoryCursorStore, MockPeer};
//!
//! let peer = MockPeer::new("http://peer.test");
//! peer.add_collection(100, vec![fixtures::record("u1", "Title", "Title")]).await;
//!
//! let cursors = MemoryCursorStore::new();
//! // Build a SyncReplicator with Arc::new(peer) and Arc::new(cursors)...
//! ```

mod loopback_peer;
mod mock_cursor_store;
mod mock_peer;

pub use loopback_peer::LoopbackPeer;
pub use mock_cursor_store::MemoryCursorStore;
pub use mock_peer::{MockPeer, RecordedV2Request};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::record::TorrentRecord;

    /// A record with the given titles and reasonable defaults.
    pub fn record(url: &str, name: &str, originalname: &str) -> TorrentRecord {
        let mut r = TorrentRecord::new("mock-tracker", url, name, name, originalname);
        r.types.insert("movie".to_string());
        r.size_name = "1.4 GB".to_string();
        r.sid = 10;
        r.pir = 2;
        r
    }

    /// Same as [`record`], with a resolved magnet.
    pub fn record_with_magnet(url: &str, name: &str, originalname: &str) -> TorrentRecord {
        let mut r = record(url, name, originalname);
        r.magnet = Some(format!("magnet:?xt=urn:btih:{:0>40}", url.len()));
        r
    }
}
