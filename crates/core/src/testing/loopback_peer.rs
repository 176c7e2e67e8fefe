//! In-process peer backed by a local [`SyncPublisher`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::sync::{PeerClient, SyncConf, SyncError, SyncPublisher, V1Page, V2Page};

/// Connects a replicator straight to another node's publisher, answering
/// the way the HTTP endpoints would, without a network in between.
pub struct LoopbackPeer {
    base_url: String,
    publisher: Arc<SyncPublisher>,
}

impl LoopbackPeer {
    pub fn new(base_url: impl Into<String>, publisher: Arc<SyncPublisher>) -> Self {
        Self {
            base_url: base_url.into(),
            publisher,
        }
    }

    fn not_found(feed: &str) -> SyncError {
        SyncError::Status {
            status: 404,
            body: format!("{} feed disabled", feed),
        }
    }
}

#[async_trait]
impl PeerClient for LoopbackPeer {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn conf(&self) -> Result<SyncConf, SyncError> {
        Ok(self.publisher.conf())
    }

    async fn torrents_v1(&self, time: i64) -> Result<V1Page, SyncError> {
        if !self.publisher.config().open_sync_v1 {
            return Err(Self::not_found("v1"));
        }
        Ok(self.publisher.v1_page(time).await?)
    }

    async fn torrents_v2(
        &self,
        time: i64,
        _start: Option<i64>,
        spidr: bool,
    ) -> Result<V2Page, SyncError> {
        let config = self.publisher.config();
        if !config.open_sync || (spidr && !config.spidr) {
            return Err(Self::not_found("bucket"));
        }
        Ok(self.publisher.fdb_page(time).await?)
    }
}
