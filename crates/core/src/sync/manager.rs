//! Owns the replicators of every configured peer and their background loops.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::client::HttpPeerClient;
use super::cursor::FileCursorStore;
use super::replicator::{PeerStatus, SyncReplicator};
use super::SyncError;
use crate::config::SyncConfig;
use crate::merge::MergeEngine;

/// Starts and stops replication for all enabled peers.
pub struct SyncManager {
    replicators: Vec<Arc<SyncReplicator>>,
    include_spidr: bool,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    /// One replicator per enabled peer, cursors under `sync_dir/<peer>`.
    pub fn new(
        config: &SyncConfig,
        engine: Arc<MergeEngine>,
        sync_dir: &Path,
    ) -> Result<Self, SyncError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut replicators = Vec::new();

        for peer in config.peers.iter().filter(|p| p.enabled) {
            let client = HttpPeerClient::new(&peer.url, timeout)?;
            let cursors = FileCursorStore::for_peer(sync_dir, &peer.url);
            replicators.push(Arc::new(SyncReplicator::new(
                Arc::new(client),
                Arc::clone(&engine),
                Arc::new(cursors),
                config,
            )));
        }

        Ok(Self::with_replicators(replicators, config.include_spidr))
    }

    pub fn with_replicators(replicators: Vec<Arc<SyncReplicator>>, include_spidr: bool) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            replicators,
            include_spidr,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn replicators(&self) -> &[Arc<SyncReplicator>] {
        &self.replicators
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the replication loops.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sync manager already running");
            return;
        }
        if self.replicators.is_empty() {
            info!("No sync peers configured");
            return;
        }

        let mut tasks = self.tasks.lock().await;
        for replicator in &self.replicators {
            replicator.set_running();
            tasks.push(tokio::spawn(
                Arc::clone(replicator).run(self.shutdown_tx.subscribe()),
            ));
            if self.include_spidr {
                tasks.push(tokio::spawn(
                    Arc::clone(replicator).run_spidr(self.shutdown_tx.subscribe()),
                ));
            }
        }

        info!(
            peers = self.replicators.len(),
            spidr = self.include_spidr,
            "Sync manager started"
        );
    }

    /// Stop all loops. Waits for in-flight pages to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping sync manager");
        for replicator in &self.replicators {
            replicator.request_stop();
        }
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Replication task ended abnormally");
            }
        }
        info!("Sync manager stopped");
    }

    pub async fn statuses(&self) -> Vec<PeerStatus> {
        let mut statuses = Vec::with_capacity(self.replicators.len());
        for replicator in &self.replicators {
            statuses.push(replicator.status().await);
        }
        statuses
    }
}
