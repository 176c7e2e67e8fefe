//! Store housekeeping loops: cache purge and master index snapshots.

use std::sync::Arc;
use std::time::Duration;

use magnetdb_core::{BucketStore, Config};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics::{CACHE_PURGED_TOTAL, MASTER_SAVES_TOTAL};

/// Background tasks that keep the store tidy while the server runs.
pub struct Housekeeping {
    store: Arc<BucketStore>,
    purge_interval: Duration,
    save_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Housekeeping {
    pub fn new(store: Arc<BucketStore>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            purge_interval: Duration::from_secs(config.cache.purge_interval_secs.max(1)),
            save_interval: Duration::from_secs(config.storage.master_save_interval_secs.max(1)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Housekeeping already running");
            return;
        }

        let store = Arc::clone(&self.store);
        tasks.push(spawn_every(
            self.purge_interval,
            self.shutdown_tx.subscribe(),
            move || {
                let store = Arc::clone(&store);
                async move {
                    purge_cache(&store);
                }
            },
        ));

        let store = Arc::clone(&self.store);
        tasks.push(spawn_every(
            self.save_interval,
            self.shutdown_tx.subscribe(),
            move || {
                let store = Arc::clone(&store);
                async move {
                    save_master(&store).await;
                }
            },
        ));

        info!(
            purge_interval_secs = self.purge_interval.as_secs(),
            save_interval_secs = self.save_interval.as_secs(),
            "Housekeeping started"
        );
    }

    /// Stop both loops and wait for a running tick to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Housekeeping task ended abnormally");
            }
        }
        info!("Housekeeping stopped");
    }
}

fn spawn_every<F, Fut>(
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Drop expired read snapshots. Returns how many were dropped.
pub fn purge_cache(store: &BucketStore) -> usize {
    let purged = store.cache().purge_expired();
    if purged > 0 {
        CACHE_PURGED_TOTAL.inc_by(purged as u64);
        debug!(purged, "Purged expired bucket snapshots");
    }
    purged
}

/// Write the master index snapshot, logging failures.
pub async fn save_master(store: &BucketStore) -> bool {
    match store.save_master().await {
        Ok(buckets) => {
            MASTER_SAVES_TOTAL.with_label_values(&["ok"]).inc();
            debug!(buckets, "Master index saved");
            true
        }
        Err(e) => {
            MASTER_SAVES_TOTAL.with_label_values(&["error"]).inc();
            error!(error = %e, "Failed to save master index");
            false
        }
    }
}
