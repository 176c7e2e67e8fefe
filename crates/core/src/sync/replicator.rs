//! Per-peer replication loop.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::client::PeerClient;
use super::cursor::{CursorStore, Cursors};
use super::filter::SyncFilter;
use super::protocol::{
    DrainContext, DrainOutcome, DrainSettings, DrainStats, SyncProtocol, V1Protocol, V2Protocol,
};
use super::SyncError;
use crate::config::{redact_url_credentials, SyncConfig};
use crate::merge::MergeEngine;
use crate::metrics::{SYNC_CYCLES, SYNC_CYCLE_DURATION};
use crate::record::format_file_time;

/// Where a replicator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Probing,
    Draining,
    Checkpointed,
}

/// Observable state of one peer's replication.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer: String,
    pub state: SyncState,
    /// Protocol used by the current or last cycle.
    pub protocol: Option<&'static str>,
    pub lastsync: i64,
    pub starsync: i64,
    pub cycles: u64,
    pub failures: u64,
    pub records_applied: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Result of one replication cycle or spidr pass.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub protocol: &'static str,
    pub outcome: DrainOutcome,
    pub cursors_before: Cursors,
    pub cursors: Cursors,
    pub stats: DrainStats,
    pub duration: Duration,
}

impl CycleReport {
    pub fn applied(&self) -> usize {
        self.stats.applied
    }
}

/// Pulls one peer's feed into the local store.
pub struct SyncReplicator {
    peer: Arc<dyn PeerClient>,
    peer_label: String,
    engine: Arc<MergeEngine>,
    cursor_store: Arc<dyn CursorStore>,
    filter: SyncFilter,
    config: SyncConfig,
    running: Arc<AtomicBool>,
    status: RwLock<PeerStatus>,
    // Loaded lazily; the lock also keeps cycles for one peer sequential.
    cursors: Mutex<Option<Cursors>>,
}

impl SyncReplicator {
    pub fn new(
        peer: Arc<dyn PeerClient>,
        engine: Arc<MergeEngine>,
        cursor_store: Arc<dyn CursorStore>,
        config: &SyncConfig,
    ) -> Self {
        let peer_label = redact_url_credentials(peer.base_url());
        Self {
            status: RwLock::new(PeerStatus {
                peer: peer_label.clone(),
                state: SyncState::Idle,
                protocol: None,
                lastsync: -1,
                starsync: -1,
                cycles: 0,
                failures: 0,
                records_applied: 0,
                last_started: None,
                last_finished: None,
                last_error: None,
            }),
            peer,
            peer_label,
            engine,
            cursor_store,
            filter: SyncFilter::from_config(config),
            config: config.clone(),
            running: Arc::new(AtomicBool::new(true)),
            cursors: Mutex::new(None),
        }
    }

    pub fn with_filter(mut self, filter: SyncFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn peer_url(&self) -> &str {
        &self.peer_label
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ask the loops to stop. A page in flight is finished first.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn status(&self) -> PeerStatus {
        self.status.read().await.clone()
    }

    async fn set_state(&self, state: SyncState) {
        self.status.write().await.state = state;
    }

    /// Run one full cycle: probe, drain, checkpoint.
    ///
    /// On error every page applied before the failure stays applied and its
    /// cursor is persisted; the next cycle resumes from there.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let mut cached = self.cursors.lock().await;
        let started = Instant::now();

        let cursors_before = match *cached {
            Some(cursors) => cursors,
            None => match self.cursor_store.load().await {
                Ok(cursors) => cursors,
                Err(e) => return Err(self.record_failure(e, started).await),
            },
        };
        *cached = Some(cursors_before);

        {
            let mut status = self.status.write().await;
            status.state = SyncState::Probing;
            status.lastsync = cursors_before.lastsync;
            status.starsync = cursors_before.starsync;
            status.last_started = Some(Utc::now());
        }
        info!(
            peer = %self.peer_label,
            lastsync = cursors_before.lastsync,
            lastsync_at = %format_file_time(cursors_before.lastsync),
            starsync = cursors_before.starsync,
            "Replication cycle started"
        );

        let conf = match self.peer.conf().await {
            Ok(conf) => conf,
            Err(e) => return Err(self.record_failure(e, started).await),
        };
        let protocol: Box<dyn SyncProtocol> = if conf.fbd {
            Box::new(V2Protocol::main())
        } else {
            Box::new(V1Protocol)
        };
        debug!(peer = %self.peer_label, protocol = protocol.name(), spidr = conf.spidr, "Peer probed");

        {
            let mut status = self.status.write().await;
            status.state = SyncState::Draining;
            status.protocol = Some(protocol.name());
        }

        let mut ctx = DrainContext::new(
            self.peer.as_ref(),
            &self.engine,
            self.cursor_store.as_ref(),
            &self.filter,
            &self.running,
            DrainSettings::from_config(&self.config),
            cursors_before,
            true,
        );
        let drained = protocol.drain(&mut ctx).await;
        let cursors = ctx.cursors();
        let stats = ctx.stats();
        *cached = Some(cursors);

        self.set_state(SyncState::Checkpointed).await;
        let persisted = if drained.is_ok() || cursors.lastsync > 0 {
            self.persist(cursors).await
        } else {
            Ok(())
        };

        {
            let mut status = self.status.write().await;
            status.lastsync = cursors.lastsync;
            status.starsync = cursors.starsync;
            status.records_applied += stats.applied as u64;
        }

        let outcome = match (drained, persisted) {
            (Ok(outcome), Ok(())) => outcome,
            (Err(e), _) | (Ok(_), Err(e)) => return Err(self.record_failure(e, started).await),
        };

        let report = CycleReport {
            protocol: protocol.name(),
            outcome,
            cursors_before,
            cursors,
            stats,
            duration: started.elapsed(),
        };
        self.record_success(&report).await;
        Ok(report)
    }

    async fn persist(&self, cursors: Cursors) -> Result<(), SyncError> {
        self.engine.store().save_master().await?;
        self.cursor_store.save_lastsync(cursors.lastsync).await
    }

    async fn record_success(&self, report: &CycleReport) {
        SYNC_CYCLES
            .with_label_values(&[&self.peer_label, "ok"])
            .inc();
        SYNC_CYCLE_DURATION
            .with_label_values(&[&self.peer_label])
            .observe(report.duration.as_secs_f64());

        {
            let mut status = self.status.write().await;
            status.state = SyncState::Idle;
            status.cycles += 1;
            status.last_finished = Some(Utc::now());
            status.last_error = None;
        }

        info!(
            peer = %self.peer_label,
            protocol = report.protocol,
            outcome = ?report.outcome,
            pages = report.stats.pages,
            received = report.stats.received,
            applied = report.stats.applied,
            lastsync = report.cursors.lastsync,
            lastsync_at = %format_file_time(report.cursors.lastsync),
            starsync = report.cursors.starsync,
            duration_ms = report.duration.as_millis() as u64,
            "Replication cycle finished"
        );
    }

    async fn record_failure(&self, e: SyncError, started: Instant) -> SyncError {
        SYNC_CYCLES
            .with_label_values(&[&self.peer_label, "error"])
            .inc();
        SYNC_CYCLE_DURATION
            .with_label_values(&[&self.peer_label])
            .observe(started.elapsed().as_secs_f64());

        {
            let mut status = self.status.write().await;
            status.state = SyncState::Idle;
            status.cycles += 1;
            status.failures += 1;
            status.last_finished = Some(Utc::now());
            status.last_error = Some(e.to_string());
        }

        error!(peer = %self.peer_label, error = %e, "Replication cycle failed");
        e
    }

    /// Drain the peer's spidr feed once. `None` if the peer does not offer it.
    pub async fn run_spidr_pass(&self) -> Result<Option<CycleReport>, SyncError> {
        let conf = self.peer.conf().await?;
        if !conf.spidr {
            debug!(peer = %self.peer_label, "Peer does not offer spidr feed");
            return Ok(None);
        }

        let started = Instant::now();
        let protocol = V2Protocol::spidr();
        let mut ctx = DrainContext::new(
            self.peer.as_ref(),
            &self.engine,
            self.cursor_store.as_ref(),
            &self.filter,
            &self.running,
            DrainSettings::from_config(&self.config),
            Cursors::default(),
            false,
        );
        let outcome = protocol.drain(&mut ctx).await?;

        let report = CycleReport {
            protocol: protocol.name(),
            outcome,
            cursors_before: Cursors::default(),
            cursors: ctx.cursors(),
            stats: ctx.stats(),
            duration: started.elapsed(),
        };
        info!(
            peer = %self.peer_label,
            pages = report.stats.pages,
            received = report.stats.received,
            applied = report.stats.applied,
            duration_ms = report.duration.as_millis() as u64,
            "Spidr pass finished"
        );
        Ok(Some(report))
    }

    /// Pause before the next main cycle: jitter plus `max(interval, min_interval)`.
    pub fn next_cycle_delay(&self) -> Duration {
        let lo = self.config.jitter_min_secs.min(self.config.jitter_max_secs);
        let hi = self.config.jitter_min_secs.max(self.config.jitter_max_secs);
        let jitter = rand::rng().random_range(lo..=hi);
        let minutes = self
            .config
            .interval_minutes
            .max(self.config.min_interval_minutes);
        Duration::from_secs(jitter + minutes * 60)
    }

    pub fn spidr_delay(&self) -> Duration {
        let minutes = self
            .config
            .spidr_interval_minutes
            .max(self.config.min_interval_minutes);
        Duration::from_secs(minutes * 60)
    }

    /// Main replication loop. Returns on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(peer = %self.peer_label, "Replication loop started");

        let startup = Duration::from_secs(self.config.startup_delay_secs);
        tokio::select! {
            _ = shutdown.recv() => {
                info!(peer = %self.peer_label, "Replication loop stopped before first cycle");
                return;
            }
            _ = tokio::time::sleep(startup) => {}
        }

        loop {
            if !self.is_running() {
                break;
            }
            // Failures are logged and recorded in the status.
            let _ = self.run_cycle().await;

            let delay = self.next_cycle_delay();
            debug!(peer = %self.peer_label, delay_secs = delay.as_secs(), "Next replication cycle scheduled");
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(peer = %self.peer_label, "Replication loop stopped");
    }

    /// Spidr loop: waits one interval, then drains with a fresh cursor.
    pub async fn run_spidr(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(peer = %self.peer_label, "Spidr loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.spidr_delay()) => {}
            }
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.run_spidr_pass().await {
                warn!(peer = %self.peer_label, error = %e, "Spidr pass failed");
            }
        }
        info!(peer = %self.peer_label, "Spidr loop stopped");
    }
}
