//! Protocol generations as drain strategies.
//!
//! A replicator probes the peer once per cycle and then hands a
//! [`DrainContext`] to the matching [`SyncProtocol`]. The context owns the
//! cursors and everything protocols share: page retries with backoff,
//! merging, periodic checkpoints and the stop flag.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::client::PeerClient;
use super::cursor::{CursorStore, Cursors};
use super::filter::SyncFilter;
use super::SyncError;
use crate::config::{redact_url_credentials, SyncConfig};
use crate::merge::{AcceptRule, MergeEngine};
use crate::metrics::{SYNC_PAGES, SYNC_RECORDS_APPLIED};
use crate::record::{file_time, format_file_time, TorrentRecord};

/// How a drain ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The peer had nothing further to send.
    Converged,
    /// Stopped between pages because the replicator is shutting down.
    Stopped,
}

/// One protocol generation.
#[async_trait]
pub trait SyncProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pull pages until the peer runs dry, the replicator stops or a page fails.
    async fn drain(&self, ctx: &mut DrainContext<'_>) -> Result<DrainOutcome, SyncError>;
}

#[derive(Debug, Clone)]
pub(crate) struct DrainSettings {
    pub page_retries: u32,
    pub retry_backoff: Duration,
    pub checkpoint_interval: Duration,
}

impl DrainSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            page_retries: config.page_retries,
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs),
        }
    }
}

/// Counters for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub pages: usize,
    /// Records received from the peer, before filtering.
    pub received: usize,
    /// Records that changed local state.
    pub applied: usize,
    pub checkpoints: usize,
}

/// Shared state of one drain.
pub struct DrainContext<'a> {
    peer: &'a dyn PeerClient,
    peer_label: String,
    engine: &'a MergeEngine,
    cursor_store: &'a dyn CursorStore,
    filter: &'a SyncFilter,
    running: &'a AtomicBool,
    settings: DrainSettings,
    persist: bool,
    cursors: Cursors,
    stats: DrainStats,
    last_checkpoint: Instant,
}

impl<'a> DrainContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer: &'a dyn PeerClient,
        engine: &'a MergeEngine,
        cursor_store: &'a dyn CursorStore,
        filter: &'a SyncFilter,
        running: &'a AtomicBool,
        settings: DrainSettings,
        cursors: Cursors,
        persist: bool,
    ) -> Self {
        Self {
            peer,
            peer_label: redact_url_credentials(peer.base_url()),
            engine,
            cursor_store,
            filter,
            running,
            settings,
            persist,
            cursors,
            stats: DrainStats::default(),
            last_checkpoint: Instant::now(),
        }
    }

    pub fn cursors(&self) -> Cursors {
        self.cursors
    }

    pub fn stats(&self) -> DrainStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run `request`, retrying retryable failures with exponential backoff.
    async fn fetch<T, F, Fut>(&mut self, protocol: &'static str, mut request: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SyncError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            match request().await {
                Ok(page) => {
                    SYNC_PAGES
                        .with_label_values(&[&self.peer_label, protocol, "ok"])
                        .inc();
                    self.stats.pages += 1;
                    return Ok(page);
                }
                Err(e) => {
                    SYNC_PAGES
                        .with_label_values(&[&self.peer_label, protocol, "error"])
                        .inc();
                    if !e.is_retryable()
                        || attempt >= self.settings.page_retries
                        || !self.is_running()
                    {
                        return Err(e);
                    }

                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        peer = %self.peer_label,
                        protocol,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Page request failed, retrying"
                    );
                    self.pause(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Sleep for `delay`, returning early once the replicator stops.
    async fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_secs(1))).await;
        }
    }

    /// Merge with the accept-all rule. Any failed bucket fails the page.
    async fn apply(&mut self, records: Vec<TorrentRecord>) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }

        let report = self.engine.add_or_update(records, &AcceptRule::Always).await;
        self.stats.applied += report.applied();
        SYNC_RECORDS_APPLIED
            .with_label_values(&[&self.peer_label])
            .inc_by(report.applied() as u64);

        if let Some(failure) = report.failed_buckets.first() {
            return Err(SyncError::Store(format!(
                "{} of {} buckets failed to merge, first {}: {}",
                report.failed_buckets.len(),
                report.buckets,
                failure.key,
                failure.error
            )));
        }
        Ok(())
    }

    /// Move `lastsync` forward to `cursor`. Returns whether it moved.
    fn advance(&mut self, cursor: i64) -> bool {
        let before = self.cursors.lastsync;
        self.cursors.lastsync = before.max(cursor);
        self.cursors.lastsync > before
    }

    /// Persist `lastsync` once the checkpoint interval has passed, or now if `force`.
    async fn checkpoint(&mut self, force: bool) -> Result<(), SyncError> {
        if !self.persist {
            return Ok(());
        }
        if !force && self.last_checkpoint.elapsed() < self.settings.checkpoint_interval {
            return Ok(());
        }

        self.engine.store().save_master().await?;
        self.cursor_store.save_lastsync(self.cursors.lastsync).await?;
        self.last_checkpoint = Instant::now();
        self.stats.checkpoints += 1;

        info!(
            peer = %self.peer_label,
            lastsync = self.cursors.lastsync,
            at = %format_file_time(self.cursors.lastsync),
            "Replication checkpoint"
        );
        Ok(())
    }

    /// A full pass reached the head: `starsync = lastsync`, both persisted.
    async fn promote_starsync(&mut self) -> Result<(), SyncError> {
        if !self.persist {
            return Ok(());
        }
        self.cursors.starsync = self.cursors.lastsync;
        self.cursor_store.save_lastsync(self.cursors.lastsync).await?;
        self.cursor_store.save_starsync(self.cursors.starsync).await?;
        Ok(())
    }
}

/// Flat "changed since" feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Protocol;

#[async_trait]
impl SyncProtocol for V1Protocol {
    fn name(&self) -> &'static str {
        "v1"
    }

    async fn drain(&self, ctx: &mut DrainContext<'_>) -> Result<DrainOutcome, SyncError> {
        let peer = ctx.peer;
        loop {
            if !ctx.is_running() {
                return Ok(DrainOutcome::Stopped);
            }

            let time = ctx.cursors.lastsync;
            let page = ctx
                .fetch(self.name(), || async move { peer.torrents_v1(time).await })
                .await?;

            if page.torrents.is_empty() {
                return Ok(DrainOutcome::Converged);
            }

            let full = page.take > 0 && page.take == page.torrents.len();
            let newest = page
                .torrents
                .iter()
                .map(|item| file_time(&item.value.update_time))
                .max()
                .unwrap_or(time);
            let received = page.torrents.len();
            ctx.stats.received += received;

            let records = ctx
                .filter
                .apply(page.torrents.into_iter().map(|item| item.value).collect());
            let kept = records.len();
            ctx.apply(records).await?;
            let advanced = ctx.advance(newest);

            info!(
                peer = %ctx.peer_label,
                time,
                at = %format_file_time(time),
                received,
                kept,
                more = full,
                "Replication page applied"
            );

            if !full {
                return Ok(DrainOutcome::Converged);
            }
            if !advanced {
                return Err(SyncError::Malformed(format!(
                    "full page did not advance cursor past {}",
                    time
                )));
            }
            ctx.checkpoint(false).await?;
        }
    }
}

/// Paginated bucket feed, main or spidr.
#[derive(Debug, Clone, Copy)]
pub struct V2Protocol {
    spidr: bool,
}

impl V2Protocol {
    /// The main feed: filtered, checkpointed, promotes `starsync` on convergence.
    pub fn main() -> Self {
        Self { spidr: false }
    }

    /// The secondary feed: unfiltered, nothing persisted.
    pub fn spidr() -> Self {
        Self { spidr: true }
    }
}

#[async_trait]
impl SyncProtocol for V2Protocol {
    fn name(&self) -> &'static str {
        if self.spidr {
            "spidr"
        } else {
            "v2"
        }
    }

    async fn drain(&self, ctx: &mut DrainContext<'_>) -> Result<DrainOutcome, SyncError> {
        let peer = ctx.peer;
        let spidr = self.spidr;
        loop {
            if !ctx.is_running() {
                return Ok(DrainOutcome::Stopped);
            }

            let time = ctx.cursors.lastsync;
            let start = (!spidr).then_some(ctx.cursors.starsync);
            let page = ctx
                .fetch(self.name(), || async move {
                    let page = peer.torrents_v2(time, start, spidr).await?;
                    if page.collections.is_none() {
                        return Err(SyncError::Malformed("missing collections".to_string()));
                    }
                    Ok(page)
                })
                .await?;

            let nextread = page.nextread;
            let collections = page.collections.unwrap_or_default();
            if collections.is_empty() {
                info!(peer = %ctx.peer_label, protocol = self.name(), time, "Peer has no newer buckets");
                ctx.promote_starsync().await?;
                return Ok(DrainOutcome::Converged);
            }

            let newest = collections.max_file_time().unwrap_or(time);
            let buckets = collections.len();
            let records = collections.into_records();
            let received = records.len();
            ctx.stats.received += received;

            let records = if spidr {
                records
            } else {
                ctx.filter.apply(records)
            };
            let kept = records.len();
            ctx.apply(records).await?;
            let advanced = ctx.advance(newest);

            info!(
                peer = %ctx.peer_label,
                protocol = self.name(),
                time,
                at = %format_file_time(time),
                start = ?start,
                buckets,
                received,
                kept,
                countread = page.countread,
                nextread,
                "Replication page applied"
            );

            if !nextread {
                ctx.promote_starsync().await?;
                return Ok(DrainOutcome::Converged);
            }
            if !advanced {
                return Err(SyncError::Malformed(format!(
                    "nextread page did not advance cursor past {}",
                    time
                )));
            }
            ctx.checkpoint(false).await?;
        }
    }
}
