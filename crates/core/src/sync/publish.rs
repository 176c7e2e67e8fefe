//! Serving side of the replication protocol.

use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{Collections, SyncConf, V1Item, V1Page, V2Page, WireCollection};
use crate::config::PublishConfig;
use crate::record::{file_time, TorrentRecord};
use crate::store::{BucketStore, StoreError};

/// Builds feed pages from the local store for peers replicating from us.
pub struct SyncPublisher {
    store: Arc<BucketStore>,
    config: PublishConfig,
}

impl SyncPublisher {
    pub fn new(store: Arc<BucketStore>, config: PublishConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Capability flags for `/sync/conf`.
    pub fn conf(&self) -> SyncConf {
        SyncConf {
            fbd: self.config.open_sync,
            spidr: self.config.spidr,
        }
    }

    /// Whole buckets changed after `time`, oldest first, until at least
    /// `page_size` records are collected.
    ///
    /// Unreadable buckets are skipped so one bad file cannot stall every peer.
    pub async fn fdb_page(&self, time: i64) -> Result<V2Page, StoreError> {
        let mut collections = Collections::new();
        let mut countread = 0;
        let mut nextread = false;

        let mut entries = self.store.master().entries_since(time).into_iter().peekable();
        while let Some((key, entry)) = entries.next() {
            let bucket = match self.store.open_read(&key).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable bucket in feed");
                    continue;
                }
            };
            if bucket.is_empty() {
                continue;
            }

            countread += bucket.len();
            collections.push(
                key,
                WireCollection {
                    file_time: entry.file_time,
                    torrents: (*bucket).clone(),
                },
            );

            if countread >= self.config.page_size {
                nextread = entries.peek().is_some();
                break;
            }
        }

        debug!(time, buckets = collections.len(), countread, nextread, "Built bucket feed page");
        Ok(V2Page {
            countread,
            nextread,
            collections: Some(collections),
        })
    }

    /// Records whose `updateTime` is after `time`, oldest first, at most `v1_take`.
    ///
    /// A page never splits records sharing one `updateTime`: the client resumes
    /// strictly after the newest time it saw, so the page runs to the end of
    /// that group and `take` reports the extended length.
    pub async fn v1_page(&self, time: i64) -> Result<V1Page, StoreError> {
        let take = self.config.v1_take;
        let mut records: Vec<(i64, TorrentRecord)> = Vec::new();

        // A bucket's cursor is never older than the records it holds.
        for (key, _) in self.store.master().entries_since(time) {
            let bucket = match self.store.open_read(&key).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable bucket in feed");
                    continue;
                }
            };
            records.extend(
                bucket
                    .values()
                    .map(|r| (file_time(&r.update_time), r))
                    .filter(|(ft, _)| *ft > time)
                    .map(|(ft, r)| (ft, r.clone())),
            );
        }

        records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.url.cmp(&b.1.url)));
        let end = if take > 0 && records.len() > take {
            let boundary = records[take - 1].0;
            take + records[take..]
                .iter()
                .take_while(|(ft, _)| *ft == boundary)
                .count()
        } else {
            take
        };
        records.truncate(end);
        let take = take.max(end);

        debug!(time, records = records.len(), take, "Built flat feed page");
        Ok(V1Page {
            take,
            torrents: records
                .into_iter()
                .map(|(_, value)| V1Item { value })
                .collect(),
        })
    }
}
