//! Operator-triggered repairs and scans over the whole store.
//!
//! Nothing here runs on its own. Moves between buckets always copy into the
//! target first and only then remove from the source, and never hold two
//! write handles at once.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::merge::{AcceptRule, MergeEngine};
use crate::normalize::{bucket_key, BucketKey};
use crate::record::TorrentRecord;
use crate::store::{Bucket, BucketStore, StoreError};

/// Errors from maintenance operations.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Invalid bucket key {0:?}, expected name:originalname")]
    InvalidKey(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(BucketKey),

    #[error("Record {url} not found in bucket {key}")]
    RecordNotFound { key: BucketKey, url: String },

    #[error("Target key {0:?} is not usable")]
    UnusableTarget(BucketKey),

    #[error("Merge into {key} failed: {reason}")]
    MergeFailed { key: BucketKey, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`Maintenance::rebuild_search_names`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchNameReport {
    pub buckets_scanned: usize,
    pub records_updated: usize,
    pub records_migrated: usize,
    pub buckets_removed: usize,
    pub failed_buckets: Vec<String>,
}

/// Result of [`Maintenance::remove_bucket`].
#[derive(Debug, Clone, Serialize)]
pub struct RemoveBucketReport {
    pub key: BucketKey,
    pub removed: usize,
    pub migrated: usize,
    pub new_key: Option<BucketKey>,
}

/// A bucket whose two key halves are identical, such as `ponies:ponies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub key: BucketKey,
    pub count: usize,
}

/// One offending record in a [`CorruptReport`].
#[derive(Debug, Clone, Serialize)]
pub struct CorruptSample {
    pub key: BucketKey,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorruptCount {
    pub count: usize,
    pub sample: Vec<CorruptSample>,
}

impl CorruptCount {
    fn add(&mut self, key: &BucketKey, record: &TorrentRecord, sample_size: usize) {
        self.count += 1;
        if self.sample.len() < sample_size {
            self.sample.push(CorruptSample {
                key: key.clone(),
                url: record.url.clone(),
                title: record.title.clone(),
            });
        }
    }
}

/// Result of [`Maintenance::find_corrupt`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorruptReport {
    pub total_keys: usize,
    pub total_records: usize,
    pub unreadable_buckets: usize,
    pub missing_tracker_name: CorruptCount,
    pub missing_name: CorruptCount,
    pub missing_originalname: CorruptCount,
    pub empty_search_fields: CorruptCount,
}

#[derive(Debug, Default)]
struct RebuildOutcome {
    updated: usize,
    migrated: usize,
    removed: bool,
}

/// Maintenance operations over a store.
pub struct Maintenance {
    engine: Arc<MergeEngine>,
}

impl Maintenance {
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        Self { engine }
    }

    fn store(&self) -> &BucketStore {
        self.engine.store()
    }

    /// Recompute default titles and search names of every record, move
    /// records whose key changed and drop buckets left empty.
    pub async fn rebuild_search_names(&self) -> SearchNameReport {
        let mut report = SearchNameReport::default();

        for key in self.store().master().keys() {
            report.buckets_scanned += 1;
            match self.rebuild_bucket(&key).await {
                Ok(outcome) => {
                    report.records_updated += outcome.updated;
                    report.records_migrated += outcome.migrated;
                    report.buckets_removed += usize::from(outcome.removed);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Search name rebuild failed for bucket");
                    report.failed_buckets.push(key.to_string());
                }
            }
        }

        if let Err(e) = self.store().save_master().await {
            warn!(error = %e, "Failed to save master index after search name rebuild");
        }

        info!(
            buckets = report.buckets_scanned,
            updated = report.records_updated,
            migrated = report.records_migrated,
            removed = report.buckets_removed,
            failed = report.failed_buckets.len(),
            "Search names rebuilt"
        );
        report
    }

    async fn rebuild_bucket(&self, key: &BucketKey) -> Result<RebuildOutcome, MaintenanceError> {
        let snapshot = self.store().read_uncached(key).await?;

        let misplaced: Vec<TorrentRecord> = snapshot
            .values()
            .cloned()
            .filter_map(|mut record| {
                record.fill_names();
                let target = record.bucket_key();
                (target != *key && target.is_well_formed()).then_some(record)
            })
            .collect();
        let moved = self.copy_out(misplaced).await;

        let mut handle = self.store().open_write(key).await?;
        let urls: Vec<String> = handle.records().keys().cloned().collect();
        let mut outcome = RebuildOutcome::default();
        for url in urls {
            if moved.contains(&url) && handle.get(&url) == snapshot.get(&url) {
                handle.remove(&url);
                outcome.migrated += 1;
            } else if handle.update(&url, TorrentRecord::fill_names) {
                outcome.updated += 1;
            }
        }

        if handle.is_empty() {
            handle.mark_dirty();
            outcome.removed = true;
        }
        handle.commit().await?;
        Ok(outcome)
    }

    /// Merge `records` into their own buckets. Returns the URLs that landed.
    async fn copy_out(&self, records: Vec<TorrentRecord>) -> HashSet<String> {
        if records.is_empty() {
            return HashSet::new();
        }

        let targets: Vec<(String, BucketKey)> = records
            .iter()
            .map(|r| (r.url.clone(), r.bucket_key()))
            .collect();
        let report = self.engine.add_or_update(records, &AcceptRule::Always).await;
        let failed: HashSet<&BucketKey> = report.failed_buckets.iter().map(|f| &f.key).collect();

        targets
            .into_iter()
            .filter(|(_, key)| !failed.contains(key))
            .map(|(url, _)| url)
            .collect()
    }

    /// Move one record to the bucket its current titles map to.
    ///
    /// Returns the record's key afterwards. A record already in the right
    /// bucket only gets its search names refreshed.
    pub async fn migrate_record(
        &self,
        from_key: &BucketKey,
        url: &str,
    ) -> Result<BucketKey, MaintenanceError> {
        let original = self
            .store()
            .read_uncached(from_key)
            .await?
            .remove(url)
            .ok_or_else(|| MaintenanceError::RecordNotFound {
                key: from_key.clone(),
                url: url.to_string(),
            })?;

        let mut record = original.clone();
        record.fill_names();
        let target = record.bucket_key();

        if target == *from_key {
            let mut handle = self.store().open_write(from_key).await?;
            handle.update(url, TorrentRecord::fill_names);
            handle.commit().await?;
            return Ok(target);
        }
        if !target.is_well_formed() {
            return Err(MaintenanceError::UnusableTarget(target));
        }

        let report = self
            .engine
            .add_or_update(vec![record], &AcceptRule::Always)
            .await;
        if let Some(failure) = report.failed_buckets.into_iter().next() {
            return Err(MaintenanceError::MergeFailed {
                key: failure.key,
                reason: failure.error.to_string(),
            });
        }

        let mut handle = self.store().open_write(from_key).await?;
        if handle.get(url) == Some(&original) {
            handle.remove(url);
        } else {
            warn!(key = %from_key, url, "Record changed while migrating, source copy kept");
        }
        if handle.is_empty() {
            handle.mark_dirty();
        }
        handle.commit().await?;

        info!(from = %from_key, to = %target, url, "Record migrated");
        Ok(target)
    }

    /// Delete every record of a bucket, or with `rekey` move all of them
    /// under the given titles.
    pub async fn remove_bucket(
        &self,
        key: &BucketKey,
        rekey: Option<(&str, &str)>,
    ) -> Result<RemoveBucketReport, MaintenanceError> {
        if !key.as_str().contains(':') {
            return Err(MaintenanceError::InvalidKey(key.to_string()));
        }
        if self.store().master().get(key).is_none() {
            return Err(MaintenanceError::BucketNotFound(key.clone()));
        }

        let Some((name, originalname)) = rekey else {
            let mut handle = self.store().open_write(key).await?;
            let urls: Vec<String> = handle.records().keys().cloned().collect();
            for url in &urls {
                handle.remove(url);
            }
            handle.mark_dirty();
            handle.commit().await?;

            info!(key = %key, removed = urls.len(), "Bucket removed");
            return Ok(RemoveBucketReport {
                key: key.clone(),
                removed: urls.len(),
                migrated: 0,
                new_key: None,
            });
        };

        let new_key = bucket_key(name, originalname);
        if !new_key.is_well_formed() {
            return Err(MaintenanceError::UnusableTarget(new_key));
        }

        let snapshot: Bucket = self.store().read_uncached(key).await?;
        let renamed: Vec<TorrentRecord> = snapshot
            .values()
            .cloned()
            .map(|mut record| {
                record.name = name.to_string();
                record.originalname = originalname.to_string();
                record.refresh_search_names();
                record
            })
            .collect();
        let count = renamed.len();

        if new_key == *key {
            let mut handle = self.store().open_write(key).await?;
            for record in renamed {
                handle.insert(record);
            }
            handle.commit().await?;
            return Ok(RemoveBucketReport {
                key: key.clone(),
                removed: 0,
                migrated: 0,
                new_key: Some(new_key),
            });
        }

        let report = self.engine.add_or_update(renamed, &AcceptRule::Always).await;
        if let Some(failure) = report.failed_buckets.into_iter().next() {
            return Err(MaintenanceError::MergeFailed {
                key: failure.key,
                reason: failure.error.to_string(),
            });
        }

        let mut handle = self.store().open_write(key).await?;
        let mut migrated = 0;
        for (url, record) in &snapshot {
            if handle.get(url) == Some(record) {
                handle.remove(url);
                migrated += 1;
            }
        }
        if handle.is_empty() {
            handle.mark_dirty();
        }
        handle.commit().await?;

        info!(key = %key, new_key = %new_key, migrated, of = count, "Bucket re-keyed");
        Ok(RemoveBucketReport {
            key: key.clone(),
            removed: 0,
            migrated,
            new_key: Some(new_key),
        })
    }

    /// Buckets keyed `x:x`. With `tracker`, only those holding a record from
    /// it; with `exclude_numeric`, purely numeric titles (`1899:1899`) are skipped.
    pub async fn find_duplicate_keys(
        &self,
        tracker: Option<&str>,
        exclude_numeric: bool,
    ) -> Vec<DuplicateKey> {
        let tracker = tracker.map(str::trim).filter(|t| !t.is_empty());
        let mut found = Vec::new();

        for key in self.store().master().keys() {
            let (name, originalname) = key.parts();
            if name.is_empty() || originalname.is_empty() || name != originalname {
                continue;
            }
            if exclude_numeric && name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }

            let bucket = match self.store().read_uncached(&key).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    debug!(key = %key, error = %e, "Skipping unreadable bucket");
                    continue;
                }
            };
            if let Some(tracker) = tracker {
                if !bucket
                    .values()
                    .any(|r| r.tracker_name.eq_ignore_ascii_case(tracker))
                {
                    continue;
                }
            }

            found.push(DuplicateKey {
                key,
                count: bucket.len(),
            });
        }
        found
    }

    /// Count records with missing titles, tracker or search fields.
    /// Read-only; bypasses the cache.
    pub async fn find_corrupt(&self, sample_size: usize) -> CorruptReport {
        let keys = self.store().master().keys();
        let mut report = CorruptReport {
            total_keys: keys.len(),
            ..Default::default()
        };

        for key in keys {
            let bucket = match self.store().read_uncached(&key).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    debug!(key = %key, error = %e, "Unreadable bucket");
                    report.unreadable_buckets += 1;
                    continue;
                }
            };

            for record in bucket.values() {
                report.total_records += 1;
                if record.tracker_name.trim().is_empty() {
                    report.missing_tracker_name.add(&key, record, sample_size);
                }
                if record.name.trim().is_empty() {
                    report.missing_name.add(&key, record, sample_size);
                }
                if record.originalname.trim().is_empty() {
                    report.missing_originalname.add(&key, record, sample_size);
                }
                if record.search_name.is_empty() || record.search_originalname.is_empty() {
                    report.empty_search_fields.add(&key, record, sample_size);
                }
            }
        }
        report
    }
}
