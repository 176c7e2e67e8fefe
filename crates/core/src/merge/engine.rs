use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::policy::AcceptRule;
use crate::config::MergeConfig;
use crate::metrics::MERGE_RECORDS;
use crate::normalize::BucketKey;
use crate::record::TorrentRecord;
use crate::store::{BucketStore, StoreError};

/// A bucket whose changes could not be committed.
#[derive(Debug)]
pub struct BucketFailure {
    pub key: BucketKey,
    pub error: StoreError,
    /// Incoming records routed to this bucket.
    pub records: usize,
}

/// Outcome of one `AddOrUpdate` batch.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Distinct buckets touched by the batch.
    pub buckets: usize,
    /// New URLs stored.
    pub inserted: usize,
    /// Accepted overwrites that changed the stored record.
    pub updated: usize,
    /// Accepted overwrites identical to what was stored.
    pub unchanged: usize,
    /// Overwrites refused by the rule.
    pub rejected: usize,
    /// Records dropped before grouping (no url).
    pub skipped: usize,
    pub failed_buckets: Vec<BucketFailure>,
}

impl MergeReport {
    pub fn is_success(&self) -> bool {
        self.failed_buckets.is_empty()
    }

    /// Records that changed stored state.
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn failed_records(&self) -> usize {
        self.failed_buckets.iter().map(|f| f.records).sum()
    }

    /// Fold another report into this one.
    pub fn combine(&mut self, other: MergeReport) {
        self.buckets += other.buckets;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.failed_buckets.extend(other.failed_buckets);
    }
}

#[derive(Debug, Default)]
struct BucketOutcome {
    inserted: usize,
    updated: usize,
    unchanged: usize,
    rejected: usize,
}

/// Conditional upsert of record batches into the bucket store.
pub struct MergeEngine {
    store: Arc<BucketStore>,
    max_concurrent_buckets: usize,
}

impl MergeEngine {
    pub fn new(store: Arc<BucketStore>, config: &MergeConfig) -> Self {
        Self {
            store,
            max_concurrent_buckets: config.max_concurrent_buckets.max(1),
        }
    }

    pub fn store(&self) -> &Arc<BucketStore> {
        &self.store
    }

    /// Merge `records` into their buckets.
    ///
    /// Records are normalized, grouped by bucket key and applied bucket by
    /// bucket under an exclusive write handle. A stored URL is overwritten
    /// only if `rule` accepts; unknown URLs are always inserted. Records
    /// sharing a URL within the batch are applied in order. A failing bucket
    /// is reported and does not affect the others.
    pub async fn add_or_update(
        &self,
        records: Vec<TorrentRecord>,
        rule: &AcceptRule,
    ) -> MergeReport {
        let now = Utc::now();
        let mut report = MergeReport::default();
        let mut groups: BTreeMap<BucketKey, Vec<TorrentRecord>> = BTreeMap::new();

        for mut record in records {
            if record.url.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            record.prepare(now);
            groups.entry(record.bucket_key()).or_default().push(record);
        }
        report.buckets = groups.len();

        let results: Vec<_> = stream::iter(groups)
            .map(|(key, records)| async move {
                let count = records.len();
                let result = self.merge_bucket(&key, records, rule).await;
                (key, count, result)
            })
            .buffer_unordered(self.max_concurrent_buckets)
            .collect()
            .await;

        for (key, count, result) in results {
            match result {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.updated += outcome.updated;
                    report.unchanged += outcome.unchanged;
                    report.rejected += outcome.rejected;
                }
                Err(error) => {
                    warn!(key = %key, records = count, error = %error, "Bucket merge failed");
                    report.failed_buckets.push(BucketFailure {
                        key,
                        error,
                        records: count,
                    });
                }
            }
        }

        MERGE_RECORDS
            .with_label_values(&["inserted"])
            .inc_by(report.inserted as u64);
        MERGE_RECORDS
            .with_label_values(&["updated"])
            .inc_by(report.updated as u64);
        MERGE_RECORDS
            .with_label_values(&["unchanged"])
            .inc_by(report.unchanged as u64);
        MERGE_RECORDS
            .with_label_values(&["rejected"])
            .inc_by(report.rejected as u64);
        MERGE_RECORDS
            .with_label_values(&["skipped"])
            .inc_by(report.skipped as u64);
        MERGE_RECORDS
            .with_label_values(&["failed"])
            .inc_by(report.failed_records() as u64);

        debug!(
            rule = rule.name(),
            buckets = report.buckets,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            rejected = report.rejected,
            skipped = report.skipped,
            failed = report.failed_buckets.len(),
            "Merge batch applied"
        );

        report
    }

    async fn merge_bucket(
        &self,
        key: &BucketKey,
        records: Vec<TorrentRecord>,
        rule: &AcceptRule,
    ) -> Result<BucketOutcome, StoreError> {
        let mut handle = self.store.open_write(key).await?;
        let mut outcome = BucketOutcome::default();

        for mut incoming in records {
            let url = incoming.url.clone();
            let accepted = match handle.get(&url) {
                Some(stored) => rule.evaluate(&mut incoming, stored, handle.records()).await,
                None => {
                    handle.insert(incoming);
                    outcome.inserted += 1;
                    continue;
                }
            };

            if !accepted {
                outcome.rejected += 1;
            } else if handle.update(&url, |stored| stored.absorb(incoming)) {
                outcome.updated += 1;
            } else {
                outcome.unchanged += 1;
            }
        }

        handle.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, StorageConfig};
    use crate::merge::AcceptPolicy;
    use crate::normalize::bucket_key;
    use crate::store::Bucket;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> MergeEngine {
        let storage = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = BucketStore::open(&storage, CacheConfig::default())
            .await
            .unwrap();
        MergeEngine::new(Arc::new(store), &MergeConfig::default())
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, hour, 0, 0).unwrap()
    }

    fn got(url: &str) -> TorrentRecord {
        let mut r = TorrentRecord::new("rutor", url, "GoT S01", "got", "game of thrones");
        r.update_time = at(1);
        r.create_time = at(1);
        r
    }

    fn got_key() -> BucketKey {
        bucket_key("got", "game of thrones")
    }

    #[tokio::test]
    async fn test_magnet_resolution_scenario() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let report = engine.add_or_update(vec![got("A")], &AcceptRule::Always).await;
        assert_eq!(report.inserted, 1);

        let mut offer = got("A");
        offer.magnet = Some("magnet:?xt=urn:btih:abc".to_string());
        offer.update_time = at(2);

        let report = engine
            .add_or_update(vec![offer.clone()], &AcceptRule::IfMagnetMissing)
            .await;
        assert_eq!(report.updated, 1);

        let bucket = engine.store().open_read(&got_key()).await.unwrap();
        let stored = &bucket["A"];
        assert_eq!(stored.magnet.as_deref(), Some("magnet:?xt=urn:btih:abc"));
        assert_eq!(stored.update_time, at(2));
        let cursor = engine.store().master().get(&got_key()).unwrap().file_time;

        let report = engine
            .add_or_update(vec![offer], &AcceptRule::IfMagnetMissing)
            .await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied(), 0);
        assert_eq!(
            engine.store().master().get(&got_key()).unwrap().file_time,
            cursor
        );
    }

    #[tokio::test]
    async fn test_duplicate_urls_leave_one_record() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let first = got("A");
        let mut second = got("A");
        second.sid = 77;

        let report = engine
            .add_or_update(vec![first, second], &AcceptRule::Always)
            .await;
        assert_eq!(report.buckets, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);

        let bucket = engine.store().read_uncached(&got_key()).await.unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket["A"].sid, 77);
    }

    #[tokio::test]
    async fn test_rejected_overwrite_leaves_record_and_file_untouched() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine.add_or_update(vec![got("A")], &AcceptRule::Always).await;

        let path = engine.store().bucket_path(&got_key());
        let bytes_before = tokio::fs::read(&path).await.unwrap();
        let before = engine.store().read_uncached(&got_key()).await.unwrap();

        let mut incoming = got("A");
        incoming.title = "Something else".to_string();
        incoming.update_time = at(5);
        let report = engine
            .add_or_update(vec![incoming], &AcceptRule::IfMagnetMissing)
            .await;

        assert_eq!(report.rejected, 1);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), bytes_before);
        assert_eq!(
            engine.store().read_uncached(&got_key()).await.unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn test_reapplying_identical_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let batch = vec![got("A"), got("B")];

        engine.add_or_update(batch.clone(), &AcceptRule::Always).await;
        let cursor = engine.store().master().get(&got_key()).unwrap().file_time;

        let report = engine.add_or_update(batch, &AcceptRule::Always).await;
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.applied(), 0);
        assert_eq!(
            engine.store().master().get(&got_key()).unwrap().file_time,
            cursor
        );
    }

    #[tokio::test]
    async fn test_groups_by_normalized_key_and_skips_missing_url() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let a = TorrentRecord::new("t1", "1", "x", "Игра престолов", "Game of Thrones");
        let b = TorrentRecord::new("t2", "2", "x", "ИГРА ПРЕСТОЛОВ", "game-of-thrones");
        let c = TorrentRecord::new("t1", "3", "x", "Pony", "Pony");
        let blank = TorrentRecord::new("t1", " ", "x", "Pony", "Pony");

        let report = engine
            .add_or_update(vec![a, b, c, blank], &AcceptRule::Always)
            .await;
        assert_eq!(report.buckets, 2);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.skipped, 1);

        let key = bucket_key("Игра престолов", "Game of Thrones");
        assert_eq!(engine.store().read_uncached(&key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_title_only_record_is_routed_by_title() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let record = TorrentRecord::new("t", "u", "Pony Express", "", "");
        engine.add_or_update(vec![record], &AcceptRule::Always).await;

        let key = bucket_key("Pony Express", "Pony Express");
        let bucket = engine.store().read_uncached(&key).await.unwrap();
        assert_eq!(bucket["u"].search_name, "ponyexpress");
    }

    #[tokio::test]
    async fn test_failed_bucket_does_not_abort_siblings() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let path = engine.store().bucket_path(&got_key());
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let pony = TorrentRecord::new("t", "p", "x", "Pony", "Pony");
        let report = engine
            .add_or_update(vec![got("A"), got("B"), pony], &AcceptRule::Always)
            .await;

        assert!(!report.is_success());
        assert_eq!(report.failed_buckets.len(), 1);
        assert_eq!(report.failed_buckets[0].key, got_key());
        assert_eq!(report.failed_records(), 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"garbage");
    }

    #[tokio::test]
    async fn test_concurrent_batches_keep_union_of_inserts() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine(&dir).await);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let batch = (0..5).map(|j| got(&format!("{i}-{j}"))).collect();
                    engine.add_or_update(batch, &AcceptRule::Always).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_success());
        }

        let bucket = engine.store().read_uncached(&got_key()).await.unwrap();
        assert_eq!(bucket.len(), 40);
    }

    struct RejectAll;

    #[async_trait]
    impl AcceptPolicy for RejectAll {
        fn name(&self) -> &str {
            "reject_all"
        }

        async fn accept(&self, _: &mut TorrentRecord, _: &TorrentRecord, _: &Bucket) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_rule_never_consulted_for_new_urls() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let rule = AcceptRule::custom(RejectAll);
        let report = engine.add_or_update(vec![got("A")], &rule).await;
        assert_eq!(report.inserted, 1);

        let report = engine.add_or_update(vec![got("A"), got("B")], &rule).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 1);
    }

    #[test]
    fn test_report_combine() {
        let mut total = MergeReport {
            buckets: 1,
            inserted: 2,
            ..Default::default()
        };
        total.combine(MergeReport {
            buckets: 2,
            updated: 3,
            skipped: 1,
            ..Default::default()
        });
        assert_eq!(total.buckets, 3);
        assert_eq!(total.applied(), 5);
        assert_eq!(total.skipped, 1);
    }
}
