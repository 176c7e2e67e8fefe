//! Mock replication peer for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::normalize::BucketKey;
use crate::record::{file_time, TorrentRecord};
use crate::store::Bucket;
use crate::sync::{
    Collections, PeerClient, SyncConf, SyncError, V1Item, V1Page, V2Page, WireCollection,
};

/// A recorded v2 request: `(time, start, spidr)`.
pub type RecordedV2Request = (i64, Option<i64>, bool);

/// Mock implementation of the PeerClient trait.
///
/// Serves a scripted dataset the way a well-behaved peer would:
/// - v2 pages of up to `buckets_per_page` buckets with `fileTime > time`,
///   `nextread` set whenever a page is full
/// - v1 pages of up to `v1_take` records with `updateTime > time`
///
/// Failures can be injected per request and every page request is recorded.
///
/// # Example
///
/// ```rust,ignore
/// use magnetdb_core::testing::{MockPeer, fixtures};
///
/// let peer = MockPeer::new("http://peer.test").with_buckets_per_page(2);
/// peer.add_collection(100, vec![fixtures::record("u1", "Title", "Title")]).await;
/// peer.fail_next(1);
///
/// // ... run a replicator against it ...
///
/// assert_eq!(peer.v2_requests().await[0], (-1, Some(-1), false));
/// ```
pub struct MockPeer {
    base_url: String,
    conf: Arc<RwLock<SyncConf>>,
    /// Bucket feed, kept in ascending `fileTime` order.
    collections: Arc<RwLock<Vec<(BucketKey, WireCollection)>>>,
    v1_records: Arc<RwLock<Vec<TorrentRecord>>>,
    buckets_per_page: usize,
    v1_take: usize,
    v1_requests: Arc<RwLock<Vec<i64>>>,
    v2_requests: Arc<RwLock<Vec<RecordedV2Request>>>,
    /// Requests of any kind that will fail with a connection error.
    failures: Arc<AtomicUsize>,
    /// Page requests that will answer with `collections: null`.
    malformed: Arc<AtomicUsize>,
    /// Page requests that succeed before every further one fails.
    ok_budget: Arc<AtomicUsize>,
    ignore_v1_cursor: Arc<AtomicBool>,
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("base_url", &self.base_url)
            .field("buckets_per_page", &self.buckets_per_page)
            .field("v1_take", &self.v1_take)
            .field("collections", &"<collections>")
            .field("v1_records", &"<records>")
            .finish()
    }
}

impl MockPeer {
    /// A peer offering the bucket feed and no spidr feed.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            conf: Arc::new(RwLock::new(SyncConf {
                fbd: true,
                spidr: false,
            })),
            collections: Arc::new(RwLock::new(Vec::new())),
            v1_records: Arc::new(RwLock::new(Vec::new())),
            buckets_per_page: 100,
            v1_take: 1000,
            v1_requests: Arc::new(RwLock::new(Vec::new())),
            v2_requests: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
            malformed: Arc::new(AtomicUsize::new(0)),
            ok_budget: Arc::new(AtomicUsize::new(usize::MAX)),
            ignore_v1_cursor: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_buckets_per_page(mut self, buckets: usize) -> Self {
        self.buckets_per_page = buckets.max(1);
        self
    }

    pub fn with_v1_take(mut self, take: usize) -> Self {
        self.v1_take = take.max(1);
        self
    }

    pub async fn set_conf(&self, conf: SyncConf) {
        *self.conf.write().await = conf;
    }

    /// Add one bucket to the feed. The key is derived from the first record.
    pub async fn add_collection(&self, file_time: i64, records: Vec<TorrentRecord>) {
        let key = records
            .first()
            .map(TorrentRecord::bucket_key)
            .unwrap_or_else(|| BucketKey::from_raw(format!("empty{}:", file_time)));
        let torrents: Bucket = records.into_iter().map(|r| (r.url.clone(), r)).collect();

        let mut collections = self.collections.write().await;
        collections.push((
            key,
            WireCollection {
                file_time,
                torrents,
            },
        ));
        collections.sort_by_key(|(_, c)| c.file_time);
    }

    pub async fn add_v1_record(&self, record: TorrentRecord) {
        self.v1_records.write().await.push(record);
    }

    pub async fn clear(&self) {
        self.collections.write().await.clear();
        self.v1_records.write().await.clear();
    }

    /// The next `count` requests of any kind fail with a connection error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` v2 page requests answer without `collections`.
    pub fn malformed_next(&self, count: usize) {
        self.malformed.store(count, Ordering::SeqCst);
    }

    /// Serve `count` more page requests, then fail every one after that.
    /// `usize::MAX` turns the limit off.
    pub fn fail_after(&self, count: usize) {
        self.ok_budget.store(count, Ordering::SeqCst);
    }

    /// Serve v1 pages from the start regardless of the requested cursor.
    pub fn serve_v1_ignoring_cursor(&self, ignore: bool) {
        self.ignore_v1_cursor.store(ignore, Ordering::SeqCst);
    }

    pub async fn v1_requests(&self) -> Vec<i64> {
        self.v1_requests.read().await.clone()
    }

    pub async fn v2_requests(&self) -> Vec<RecordedV2Request> {
        self.v2_requests.read().await.clone()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected_failure(&self) -> Result<(), SyncError> {
        if Self::take_one(&self.failures) {
            return Err(SyncError::ConnectionFailed("injected failure".to_string()));
        }
        Ok(())
    }

    fn spend_page_budget(&self) -> Result<(), SyncError> {
        let spent = self
            .ok_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == usize::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_ok();
        if spent {
            Ok(())
        } else {
            Err(SyncError::Timeout)
        }
    }
}

#[async_trait]
impl PeerClient for MockPeer {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn conf(&self) -> Result<SyncConf, SyncError> {
        self.injected_failure()?;
        Ok(*self.conf.read().await)
    }

    async fn torrents_v1(&self, time: i64) -> Result<V1Page, SyncError> {
        self.v1_requests.write().await.push(time);
        self.injected_failure()?;
        self.spend_page_budget()?;

        let ignore_cursor = self.ignore_v1_cursor.load(Ordering::SeqCst);
        let mut records: Vec<TorrentRecord> = self
            .v1_records
            .read()
            .await
            .iter()
            .filter(|r| ignore_cursor || file_time(&r.update_time) > time)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.update_time);
        records.truncate(self.v1_take);

        Ok(V1Page {
            take: self.v1_take,
            torrents: records.into_iter().map(|value| V1Item { value }).collect(),
        })
    }

    async fn torrents_v2(
        &self,
        time: i64,
        start: Option<i64>,
        spidr: bool,
    ) -> Result<V2Page, SyncError> {
        self.v2_requests.write().await.push((time, start, spidr));
        self.injected_failure()?;
        self.spend_page_budget()?;

        if Self::take_one(&self.malformed) {
            return Ok(V2Page::default());
        }

        let collections: Collections = self
            .collections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.file_time > time)
            .take(self.buckets_per_page)
            .cloned()
            .collect();

        Ok(V2Page {
            countread: collections.record_count(),
            nextread: collections.len() == self.buckets_per_page,
            collections: Some(collections),
        })
    }
}
