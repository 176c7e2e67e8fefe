//! Read-snapshot cache and write-handle limiter in front of the bucket files.

use lru::LruCache;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{Bucket, StoreError};
use crate::config::CacheConfig;
use crate::metrics::{CACHE_EVICTIONS, CACHE_LOOKUPS};
use crate::normalize::BucketKey;

struct CachedBucket {
    bucket: Arc<Bucket>,
    loaded_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Cached read snapshots.
    pub entries: usize,
    /// Buckets with an open write handle.
    pub open_writers: usize,
    /// Write handles that can still be opened without waiting.
    pub available_write_slots: usize,
}

/// Bounded cache of bucket snapshots.
///
/// Snapshots older than the TTL are reloaded. When the cache grows past
/// `max_entries`, the `drop_take` least recently used entries are dropped in
/// one pass; buckets with an open writer are never dropped. Write handles are
/// limited by a semaphore so callers wait instead of piling up open files.
pub struct EvictionCache {
    config: CacheConfig,
    entries: Mutex<LruCache<BucketKey, CachedBucket>>,
    writers: Arc<Mutex<HashSet<BucketKey>>>,
    write_slots: Arc<Semaphore>,
}

/// A held write slot. Releases the slot and the writer mark on drop.
pub struct WriteSlot {
    key: BucketKey,
    writers: Arc<Mutex<HashSet<BucketKey>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl EvictionCache {
    pub fn new(config: CacheConfig) -> Self {
        let write_slots = Arc::new(Semaphore::new(config.max_open_writers));
        Self {
            config,
            entries: Mutex::new(LruCache::unbounded()),
            writers: Arc::new(Mutex::new(HashSet::new())),
            write_slots,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Cached snapshot of `key`, if present and fresh.
    pub fn get(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        if !self.config.enabled {
            return None;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match entries.peek(key) {
            Some(cached) => cached.loaded_at.elapsed() > self.ttl(),
            None => {
                CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                return None;
            }
        };

        if expired {
            if !self.has_writer(key) {
                entries.pop(key);
                CACHE_EVICTIONS.inc();
            }
            CACHE_LOOKUPS.with_label_values(&["expired"]).inc();
            return None;
        }

        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
        entries.get(key).map(|cached| Arc::clone(&cached.bucket))
    }

    /// Store a fresh snapshot, shrinking the cache if it grew past its bound.
    pub fn insert(&self, key: BucketKey, bucket: Arc<Bucket>) {
        if !self.config.enabled {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(
            key,
            CachedBucket {
                bucket,
                loaded_at: Instant::now(),
            },
        );

        if entries.len() > self.config.max_entries {
            let dropped = self.evict_locked(&mut entries, self.config.drop_take);
            debug!(dropped, remaining = entries.len(), "Bucket cache shrunk");
        }
    }

    fn has_writer(&self, key: &BucketKey) -> bool {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn invalidate(&self, key: &BucketKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(key);
    }

    /// Drop up to `count` least recently used snapshots. Returns how many were dropped.
    pub fn evict_oldest(&self, count: usize) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_locked(&mut entries, count)
    }

    fn evict_locked(&self, entries: &mut LruCache<BucketKey, CachedBucket>, count: usize) -> usize {
        let writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        let victims: Vec<BucketKey> = entries
            .iter()
            .rev()
            .filter(|(key, _)| !writers.contains(*key))
            .take(count)
            .map(|(key, _)| key.clone())
            .collect();
        drop(writers);

        for key in &victims {
            entries.pop(key);
        }
        CACHE_EVICTIONS.inc_by(victims.len() as u64);
        victims.len()
    }

    /// Drop every snapshot older than the TTL, except buckets with an open writer.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<BucketKey> = entries
            .iter()
            .filter(|(key, cached)| cached.loaded_at.elapsed() > ttl && !writers.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        drop(writers);
        for key in &expired {
            entries.pop(key);
        }
        CACHE_EVICTIONS.inc_by(expired.len() as u64);
        expired.len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Wait for a free write slot and mark `key` as having an open writer.
    pub async fn acquire_write_slot(&self, key: &BucketKey) -> Result<WriteSlot, StoreError> {
        let permit = Arc::clone(&self.write_slots)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::WriteSlotClosed)?;
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        Ok(WriteSlot {
            key: key.clone(),
            writers: Arc::clone(&self.writers),
            _permit: permit,
        })
    }

    /// Refuse new write handles; waiting callers get [`StoreError::WriteSlotClosed`].
    pub fn close_writes(&self) {
        self.write_slots.close();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            open_writers: self
                .writers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            available_write_slots: self.write_slots.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TorrentRecord;

    fn config(max_entries: usize, drop_take: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            drop_take,
            max_open_writers: 2,
            ..Default::default()
        }
    }

    fn key(i: usize) -> BucketKey {
        BucketKey::from_raw(format!("k{i}:k{i}"))
    }

    fn bucket(url: &str) -> Arc<Bucket> {
        let mut b = Bucket::new();
        b.insert(url.to_string(), TorrentRecord::new("t", url, "x", "x", "x"));
        Arc::new(b)
    }

    #[test]
    fn test_get_hit_and_miss() {
        let cache = EvictionCache::new(config(10, 2));
        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(1), bucket("a"));
        let hit = cache.get(&key(1)).unwrap();
        assert!(hit.contains_key("a"));
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = EvictionCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.insert(key(1), bucket("a"));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_expired_entry_is_reloaded() {
        let cache = EvictionCache::new(CacheConfig {
            ttl_secs: 0,
            ..Default::default()
        });
        cache.insert(key(1), bucket("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = EvictionCache::new(CacheConfig {
            ttl_secs: 0,
            ..Default::default()
        });
        cache.insert(key(1), bucket("a"));
        cache.insert(key(2), bucket("b"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_overflow_evicts_oldest_batch() {
        let cache = EvictionCache::new(config(4, 3));
        for i in 0..4 {
            cache.insert(key(i), bucket("a"));
        }
        // Touch k0 so it becomes most recently used.
        assert!(cache.get(&key(0)).is_some());

        cache.insert(key(4), bucket("a"));

        // 5 entries > 4: the three oldest (k1, k2, k3) go at once.
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(4)).is_some());
        assert!(cache.get(&key(1)).is_none());
    }

    #[tokio::test]
    async fn test_eviction_skips_open_writers() {
        let cache = EvictionCache::new(config(100, 2));
        for i in 0..3 {
            cache.insert(key(i), bucket("a"));
        }

        let slot = cache.acquire_write_slot(&key(0)).await.unwrap();
        assert_eq!(cache.evict_oldest(2), 2);
        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1)).is_none());
        drop(slot);

        assert_eq!(cache.evict_oldest(10), 1);
    }

    #[tokio::test]
    async fn test_expiry_keeps_open_writers() {
        let cache = EvictionCache::new(CacheConfig {
            ttl_secs: 0,
            ..Default::default()
        });
        cache.insert(key(1), bucket("a"));
        cache.insert(key(2), bucket("b"));
        let slot = cache.acquire_write_slot(&key(1)).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);

        drop(slot);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_write_slots_are_bounded() {
        let cache = Arc::new(EvictionCache::new(config(10, 2)));
        let a = cache.acquire_write_slot(&key(1)).await.unwrap();
        let _b = cache.acquire_write_slot(&key(2)).await.unwrap();
        assert_eq!(cache.stats().available_write_slots, 0);
        assert_eq!(cache.stats().open_writers, 2);

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.acquire_write_slot(&key(3)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_writes() {
        let cache = EvictionCache::new(config(10, 2));
        cache.close_writes();
        assert!(matches!(
            cache.acquire_write_slot(&key(1)).await,
            Err(StoreError::WriteSlotClosed)
        ));
    }
}
