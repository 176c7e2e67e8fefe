//! In-memory index of every bucket and its replication cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::debug;

use super::{write_atomic, StoreError};
use crate::normalize::BucketKey;
use crate::record::{file_time, wire_time};

/// Metadata kept for each bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    /// Wall-clock time of the last flush.
    #[serde(rename = "updateTime", with = "wire_time")]
    pub update_time: DateTime<Utc>,
    /// Replication cursor of the last flush. Strictly increases per bucket.
    #[serde(rename = "fileTime")]
    pub file_time: i64,
}

#[derive(Debug, Default)]
struct Clock {
    high_water: i64,
    in_flight: BTreeSet<i64>,
}

/// Map from bucket key to [`MasterEntry`].
///
/// The index is a cache of durable state: every entry can be recomputed from
/// the bucket files, see `BucketStore::rebuild_master`. It also hands out
/// cursor values for flushes and tracks which of them are still being
/// written, so readers never observe a cursor that could later be undercut.
#[derive(Debug, Default)]
pub struct MasterIndex {
    entries: RwLock<HashMap<BucketKey, MasterEntry>>,
    clock: Mutex<Clock>,
}

/// A reserved cursor value for one in-progress flush.
///
/// While alive, no entry at or above this value is visible through
/// [`MasterIndex::entries_since`]. Dropping it releases the reservation
/// whether or not the flush succeeded.
#[derive(Debug)]
pub struct FileTimeTicket<'a> {
    index: &'a MasterIndex,
    file_time: i64,
}

impl FileTimeTicket<'_> {
    pub fn file_time(&self) -> i64 {
        self.file_time
    }
}

impl Drop for FileTimeTicket<'_> {
    fn drop(&mut self) {
        let mut clock = self.index.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.in_flight.remove(&self.file_time);
    }
}

impl MasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from existing entries (loaded snapshot or disk scan).
    pub fn from_entries(entries: HashMap<BucketKey, MasterEntry>) -> Self {
        let high_water = entries.values().map(|e| e.file_time).max().unwrap_or(0);
        Self {
            entries: RwLock::new(entries),
            clock: Mutex::new(Clock {
                high_water,
                in_flight: BTreeSet::new(),
            }),
        }
    }

    pub fn into_entries(self) -> HashMap<BucketKey, MasterEntry> {
        self.entries
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a freshly rebuilt set of entries. Issued cursors never go back.
    pub fn replace(&self, entries: HashMap<BucketKey, MasterEntry>) {
        let high_water = entries.values().map(|e| e.file_time).max().unwrap_or(0);
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.high_water = clock.high_water.max(high_water);
    }

    /// Reserve the cursor for the next flush: `max(now, highest issued + 1)`.
    pub fn reserve(&self) -> FileTimeTicket<'_> {
        let now = file_time(&Utc::now());
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = now.max(clock.high_water + 1);
        clock.high_water = next;
        clock.in_flight.insert(next);
        FileTimeTicket {
            index: self,
            file_time: next,
        }
    }

    /// Smallest cursor still being written, if any.
    pub fn stable_horizon(&self) -> Option<i64> {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.in_flight.first().copied()
    }

    /// Record a completed flush. Older cursors never replace newer ones.
    pub fn update(&self, key: &BucketKey, entry: MasterEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(existing) if existing.file_time > entry.file_time => {
                debug!(key = %key, "Ignoring stale master index update");
            }
            Some(existing) => *existing = entry,
            None => {
                entries.insert(key.clone(), entry);
            }
        }
        drop(entries);

        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.high_water = clock.high_water.max(entry.file_time);
    }

    pub fn remove(&self, key: &BucketKey) -> Option<MasterEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn get(&self, key: &BucketKey) -> Option<MasterEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest cursor of any bucket, or -1 for an empty index.
    pub fn max_file_time(&self) -> i64 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.file_time)
            .max()
            .unwrap_or(-1)
    }

    /// All bucket keys, sorted.
    pub fn keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<BucketKey> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Buckets changed after `cursor`, in ascending cursor order.
    ///
    /// Entries at or above the stable horizon are withheld until every
    /// earlier in-flight flush has finished.
    pub fn entries_since(&self, cursor: i64) -> Vec<(BucketKey, MasterEntry)> {
        let horizon = self.stable_horizon().unwrap_or(i64::MAX);
        let mut found: Vec<(BucketKey, MasterEntry)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| e.file_time > cursor && e.file_time < horizon)
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        found.sort_by_key(|(_, e)| e.file_time);
        found
    }

    /// Write the index to `path` as `{ key: { updateTime, fileTime } }`.
    pub async fn save(&self, path: &Path) -> Result<usize, StoreError> {
        let snapshot: BTreeMap<BucketKey, MasterEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        let json =
            serde_json::to_vec(&snapshot).map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_atomic(path, &json).await?;
        Ok(snapshot.len())
    }

    /// Load a snapshot written by [`MasterIndex::save`].
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::read(path, e))?;
        let entries: HashMap<BucketKey, MasterEntry> =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(s: &str) -> BucketKey {
        BucketKey::from_raw(s)
    }

    fn entry(ft: i64) -> MasterEntry {
        MasterEntry {
            update_time: Utc::now(),
            file_time: ft,
        }
    }

    #[test]
    fn test_reserve_is_strictly_increasing() {
        let index = MasterIndex::new();
        let a = index.reserve().file_time();
        let b = index.reserve().file_time();
        let c = index.reserve().file_time();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_reserve_exceeds_loaded_entries() {
        let far_future = file_time(&Utc::now()) + 10_000_000_000;
        let index = MasterIndex::from_entries([(key("a:b"), entry(far_future))].into());
        assert!(index.reserve().file_time() > far_future);
    }

    #[test]
    fn test_update_is_monotonic() {
        let index = MasterIndex::new();
        index.update(&key("a:b"), entry(100));
        index.update(&key("a:b"), entry(50));
        assert_eq!(index.get(&key("a:b")).unwrap().file_time, 100);
        index.update(&key("a:b"), entry(150));
        assert_eq!(index.get(&key("a:b")).unwrap().file_time, 150);
    }

    #[test]
    fn test_entries_since_sorted_and_filtered() {
        let index = MasterIndex::new();
        index.update(&key("c:c"), entry(30));
        index.update(&key("a:a"), entry(10));
        index.update(&key("b:b"), entry(20));

        let since: Vec<i64> = index.entries_since(10).iter().map(|(_, e)| e.file_time).collect();
        assert_eq!(since, vec![20, 30]);
        assert_eq!(index.entries_since(-1).len(), 3);
        assert_eq!(index.max_file_time(), 30);
    }

    #[test]
    fn test_entries_since_withholds_above_in_flight() {
        let index = MasterIndex::new();
        let ticket = index.reserve();
        let pending = ticket.file_time();

        // A later flush completes before the earlier one.
        let later = index.reserve();
        index.update(&key("late:late"), entry(later.file_time()));
        drop(later);

        assert_eq!(index.stable_horizon(), Some(pending));
        assert!(index.entries_since(-1).is_empty());

        index.update(&key("early:early"), entry(pending));
        drop(ticket);

        assert_eq!(index.stable_horizon(), None);
        let keys: Vec<String> = index
            .entries_since(-1)
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, vec!["early:early", "late:late"]);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("masterDb.json");

        let index = MasterIndex::new();
        index.update(&key("a:b"), entry(42));
        index.update(&key("c:d"), entry(43));
        assert_eq!(index.save(&path).await.unwrap(), 2);

        let loaded = MasterIndex::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&key("c:d")).unwrap().file_time, 43);
        assert!(loaded.reserve().file_time() > 43);
    }

    #[tokio::test]
    async fn test_load_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("masterDb.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = MasterIndex::load(&path).await.unwrap_err();
        assert!(err.is_corruption());
    }
}
