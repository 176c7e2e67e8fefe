use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::cache::{EvictionCache, WriteSlot};
use super::master::{MasterEntry, MasterIndex};
use super::{write_atomic, StoreError};
use crate::config::{CacheConfig, StorageConfig, MAX_PATH_LEVELS};
use crate::metrics::{BUCKET_FLUSHES, BUCKET_FLUSH_DURATION};
use crate::normalize::BucketKey;
use crate::record::{wire_time, TorrentRecord};

/// Records of one bucket, keyed by `url`.
pub type Bucket = BTreeMap<String, TorrentRecord>;

/// On-disk layout of a bucket file.
#[derive(Serialize)]
struct BucketFileRef<'a> {
    key: &'a BucketKey,
    #[serde(rename = "fileTime")]
    file_time: i64,
    #[serde(rename = "updateTime", with = "wire_time")]
    update_time: DateTime<Utc>,
    torrents: &'a Bucket,
}

#[derive(Deserialize)]
struct BucketFile {
    key: BucketKey,
    #[serde(default)]
    torrents: Bucket,
}

/// Header fields only; the record map is skipped during parsing.
#[derive(Deserialize)]
struct BucketHeader {
    key: BucketKey,
    #[serde(rename = "fileTime")]
    file_time: i64,
    #[serde(rename = "updateTime", with = "wire_time")]
    update_time: DateTime<Utc>,
}

type KeyLocks = Arc<Mutex<HashMap<BucketKey, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive hold on one bucket key. The map entry is dropped with the last holder.
struct KeyLock {
    key: BucketKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Owner of the bucket files, their cache and the master index.
pub struct BucketStore {
    root: PathBuf,
    master_path: PathBuf,
    path_levels: usize,
    cache: EvictionCache,
    master: MasterIndex,
    master_save: tokio::sync::Mutex<()>,
    key_locks: KeyLocks,
}

impl BucketStore {
    /// Open the store under `storage.data_dir`.
    ///
    /// The master index is loaded from its snapshot; a missing or unreadable
    /// snapshot is rebuilt by scanning the bucket files.
    pub async fn open(storage: &StorageConfig, cache: CacheConfig) -> Result<Self, StoreError> {
        let root = storage.buckets_dir();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::write(&root, e))?;

        let master_path = storage.master_path();
        let store = Self {
            root,
            master_path,
            path_levels: storage.path_levels.min(MAX_PATH_LEVELS),
            cache: EvictionCache::new(cache),
            master: MasterIndex::new(),
            master_save: tokio::sync::Mutex::new(()),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        };

        match MasterIndex::load(&store.master_path).await {
            Ok(loaded) => {
                let count = loaded.len();
                store.master.replace(loaded.into_entries());
                info!(buckets = count, "Loaded master index");
            }
            Err(StoreError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                let count = store.rebuild_master().await?;
                info!(buckets = count, "Master index rebuilt from bucket files");
                store.save_master().await?;
            }
            Err(e) => {
                warn!(error = %e, "Master index snapshot unusable, rebuilding");
                let count = store.rebuild_master().await?;
                info!(buckets = count, "Master index rebuilt from bucket files");
                store.save_master().await?;
            }
        }

        Ok(store)
    }

    pub fn master(&self) -> &MasterIndex {
        &self.master
    }

    pub fn cache(&self) -> &EvictionCache {
        &self.cache
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard path of a bucket: `<root>/<d0d1>/<d2d3>/.../<rest>.json`, where
    /// `d` is the hex MD5 of the key and each level consumes two digits.
    pub fn bucket_path(&self, key: &BucketKey) -> PathBuf {
        let digest = format!("{:x}", md5::compute(key.as_str().as_bytes()));
        let mut path = self.root.clone();
        for level in 0..self.path_levels {
            path.push(&digest[level * 2..level * 2 + 2]);
        }
        path.push(format!("{}.json", &digest[self.path_levels * 2..]));
        path
    }

    /// Shared read-only view of a bucket. Served from cache when fresh.
    ///
    /// A miss loads the file under the key lock, so a snapshot read while a
    /// writer flushes can never replace the newer one in the cache. Must not
    /// be called for a key whose write handle the caller holds.
    pub async fn open_read(&self, key: &BucketKey) -> Result<Arc<Bucket>, StoreError> {
        if let Some(bucket) = self.cache.get(key) {
            return Ok(bucket);
        }

        let _lock = self.lock_key(key).await;
        if let Some(bucket) = self.cache.get(key) {
            return Ok(bucket);
        }
        let bucket = Arc::new(self.read_uncached(key).await?);
        self.cache.insert(key.clone(), Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Read a bucket straight from disk. A missing file is an empty bucket.
    pub async fn read_uncached(&self, key: &BucketKey) -> Result<Bucket, StoreError> {
        let path = self.bucket_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Bucket::new()),
            Err(e) => return Err(StoreError::read(path, e)),
        };
        let file: BucketFile = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if file.key != *key {
            return Err(StoreError::KeyMismatch {
                path,
                expected: key.clone(),
                found: file.key,
            });
        }
        Ok(file.torrents)
    }

    /// Exclusive write access to a bucket.
    ///
    /// Waits for any other writer of the same key, then for a free write
    /// slot. The handle starts from the bucket's durable state.
    pub async fn open_write(&self, key: &BucketKey) -> Result<WriteHandle<'_>, StoreError> {
        let lock = self.lock_key(key).await;
        let slot = self.cache.acquire_write_slot(key).await?;

        let snapshot = match self.cache.get(key) {
            Some(bucket) => bucket,
            None => Arc::new(self.read_uncached(key).await?),
        };

        Ok(WriteHandle {
            store: self,
            key: key.clone(),
            records: (*snapshot).clone(),
            snapshot,
            dirty: false,
            _slot: slot,
            _lock: lock,
        })
    }

    async fn lock_key(&self, key: &BucketKey) -> KeyLock {
        let mutex = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyLock {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.key_locks),
        }
    }

    async fn flush(&self, key: &BucketKey, records: Bucket) -> Result<(), StoreError> {
        let _timer = BUCKET_FLUSH_DURATION.with_label_values(&[]).start_timer();
        let path = self.bucket_path(key);

        if records.is_empty() {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    BUCKET_FLUSHES.with_label_values(&["failed"]).inc();
                    return Err(StoreError::write(path, e));
                }
            }
            self.master.remove(key);
            self.cache.invalidate(key);
            BUCKET_FLUSHES.with_label_values(&["deleted"]).inc();
            debug!(key = %key, "Bucket emptied and removed");
            return Ok(());
        }

        let ticket = self.master.reserve();
        let update_time = Utc::now();
        let file = BucketFileRef {
            key,
            file_time: ticket.file_time(),
            update_time,
            torrents: &records,
        };
        let json = serde_json::to_vec(&file).map_err(|e| StoreError::Serialize(e.to_string()))?;

        if let Err(e) = write_atomic(&path, &json).await {
            BUCKET_FLUSHES.with_label_values(&["failed"]).inc();
            return Err(e);
        }

        self.master.update(
            key,
            MasterEntry {
                update_time,
                file_time: ticket.file_time(),
            },
        );
        drop(ticket);

        self.cache.insert(key.clone(), Arc::new(records));
        BUCKET_FLUSHES.with_label_values(&["written"]).inc();
        Ok(())
    }

    /// Recompute the master index from the bucket files on disk.
    ///
    /// Unreadable or misplaced files are logged and skipped.
    pub async fn rebuild_master(&self) -> Result<usize, StoreError> {
        let mut entries = HashMap::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::read(dir, e)),
            };

            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| StoreError::read(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::read(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }

                match read_header(&path).await {
                    Ok(header) if self.bucket_path(&header.key) == path => {
                        entries.insert(
                            header.key,
                            MasterEntry {
                                update_time: header.update_time,
                                file_time: header.file_time,
                            },
                        );
                    }
                    Ok(header) => {
                        warn!(path = %path.display(), key = %header.key, "Bucket file is not at its shard path, skipping");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable bucket file");
                    }
                }
            }
        }

        let count = entries.len();
        self.master.replace(entries);
        Ok(count)
    }

    /// Persist the master index snapshot. Concurrent callers take turns on
    /// the shared temp file.
    pub async fn save_master(&self) -> Result<usize, StoreError> {
        let _guard = self.master_save.lock().await;
        self.master.save(&self.master_path).await
    }
}

async fn read_header(path: &Path) -> Result<BucketHeader, StoreError> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| StoreError::read(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Exclusive, scoped write access to one bucket.
///
/// Changes are flushed by [`WriteHandle::commit`]. Dropping the handle
/// without committing discards them; the bucket keeps its last durable state.
pub struct WriteHandle<'a> {
    store: &'a BucketStore,
    key: BucketKey,
    snapshot: Arc<Bucket>,
    records: Bucket,
    dirty: bool,
    _slot: WriteSlot,
    _lock: KeyLock,
}

impl WriteHandle<'_> {
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// The bucket as it was when the handle was opened.
    pub fn snapshot(&self) -> &Arc<Bucket> {
        &self.snapshot
    }

    /// Current records, including uncommitted changes.
    pub fn records(&self) -> &Bucket {
        &self.records
    }

    pub fn get(&self, url: &str) -> Option<&TorrentRecord> {
        self.records.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.records.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Insert or replace a record by its `url`.
    pub fn insert(&mut self, record: TorrentRecord) -> Option<TorrentRecord> {
        self.dirty = true;
        self.records.insert(record.url.clone(), record)
    }

    /// Apply `change` to the stored record; the handle becomes dirty when it returns true.
    pub fn update<F>(&mut self, url: &str, change: F) -> bool
    where
        F: FnOnce(&mut TorrentRecord) -> bool,
    {
        let changed = self.records.get_mut(url).is_some_and(change);
        self.dirty |= changed;
        changed
    }

    pub fn remove(&mut self, url: &str) -> Option<TorrentRecord> {
        let removed = self.records.remove(url);
        self.dirty |= removed.is_some();
        removed
    }

    /// Flush if dirty. Returns whether anything was written.
    ///
    /// An emptied bucket is deleted from disk and from the master index.
    pub async fn commit(self) -> Result<bool, StoreError> {
        let WriteHandle {
            store,
            key,
            records,
            dirty,
            _slot,
            _lock,
            ..
        } = self;

        if !dirty {
            return Ok(false);
        }
        store.flush(&key, records).await?;
        Ok(true)
    }
}
