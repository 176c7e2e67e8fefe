//! Bucketed record storage.
//!
//! Records live in one JSON file per [`BucketKey`], sharded into a directory
//! tree under `<data_dir>/fdb`. Reads go through the [`EvictionCache`];
//! writes take an exclusive [`WriteHandle`] that flushes on
//! [`WriteHandle::commit`] and refreshes the [`MasterIndex`].

mod bucket;
mod cache;
mod error;
mod master;

pub use bucket::{Bucket, BucketStore, WriteHandle};
pub use cache::{CacheStats, EvictionCache, WriteSlot};
pub use error::StoreError;
pub use master::{FileTimeTicket, MasterEntry, MasterIndex};

use std::path::Path;
use tokio::fs;

/// Write `bytes` to `path` through a sibling temp file and a rename, so a
/// crash leaves either the old or the new content.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::write(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::write(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::write(path, e))?;
    Ok(())
}
