//! Persistent replication cursors.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::SyncError;
use crate::store::write_atomic;

/// Replication progress against one peer, in file-time units. -1 means "from the start".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    /// How far this node has pulled.
    pub lastsync: i64,
    /// Where the last complete pass ended.
    pub starsync: i64,
}

impl Default for Cursors {
    fn default() -> Self {
        Self {
            lastsync: -1,
            starsync: -1,
        }
    }
}

impl Cursors {
    /// A full pass reached the current head.
    pub fn is_converged(&self) -> bool {
        self.starsync >= 0 && self.starsync == self.lastsync
    }
}

/// Storage for a peer's cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Saved cursors; missing values are -1.
    async fn load(&self) -> Result<Cursors, SyncError>;

    async fn save_lastsync(&self, value: i64) -> Result<(), SyncError>;

    async fn save_starsync(&self, value: i64) -> Result<(), SyncError>;
}

/// Cursors as two plain-text files, `lastsync.txt` and `starsync.txt`,
/// each holding one integer.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    /// Cursor directory for `peer_url` under `sync_dir`.
    pub fn for_peer(sync_dir: &Path, peer_url: &str) -> Self {
        Self::new(sync_dir.join(peer_slug(peer_url)))
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_value(&self, name: &str) -> Result<i64, SyncError> {
        let path = self.dir.join(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(-1),
            Err(e) => {
                return Err(SyncError::Cursor(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        match text.trim().parse::<i64>() {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unparsable cursor file, starting from -1");
                Ok(-1)
            }
        }
    }

    async fn write_value(&self, name: &str, value: i64) -> Result<(), SyncError> {
        write_atomic(&self.dir.join(name), value.to_string().as_bytes())
            .await
            .map_err(|e| SyncError::Cursor(e.to_string()))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Cursors, SyncError> {
        Ok(Cursors {
            lastsync: self.read_value("lastsync.txt").await?,
            starsync: self.read_value("starsync.txt").await?,
        })
    }

    async fn save_lastsync(&self, value: i64) -> Result<(), SyncError> {
        self.write_value("lastsync.txt", value).await
    }

    async fn save_starsync(&self, value: i64) -> Result<(), SyncError> {
        self.write_value("starsync.txt", value).await
    }
}

/// Directory-safe name for a peer URL: scheme and credentials dropped,
/// anything outside `[A-Za-z0-9.-]` replaced by `_`.
pub fn peer_slug(peer_url: &str) -> String {
    let without_scheme = peer_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(peer_url);
    let without_credentials = without_scheme
        .split_once('@')
        .map(|(_, rest)| rest)
        .unwrap_or(without_scheme);

    let slug: String = without_credentials
        .trim_end_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if slug.is_empty() {
        "peer".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_peer_slug() {
        assert_eq!(peer_slug("http://peer.example:9117"), "peer.example_9117");
        assert_eq!(peer_slug("https://user:pw@peer.example/"), "peer.example");
        assert_eq!(peer_slug("http://10.0.0.2:9117/api"), "10.0.0.2_9117_api");
        assert_eq!(peer_slug(""), "peer");
    }

    #[test]
    fn test_cursors_converged() {
        assert!(!Cursors::default().is_converged());
        assert!(Cursors {
            lastsync: 5,
            starsync: 5
        }
        .is_converged());
        assert!(!Cursors {
            lastsync: 7,
            starsync: 5
        }
        .is_converged());
    }

    #[tokio::test]
    async fn test_missing_files_load_as_minus_one() {
        let dir = TempDir::new().unwrap();
        let store = FileCursorStore::new(dir.path().join("peer"));
        assert_eq!(store.load().await.unwrap(), Cursors::default());
    }

    #[tokio::test]
    async fn test_save_and_load_plain_integers() {
        let dir = TempDir::new().unwrap();
        let store = FileCursorStore::for_peer(dir.path(), "http://peer.example:9117");

        store.save_lastsync(133_600_000_000_000_000).await.unwrap();
        store.save_starsync(133_500_000_000_000_000).await.unwrap();

        let on_disk = tokio::fs::read_to_string(store.dir().join("lastsync.txt"))
            .await
            .unwrap();
        assert_eq!(on_disk, "133600000000000000");

        let cursors = store.load().await.unwrap();
        assert_eq!(cursors.lastsync, 133_600_000_000_000_000);
        assert_eq!(cursors.starsync, 133_500_000_000_000_000);
    }

    #[tokio::test]
    async fn test_garbage_cursor_resets() {
        let dir = TempDir::new().unwrap();
        let store = FileCursorStore::new(dir.path());
        tokio::fs::write(dir.path().join("lastsync.txt"), "not a number")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("starsync.txt"), " 42\n")
            .await
            .unwrap();

        let cursors = store.load().await.unwrap();
        assert_eq!(cursors.lastsync, -1);
        assert_eq!(cursors.starsync, 42);
    }
}
