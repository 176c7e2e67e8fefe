//! In-memory cursor store for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::sync::{CursorStore, Cursors, SyncError};

/// [`CursorStore`] kept in memory, counting every save.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<RwLock<Cursors>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously saved cursors.
    pub fn with_cursors(cursors: Cursors) -> Self {
        Self {
            cursors: Arc::new(RwLock::new(cursors)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `save_*` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Cursors, SyncError> {
        Ok(*self.cursors.read().await)
    }

    async fn save_lastsync(&self, value: i64) -> Result<(), SyncError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.cursors.write().await.lastsync = value;
        Ok(())
    }

    async fn save_starsync(&self, value: i64) -> Result<(), SyncError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.cursors.write().await.starsync = value;
        Ok(())
    }
}
