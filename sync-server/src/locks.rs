//! Keyed async mutexes for critical sections.
//!
//! The key-value store only guarantees single-key atomicity. Multi-step
//! updates (conflict check then content write, client read-modify-write,
//! share redemption) are serialized by a mutex per key instead.

use dashmap::DashMap;
use std::sync::Arc;
use sync_types::{ClientUuid, ShareLink};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of named mutexes created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for `key`, waiting if another task holds it.
    pub async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        // Clone the Arc before awaiting so no shard lock is held across the await.
        let mutex = self.locks.entry(key).or_default().clone();
        mutex.lock_owned().await
    }

    /// Lock for a file path (ConflictCheck through ContentTransfer, ChooseOne).
    pub async fn path(&self, after_path: &str) -> OwnedMutexGuard<()> {
        self.lock(format!("path:{after_path}")).await
    }

    /// Lock for a root directory's registration and removal.
    pub async fn root(&self, after_path: &str) -> OwnedMutexGuard<()> {
        self.lock(format!("root:{after_path}")).await
    }

    /// Lock for a client record's read-modify-write.
    pub async fn client(&self, uuid: &ClientUuid) -> OwnedMutexGuard<()> {
        self.lock(format!("client:{uuid}")).await
    }

    /// Lock for a share link redemption.
    pub async fn share(&self, link: &ShareLink) -> OwnedMutexGuard<()> {
        self.lock(format!("share:{link}")).await
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no entries exist.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
