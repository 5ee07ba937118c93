//! History browsing and share links.
//!
//! Snapshots are immutable once written, so reads here take no path lock.
//! Share redemption is serialized per link so `count` never exceeds
//! `max_count`.

use crate::error::{StorageError, SyncError, SyncResult};
use crate::locks::KeyedLocks;
use crate::model::{validate_path, HistoryRecord, Sharing};
use crate::storage::VersionedStore;
use std::sync::Arc;
use sync_types::{ClientUuid, FileHistory, ShareLink, SyncTimestamp};

/// Sequence issuing `FileHistory::id`.
pub const HISTORY_SEQUENCE: &str = "history";

/// Sequence issuing `Sharing::id`.
pub const SHARING_SEQUENCE: &str = "sharing";

/// Read access to file history plus share-link bookkeeping.
#[derive(Clone)]
pub struct History {
    store: VersionedStore,
    locks: Arc<KeyedLocks>,
}

impl History {
    /// Create the satellite over a store.
    pub fn new(store: VersionedStore, locks: Arc<KeyedLocks>) -> Self {
        Self { store, locks }
    }

    /// Every snapshot of a file, oldest first.
    pub async fn list_history(&self, after_path: &str) -> SyncResult<Vec<FileHistory>> {
        validate_path(after_path).map_err(SyncError::Validation)?;
        Ok(self
            .store
            .list_history(after_path)
            .await?
            .into_iter()
            .map(|record| record.entry)
            .collect())
    }

    /// A snapshot together with its bytes.
    pub async fn history_content(
        &self,
        after_path: &str,
        timestamp: SyncTimestamp,
    ) -> SyncResult<(FileHistory, Vec<u8>)> {
        validate_path(after_path).map_err(SyncError::Validation)?;
        let record = self.snapshot(after_path, timestamp).await?;
        let bytes = self.snapshot_bytes(&record.root_dir, &record.entry).await?;
        Ok((record.entry, bytes))
    }

    async fn snapshot(&self, after_path: &str, timestamp: SyncTimestamp) -> SyncResult<HistoryRecord> {
        let record = self
            .store
            .get_history(after_path, timestamp)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!("no snapshot of {after_path} at {timestamp}"))
            })?;
        if !record.entry.contents_existed {
            return Err(SyncError::NotFound(format!(
                "snapshot of {after_path} at {timestamp} records a removal"
            )));
        }
        Ok(record)
    }

    async fn snapshot_bytes(&self, root: &str, entry: &FileHistory) -> SyncResult<Vec<u8>> {
        match self
            .store
            .area()
            .read_history(root, &entry.after_path, entry.timestamp)
            .await
        {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => Err(SyncError::NotFound(format!(
                "bytes of {} at {} are missing",
                entry.after_path, entry.timestamp
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Issue a link allowing `max_count` downloads of one snapshot.
    pub async fn create_share(
        &self,
        owner: &ClientUuid,
        after_path: &str,
        timestamp: SyncTimestamp,
        max_count: u32,
    ) -> SyncResult<Sharing> {
        if max_count == 0 {
            return Err(SyncError::Validation(
                "share maxCount must be at least 1".to_string(),
            ));
        }
        validate_path(after_path).map_err(SyncError::Validation)?;
        let record = self.snapshot(after_path, timestamp).await?;

        let sharing = Sharing {
            id: self.store.next_id(SHARING_SEQUENCE).await?,
            count: 0,
            max_count,
            link: ShareLink::new(),
            owner: owner.clone(),
            root_dir: record.root_dir,
            snapshot: record.entry,
        };
        self.store.put_sharing(&sharing).await?;

        tracing::info!(
            "Share {} issued by {} for {}@{} (max {})",
            sharing.link,
            owner,
            after_path,
            timestamp,
            max_count
        );
        Ok(sharing)
    }

    /// Consume one download of a share link.
    pub async fn redeem_share(&self, link: &ShareLink) -> SyncResult<(FileHistory, Vec<u8>)> {
        let _guard = self.locks.share(link).await;

        let mut sharing = self
            .store
            .get_sharing(link)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("share link {link}")))?;
        if !sharing.has_remaining() {
            return Err(SyncError::NotFound(format!("share link {link} is exhausted")));
        }

        let bytes = self
            .snapshot_bytes(&sharing.root_dir, &sharing.snapshot)
            .await?;
        sharing.count += 1;
        self.store.put_sharing(&sharing).await?;

        tracing::debug!(
            "Share {} redeemed ({}/{})",
            link,
            sharing.count,
            sharing.max_count
        );
        Ok((sharing.snapshot, bytes))
    }

    /// Look up a share link without consuming a download.
    pub async fn sharing(&self, link: &ShareLink) -> Result<Option<Sharing>, StorageError> {
        self.store.get_sharing(link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_store;
    use sync_types::{content_hash, FileMetadata};

    async fn with_snapshot(ts: u64, bytes: Option<&[u8]>) -> (tempfile::TempDir, History) {
        let (dir, store) = test_store().await;
        let timestamp = SyncTimestamp::new(ts);
        if let Some(bytes) = bytes {
            store
                .area()
                .write_history("/r", "/r/f", timestamp, bytes)
                .await
                .unwrap();
        }
        store
            .append_history(&HistoryRecord {
                root_dir: "/r".into(),
                entry: FileHistory {
                    id: ts,
                    date: 1_705_000_000,
                    uuid: ClientUuid::from("a"),
                    after_path: "/r/f".into(),
                    timestamp,
                    hash: bytes.map(content_hash).unwrap_or_default(),
                    contents_existed: bytes.is_some(),
                    metadata: FileMetadata::default(),
                },
            })
            .await
            .unwrap();
        (dir, History::new(store, Arc::new(KeyedLocks::new())))
    }

    #[tokio::test]
    async fn content_of_known_snapshot() {
        let (_dir, history) = with_snapshot(3, Some(b"v3")).await;

        let (entry, bytes) = history
            .history_content("/r/f", SyncTimestamp::new(3))
            .await
            .unwrap();
        assert_eq!(bytes, b"v3");
        assert_eq!(entry.hash, content_hash(b"v3"));

        let listed = history.list_history("/r/f").await.unwrap();
        assert_eq!(listed, vec![entry]);
    }

    #[tokio::test]
    async fn unknown_or_removed_snapshot_is_not_found() {
        let (_dir, history) = with_snapshot(4, None).await;

        assert!(matches!(
            history.history_content("/r/f", SyncTimestamp::new(4)).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            history.history_content("/r/f", SyncTimestamp::new(9)).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn share_zero_max_count_is_rejected() {
        let (_dir, history) = with_snapshot(1, Some(b"v1")).await;
        let err = history
            .create_share(&ClientUuid::from("a"), "/r/f", SyncTimestamp::new(1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn share_link_runs_out() {
        let (_dir, history) = with_snapshot(1, Some(b"v1")).await;
        let sharing = history
            .create_share(&ClientUuid::from("a"), "/r/f", SyncTimestamp::new(1), 2)
            .await
            .unwrap();
        assert_eq!(sharing.id, 1);

        for _ in 0..2 {
            let (_, bytes) = history.redeem_share(&sharing.link).await.unwrap();
            assert_eq!(bytes, b"v1");
        }
        assert!(matches!(
            history.redeem_share(&sharing.link).await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(history.sharing(&sharing.link).await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn concurrent_redemptions_respect_max_count() {
        let (_dir, history) = with_snapshot(1, Some(b"v1")).await;
        let sharing = history
            .create_share(&ClientUuid::from("a"), "/r/f", SyncTimestamp::new(1), 3)
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let history = history.clone();
                let link = sharing.link;
                tokio::spawn(async move { history.redeem_share(&link).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn unknown_link_is_not_found() {
        let (_dir, history) = with_snapshot(1, Some(b"v1")).await;
        assert!(matches!(
            history.redeem_share(&ShareLink::new()).await,
            Err(SyncError::NotFound(_))
        ));
    }
}
