//! Typed entity access over the key-value namespace and file areas.

use super::{keys, FileArea, KvStore, SCHEMA_VERSION};
use crate::error::StorageError;
use crate::model::{Client, FileRecord, HistoryRecord, RootDirectory, Sharing};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use sync_types::{ClientUuid, Conflict, ShareLink, SyncTimestamp};

/// The versioned store: entity records plus the bytes they describe.
///
/// Constructed once at startup and shared by handle.
#[derive(Clone)]
pub struct VersionedStore {
    kv: Arc<dyn KvStore>,
    area: FileArea,
}

impl VersionedStore {
    /// Wrap a key-value backend and file area, writing the schema marker.
    pub async fn open(kv: Arc<dyn KvStore>, area: FileArea) -> Result<Self, StorageError> {
        let store = Self { kv, area };
        let key = keys::schema_version();
        match store.load::<u32>(&key).await? {
            None => store.save(&key, &SCHEMA_VERSION).await?,
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StorageError::Migration(format!(
                    "store schema version {version} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            Some(_) => {}
        }
        Ok(store)
    }

    /// The file areas.
    pub fn area(&self) -> &FileArea {
        &self.area
    }

    /// Issue the next value of a named sequence.
    pub async fn next_id(&self, sequence: &str) -> Result<u64, StorageError> {
        self.kv.next_sequence(sequence).await
    }

    fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec_named(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })
    }

    fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|source| StorageError::Decode {
            key: key.to_string(),
            source,
        })
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = Self::encode(key, value)?;
        self.kv.put(key, &bytes).await
    }

    async fn load_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        self.kv
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = Self::decode(&key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }

    // Clients

    /// Look up a client.
    pub async fn get_client(&self, uuid: &ClientUuid) -> Result<Option<Client>, StorageError> {
        self.load(&keys::client(uuid)).await
    }

    /// Insert a client unless one already exists. Returns true if inserted.
    pub async fn create_client(&self, client: &Client) -> Result<bool, StorageError> {
        let key = keys::client(&client.uuid);
        let bytes = Self::encode(&key, client)?;
        self.kv.put_if_absent(&key, &bytes).await
    }

    /// Replace a client record.
    pub async fn put_client(&self, client: &Client) -> Result<(), StorageError> {
        self.save(&keys::client(&client.uuid), client).await
    }

    /// Remove a client record. Returns true if it existed.
    pub async fn delete_client(&self, uuid: &ClientUuid) -> Result<bool, StorageError> {
        self.kv.delete(&keys::client(uuid)).await
    }

    /// Every client, ordered by uuid.
    pub async fn list_clients(&self) -> Result<Vec<Client>, StorageError> {
        Ok(self
            .load_prefix::<Client>(keys::CLIENT)
            .await?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    // Root directories

    /// Look up a root directory.
    pub async fn get_root_dir(&self, after_path: &str) -> Result<Option<RootDirectory>, StorageError> {
        self.load(&keys::root_dir(after_path)).await
    }

    /// Create or replace a root directory record.
    pub async fn put_root_dir(&self, root: &RootDirectory) -> Result<(), StorageError> {
        self.save(&keys::root_dir(&root.after_path), root).await
    }

    /// Remove a root directory record. Returns true if it existed.
    pub async fn delete_root_dir(&self, after_path: &str) -> Result<bool, StorageError> {
        self.kv.delete(&keys::root_dir(after_path)).await
    }

    /// Every root directory, ordered by afterPath.
    pub async fn list_root_dirs(&self) -> Result<Vec<RootDirectory>, StorageError> {
        Ok(self
            .load_prefix::<RootDirectory>(keys::ROOT_DIR)
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// The stored password hash of a root directory.
    pub async fn get_password_hash(&self, root: &str) -> Result<Option<String>, StorageError> {
        self.load(&keys::password(root)).await
    }

    /// Store the password hash of a root directory.
    pub async fn put_password_hash(&self, root: &str, hash: &str) -> Result<(), StorageError> {
        self.save(&keys::password(root), &hash).await
    }

    /// Remove the password hash of a root directory.
    pub async fn delete_password_hash(&self, root: &str) -> Result<bool, StorageError> {
        self.kv.delete(&keys::password(root)).await
    }

    // Files

    /// Look up a file record.
    pub async fn get_file(&self, after_path: &str) -> Result<Option<FileRecord>, StorageError> {
        self.load(&keys::file(after_path)).await
    }

    /// Create or replace a file record.
    pub async fn put_file(&self, file: &FileRecord) -> Result<(), StorageError> {
        self.save(&keys::file(&file.after_path), file).await
    }

    /// Remove a file record. Returns true if it existed.
    pub async fn delete_file(&self, after_path: &str) -> Result<bool, StorageError> {
        self.kv.delete(&keys::file(after_path)).await
    }

    /// Every file record belonging to a root directory.
    pub async fn list_files(&self, root: &str) -> Result<Vec<FileRecord>, StorageError> {
        let prefix = keys::file(&format!("{root}/"));
        Ok(self
            .load_prefix::<FileRecord>(&prefix)
            .await?
            .into_iter()
            .map(|(_, f)| f)
            .filter(|f| f.root_dir == root)
            .collect())
    }

    // History

    /// Append a snapshot. The first write for a (path, timestamp) wins.
    ///
    /// Returns false if a snapshot already existed; it is left untouched.
    pub async fn append_history(&self, record: &HistoryRecord) -> Result<bool, StorageError> {
        let key = keys::history(&record.entry.after_path, record.entry.timestamp);
        let bytes = Self::encode(&key, record)?;
        self.kv.put_if_absent(&key, &bytes).await
    }

    /// Look up one snapshot.
    pub async fn get_history(
        &self,
        after_path: &str,
        timestamp: SyncTimestamp,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        self.load(&keys::history(after_path, timestamp)).await
    }

    /// Every snapshot of a file, oldest first.
    pub async fn list_history(&self, after_path: &str) -> Result<Vec<HistoryRecord>, StorageError> {
        Ok(self
            .load_prefix::<HistoryRecord>(&keys::history_prefix(after_path))
            .await?
            .into_iter()
            .filter(|(key, _)| keys::is_history_of(key, after_path))
            .map(|(_, h)| h)
            .collect())
    }

    // Conflicts

    /// Look up the pending conflict of a path.
    pub async fn get_conflict(&self, after_path: &str) -> Result<Option<Conflict>, StorageError> {
        self.load(&keys::conflict(after_path)).await
    }

    /// Record a pending conflict.
    pub async fn put_conflict(&self, conflict: &Conflict) -> Result<(), StorageError> {
        self.save(&keys::conflict(&conflict.after_path), conflict).await
    }

    /// Remove a pending conflict. Returns true if one existed.
    pub async fn delete_conflict(&self, after_path: &str) -> Result<bool, StorageError> {
        self.kv.delete(&keys::conflict(after_path)).await
    }

    /// Pending conflicts on files belonging to a root directory.
    ///
    /// A conflict belongs to the root of its file record, so conflicts under
    /// a nested root are not listed for the enclosing one.
    pub async fn list_conflicts(&self, root: &str) -> Result<Vec<Conflict>, StorageError> {
        let prefix = keys::conflict(&format!("{root}/"));
        let mut conflicts = Vec::new();
        for (_, conflict) in self.load_prefix::<Conflict>(&prefix).await? {
            let owned = self
                .get_file(&conflict.after_path)
                .await?
                .is_some_and(|f| f.root_dir == root);
            if owned {
                conflicts.push(conflict);
            }
        }
        Ok(conflicts)
    }

    // Sharing

    /// Look up a share link.
    pub async fn get_sharing(&self, link: &ShareLink) -> Result<Option<Sharing>, StorageError> {
        self.load(&keys::sharing(link)).await
    }

    /// Create or replace a share link.
    pub async fn put_sharing(&self, sharing: &Sharing) -> Result<(), StorageError> {
        self.save(&keys::sharing(&sharing.link), sharing).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use sync_types::{FileHistory, FileMetadata};

    pub(crate) async fn test_store() -> (tempfile::TempDir, VersionedStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let store = VersionedStore::open(kv, FileArea::new(dir.path()))
            .await
            .unwrap();
        (dir, store)
    }

    fn file(path: &str, root: &str) -> FileRecord {
        FileRecord {
            after_path: path.into(),
            root_dir: root.into(),
            latest_hash: "h".into(),
            latest_sync_timestamp: SyncTimestamp::new(1),
            contents_existed: true,
            metadata: FileMetadata::default(),
        }
    }

    fn snapshot(path: &str, ts: u64, hash: &str) -> HistoryRecord {
        HistoryRecord {
            root_dir: "/r".into(),
            entry: FileHistory {
                id: ts,
                date: 0,
                uuid: ClientUuid::from("a"),
                after_path: path.into(),
                timestamp: SyncTimestamp::new(ts),
                hash: hash.into(),
                contents_existed: true,
                metadata: FileMetadata::default(),
            },
        }
    }

    #[tokio::test]
    async fn open_writes_schema_marker() {
        let (_dir, store) = test_store().await;
        let version: Option<u32> = store.load(&keys::schema_version()).await.unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn open_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let bytes = rmp_serde::to_vec_named(&(SCHEMA_VERSION + 1)).unwrap();
        kv.put(&keys::schema_version(), &bytes).await.unwrap();

        let result = VersionedStore::open(kv, FileArea::new(dir.path())).await;
        assert!(matches!(result, Err(StorageError::Migration(_))));
    }

    #[tokio::test]
    async fn create_client_is_put_if_absent() {
        let (_dir, store) = test_store().await;
        let mut client = Client {
            uuid: ClientUuid::from("a"),
            sequential_id: 1,
            address: "x".into(),
            roots: vec![],
        };

        assert!(store.create_client(&client).await.unwrap());
        client.sequential_id = 2;
        assert!(!store.create_client(&client).await.unwrap());

        let stored = store.get_client(&client.uuid).await.unwrap().unwrap();
        assert_eq!(stored.sequential_id, 1);
    }

    #[tokio::test]
    async fn list_files_is_scoped_to_root() {
        let (_dir, store) = test_store().await;
        store.put_file(&file("/r/a", "/r")).await.unwrap();
        store.put_file(&file("/r/sub/b", "/r")).await.unwrap();
        store.put_file(&file("/rx/c", "/rx")).await.unwrap();
        store.put_file(&file("/r/nested/d", "/r/nested")).await.unwrap();

        let paths: Vec<_> = store
            .list_files("/r")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.after_path)
            .collect();
        assert_eq!(paths, vec!["/r/a", "/r/sub/b"]);
    }

    #[tokio::test]
    async fn history_first_write_wins() {
        let (_dir, store) = test_store().await;

        assert!(store.append_history(&snapshot("/r/f", 5, "first")).await.unwrap());
        assert!(!store.append_history(&snapshot("/r/f", 5, "second")).await.unwrap());

        let stored = store
            .get_history("/r/f", SyncTimestamp::new(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.entry.hash, "first");
    }

    #[tokio::test]
    async fn history_lists_chronologically_without_siblings() {
        let (_dir, store) = test_store().await;
        store.append_history(&snapshot("/r/f", 10, "c")).await.unwrap();
        store.append_history(&snapshot("/r/f", 2, "a")).await.unwrap();
        store.append_history(&snapshot("/r/f", 9, "b")).await.unwrap();
        store.append_history(&snapshot("/r/f_x", 1, "other")).await.unwrap();

        let hashes: Vec<_> = store
            .list_history("/r/f")
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.entry.hash)
            .collect();
        assert_eq!(hashes, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn conflicts_round_trip() {
        let (_dir, store) = test_store().await;
        let conflict = Conflict {
            after_path: "/r/f".into(),
            server_side_hash: "H1".into(),
            server_side_sync_timestamp: SyncTimestamp::new(10),
            client_side_hash: "H2".into(),
            client_side_timestamp: SyncTimestamp::new(8),
            client_uuid: ClientUuid::from("a"),
            client_metadata: FileMetadata::default(),
        };

        store.put_file(&file("/r/f", "/r")).await.unwrap();
        store.put_conflict(&conflict).await.unwrap();
        assert_eq!(store.list_conflicts("/r").await.unwrap(), vec![conflict.clone()]);
        assert!(store.list_conflicts("/s").await.unwrap().is_empty());
        assert!(store.delete_conflict("/r/f").await.unwrap());
        assert!(store.get_conflict("/r/f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicts_of_nested_root_stay_with_it() {
        let (_dir, store) = test_store().await;
        let conflict = |path: &str| Conflict {
            after_path: path.into(),
            server_side_hash: "H1".into(),
            server_side_sync_timestamp: SyncTimestamp::new(2),
            client_side_hash: "H2".into(),
            client_side_timestamp: SyncTimestamp::new(1),
            client_uuid: ClientUuid::from("b"),
            client_metadata: FileMetadata::default(),
        };
        store.put_file(&file("/r/f", "/r")).await.unwrap();
        store.put_file(&file("/r/priv/f", "/r/priv")).await.unwrap();
        store.put_conflict(&conflict("/r/f")).await.unwrap();
        store.put_conflict(&conflict("/r/priv/f")).await.unwrap();

        let outer: Vec<_> = store
            .list_conflicts("/r")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.after_path)
            .collect();
        assert_eq!(outer, vec!["/r/f"]);

        let inner = store.list_conflicts("/r/priv").await.unwrap();
        assert_eq!(inner, vec![conflict("/r/priv/f")]);
    }
}
