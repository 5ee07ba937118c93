//! File areas: the bytes behind the key-value records.
//!
//! Every root directory owns three subtrees under the configured files dir:
//!
//! ```text
//! <files_dir>/<root key>/latest/<rel_dir>/<name>
//! <files_dir>/<root key>/history/<rel_dir>/<timestamp>_<name>
//! <files_dir>/<root key>/conflict/<rel_dir>/<name>_server
//! <files_dir>/<root key>/conflict/<rel_dir>/<name>_<client uuid>
//! ```
//!
//! The root key is the blake3 hex digest of the root's afterPath, so every
//! root gets one flat directory and nested roots such as `/r` and
//! `/r/latest` never share bytes on disk.
//!
//! Paths handed to this module are already validated afterPaths.

use crate::error::StorageError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use sync_types::SyncTimestamp;
use tokio::io::AsyncWriteExt;

const LATEST: &str = "latest";
const HISTORY: &str = "history";
const CONFLICT: &str = "conflict";

/// Suffix of the conflict copy holding the server's version.
pub const SERVER_SIDE: &str = "server";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory name holding one root directory's areas.
pub fn root_key(root: &str) -> String {
    blake3::hash(root.as_bytes()).to_hex().to_string()
}

/// Filesystem half of the versioned store.
#[derive(Debug, Clone)]
pub struct FileArea {
    base: PathBuf,
}

impl FileArea {
    /// Create a file area rooted at `base`. Directories are created lazily.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The directory every root directory lives under.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn root_base(&self, root: &str) -> PathBuf {
        self.base.join(root_key(root))
    }

    /// Split `after_path` into (directory relative to root, file name).
    fn split(root: &str, after_path: &str) -> Result<(PathBuf, String), StorageError> {
        let rel = after_path
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| {
                StorageError::io(
                    after_path,
                    std::io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("{after_path} is not inside root directory {root}"),
                    ),
                )
            })?;

        let (dir, name) = match rel.rsplit_once('/') {
            Some((dir, name)) => (PathBuf::from(dir), name.to_string()),
            None => (PathBuf::new(), rel.to_string()),
        };
        Ok((dir, name))
    }

    fn latest_path(&self, root: &str, after_path: &str) -> Result<PathBuf, StorageError> {
        let (dir, name) = Self::split(root, after_path)?;
        Ok(self.root_base(root).join(LATEST).join(dir).join(name))
    }

    fn history_path(
        &self,
        root: &str,
        after_path: &str,
        timestamp: SyncTimestamp,
    ) -> Result<PathBuf, StorageError> {
        let (dir, name) = Self::split(root, after_path)?;
        Ok(self
            .root_base(root)
            .join(HISTORY)
            .join(dir)
            .join(format!("{}_{}", timestamp.value(), name)))
    }

    fn conflict_dir(&self, root: &str, after_path: &str) -> Result<(PathBuf, String), StorageError> {
        let (dir, name) = Self::split(root, after_path)?;
        Ok((self.root_base(root).join(CONFLICT).join(dir), name))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }

    async fn read(path: PathBuf) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn remove(path: PathBuf) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Replace the latest copy of a file.
    ///
    /// Bytes go to a temporary sibling first and are renamed into place, so
    /// readers see either the old or the new version.
    pub async fn write_latest(
        &self,
        root: &str,
        after_path: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.latest_path(root, after_path)?;
        Self::ensure_parent(&path).await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            ".{}.tmp{}",
            name,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(path, e));
        }
        Ok(())
    }

    /// Read the latest copy of a file.
    pub async fn read_latest(&self, root: &str, after_path: &str) -> Result<Vec<u8>, StorageError> {
        Self::read(self.latest_path(root, after_path)?).await
    }

    /// Delete the latest copy of a file. Returns true if it existed.
    pub async fn remove_latest(&self, root: &str, after_path: &str) -> Result<bool, StorageError> {
        Self::remove(self.latest_path(root, after_path)?).await
    }

    /// Store a snapshot. Never overwrites: returns false if one already exists.
    pub async fn write_history(
        &self,
        root: &str,
        after_path: &str,
        timestamp: SyncTimestamp,
        bytes: &[u8],
    ) -> Result<bool, StorageError> {
        let path = self.history_path(root, after_path, timestamp)?;
        Self::ensure_parent(&path).await?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(true)
    }

    /// Read a snapshot.
    pub async fn read_history(
        &self,
        root: &str,
        after_path: &str,
        timestamp: SyncTimestamp,
    ) -> Result<Vec<u8>, StorageError> {
        Self::read(self.history_path(root, after_path, timestamp)?).await
    }

    /// Store one side of a conflict (`server` or a client uuid).
    pub async fn write_conflict(
        &self,
        root: &str,
        after_path: &str,
        side: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let (dir, name) = self.conflict_dir(root, after_path)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        let path = dir.join(format!("{name}_{side}"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    /// Read one side of a conflict.
    pub async fn read_conflict(
        &self,
        root: &str,
        after_path: &str,
        side: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let (dir, name) = self.conflict_dir(root, after_path)?;
        Self::read(dir.join(format!("{name}_{side}"))).await
    }

    /// Delete every conflict copy of a file. Returns how many were removed.
    ///
    /// Matches `<name>_<side>` where the side contains no underscore, so the
    /// copies of a sibling such as `<name>_x` are left alone.
    pub async fn clear_conflicts(&self, root: &str, after_path: &str) -> Result<usize, StorageError> {
        let (dir, name) = self.conflict_dir(root, after_path)?;
        let prefix = format!("{name}_");

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let matches = file_name
                .strip_prefix(&prefix)
                .map(|side| !side.is_empty() && !side.contains('_'))
                .unwrap_or(false);
            if matches && Self::remove(entry.path()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete a root directory's latest and conflict subtrees. History stays.
    pub async fn remove_root(&self, root: &str) -> Result<(), StorageError> {
        let base = self.root_base(root);
        for area in [LATEST, CONFLICT] {
            let dir = base.join(area);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(dir, e)),
            }
        }
        Ok(())
    }
}
