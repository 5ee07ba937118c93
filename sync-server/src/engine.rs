//! The sync engine: pushes, conflict arbitration, reconciliation and pulls.
//!
//! Every operation resolves the requesting client's root directory through
//! the registrar first. Writes to one afterPath run under that path's lock,
//! from the conflict check until the file record is stored. Fan-out to other
//! subscribers happens after the lock is released and never blocks the
//! originating transaction.

use crate::error::{SyncError, SyncResult};
use crate::history::{History, HISTORY_SEQUENCE};
use crate::model::{is_within, validate_path, FileRecord, HistoryRecord};
use crate::registration::Registrar;
use crate::server::ServerMetrics;
use crate::storage::{VersionedStore, SERVER_SIDE};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sync_types::{
    content_hash, ChooseOne, ChooseOneAck, ClientUuid, Conflict, ConflictList, FileContent,
    FileHistory, FileMeta, FileMetadata, ForceSync, FullScan, GiveYou, Message, MustSync,
    PleaseSyncAck, PleaseSyncContent, PleaseSyncMeta, ScanAction, ScanEntry, ScanReport,
    ScanResult, Side, SyncTimestamp,
};
use tokio::task::JoinHandle;

/// Pushes spawned by a committed transaction.
///
/// Dropping this detaches the tasks; they still run to completion.
#[derive(Debug, Default)]
pub struct Deliveries(Vec<JoinHandle<bool>>);

impl Deliveries {
    /// No pushes.
    pub fn none() -> Self {
        Self::default()
    }

    /// Number of pushes started.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if nobody was notified.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wait for every push and count the acknowledged ones.
    pub async fn settled(self) -> usize {
        let mut delivered = 0;
        for handle in self.0 {
            if matches!(handle.await, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// The sync engine.
pub struct SyncEngine {
    store: VersionedStore,
    registrar: Arc<Registrar>,
    history: History,
    metrics: Arc<ServerMetrics>,
    fanout_timeout: Duration,
    max_file_size: u64,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("fanout_timeout", &self.fanout_timeout)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine over the registrar's store.
    pub fn new(
        registrar: Arc<Registrar>,
        history: History,
        metrics: Arc<ServerMetrics>,
        fanout_timeout: Duration,
        max_file_size: u64,
    ) -> Self {
        Self {
            store: registrar.store().clone(),
            registrar,
            history,
            metrics,
            fanout_timeout,
            max_file_size,
        }
    }

    /// PLEASESYNC, first exchange: the server's view of a path.
    ///
    /// A path the server has never seen gets a zero baseline.
    pub async fn file_meta(&self, req: &PleaseSyncMeta) -> SyncResult<FileMeta> {
        self.registrar
            .resolve_root(&req.uuid, &req.after_path)
            .await?;

        let meta = match self.store.get_file(&req.after_path).await? {
            Some(file) => FileMeta {
                uuid: req.uuid.clone(),
                after_path: req.after_path.clone(),
                latest_hash: file.latest_hash,
                latest_sync_timestamp: file.latest_sync_timestamp,
                modified_date: file.metadata.modified,
            },
            None => FileMeta {
                uuid: req.uuid.clone(),
                after_path: req.after_path.clone(),
                latest_hash: String::new(),
                latest_sync_timestamp: SyncTimestamp::zero(),
                modified_date: 0,
            },
        };
        Ok(meta)
    }

    /// PLEASESYNC, second exchange: conflict check, then commit and fan-out.
    pub async fn please_sync(
        &self,
        req: PleaseSyncContent,
    ) -> SyncResult<(PleaseSyncAck, Deliveries)> {
        let (_, binding) = self
            .registrar
            .resolve_root(&req.uuid, &req.after_path)
            .await?;
        let root = binding.after_path;

        if req.file_bytes.len() as u64 > self.max_file_size {
            return Err(SyncError::Validation(format!(
                "{} bytes exceeds the {} byte file limit",
                req.file_bytes.len(),
                self.max_file_size
            )));
        }

        let has_contents = req.event.has_contents();
        let new_hash = if !has_contents {
            String::new()
        } else if req.last_update_hash.is_empty() {
            content_hash(&req.file_bytes)
        } else {
            req.last_update_hash.clone()
        };

        let ack = |conflict: bool, timestamp: SyncTimestamp| PleaseSyncAck {
            uuid: req.uuid.clone(),
            after_path: req.after_path.clone(),
            conflict,
            latest_sync_timestamp: timestamp,
        };

        let committed = {
            let _guard = self.registrar.locks().path(&req.after_path).await;

            let current = self.store.get_file(&req.after_path).await?;
            if let Some(file) = &current {
                if file.root_dir != root {
                    return Err(SyncError::Validation(format!(
                        "{} belongs to root directory {}",
                        req.after_path, file.root_dir
                    )));
                }
            }
            let current_ts = match &current {
                Some(file) => file.latest_sync_timestamp,
                None => self.retained_timestamp(&req.after_path).await?,
            };

            if self.store.get_conflict(&req.after_path).await?.is_some() {
                tracing::debug!(
                    "{} has a pending conflict; push from {} not applied",
                    req.after_path,
                    req.uuid
                );
                return Ok((ack(true, current_ts), Deliveries::none()));
            }

            let diverged = current.as_ref().filter(|f| {
                f.latest_sync_timestamp > req.last_update_timestamp && f.latest_hash != new_hash
            });
            if let Some(file) = diverged {
                self.record_conflict(&root, file, &req, &new_hash).await?;
                return Ok((ack(true, current_ts), Deliveries::none()));
            }

            self.commit(
                &root,
                &req.uuid,
                &req.after_path,
                current_ts.next(),
                new_hash,
                req.metadata.clone(),
                has_contents.then_some(req.file_bytes.as_slice()),
            )
            .await?
        };

        self.metrics.pushes_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "{:?} {} committed at {} by {}",
            req.event,
            req.after_path,
            committed.latest_sync_timestamp,
            req.uuid
        );

        let deliveries = self
            .fan_out(&root, &req.uuid, |before_path| {
                Message::MustSync(MustSync {
                    latest_hash: committed.latest_hash.clone(),
                    latest_sync_timestamp: committed.latest_sync_timestamp,
                    before_path,
                    after_path: committed.after_path.clone(),
                })
            })
            .await;

        Ok((ack(false, committed.latest_sync_timestamp), deliveries))
    }

    /// Newest timestamp in a path's history. History outlives a removed
    /// file record, so a path pushed again continues from there.
    async fn retained_timestamp(&self, after_path: &str) -> SyncResult<SyncTimestamp> {
        Ok(self
            .store
            .list_history(after_path)
            .await?
            .into_iter()
            .map(|record| record.entry.timestamp)
            .max()
            .unwrap_or_default())
    }

    async fn record_conflict(
        &self,
        root: &str,
        file: &FileRecord,
        req: &PleaseSyncContent,
        client_hash: &str,
    ) -> SyncResult<()> {
        let area = self.store.area();
        if file.contents_existed {
            match area.read_latest(root, &file.after_path).await {
                Ok(bytes) => {
                    area.write_conflict(root, &file.after_path, SERVER_SIDE, &bytes)
                        .await?
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Latest copy of {} is missing", file.after_path)
                }
                Err(e) => return Err(e.into()),
            }
        }
        if req.event.has_contents() {
            area.write_conflict(root, &file.after_path, req.uuid.as_str(), &req.file_bytes)
                .await?;
        }

        self.store
            .put_conflict(&Conflict {
                after_path: file.after_path.clone(),
                server_side_hash: file.latest_hash.clone(),
                server_side_sync_timestamp: file.latest_sync_timestamp,
                client_side_hash: client_hash.to_string(),
                client_side_timestamp: req.last_update_timestamp,
                client_uuid: req.uuid.clone(),
                client_metadata: req.metadata.clone(),
            })
            .await?;

        self.metrics.conflicts_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Conflict on {}: server at {}, {} pushed from {}",
            file.after_path,
            file.latest_sync_timestamp,
            req.uuid,
            req.last_update_timestamp
        );
        Ok(())
    }

    /// Write bytes (or remove them), append history, then store the record.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        root: &str,
        author: &ClientUuid,
        after_path: &str,
        timestamp: SyncTimestamp,
        hash: String,
        metadata: FileMetadata,
        contents: Option<&[u8]>,
    ) -> SyncResult<FileRecord> {
        let area = self.store.area();
        match contents {
            Some(bytes) => {
                area.write_latest(root, after_path, bytes).await?;
                if !area.write_history(root, after_path, timestamp, bytes).await? {
                    tracing::warn!(
                        "History bytes of {} at {} already exist; keeping the first",
                        after_path,
                        timestamp
                    );
                }
            }
            None => {
                area.remove_latest(root, after_path).await?;
            }
        }

        let entry = FileHistory {
            id: self.store.next_id(HISTORY_SEQUENCE).await?,
            date: unix_now(),
            uuid: author.clone(),
            after_path: after_path.to_string(),
            timestamp,
            hash: hash.clone(),
            contents_existed: contents.is_some(),
            metadata: metadata.clone(),
        };
        if !self
            .store
            .append_history(&HistoryRecord {
                root_dir: root.to_string(),
                entry,
            })
            .await?
        {
            tracing::warn!(
                "History record of {} at {} already exists; keeping the first",
                after_path,
                timestamp
            );
        }

        let record = FileRecord {
            after_path: after_path.to_string(),
            root_dir: root.to_string(),
            latest_hash: hash,
            latest_sync_timestamp: timestamp,
            contents_existed: contents.is_some(),
            metadata,
        };
        self.store.put_file(&record).await?;
        Ok(record)
    }

    /// Push one message per online subscriber of `root`, except `origin`.
    ///
    /// Failures are counted and logged, never returned.
    async fn fan_out<F>(&self, root: &str, origin: &ClientUuid, build: F) -> Deliveries
    where
        F: Fn(String) -> Message,
    {
        let subscribers = match self.registrar.subscribers(root).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::error!("Fan-out for {} skipped: {}", root, e);
                return Deliveries::none();
            }
        };

        let before_paths: HashMap<ClientUuid, String> = subscribers
            .into_iter()
            .filter(|(uuid, _)| uuid != origin)
            .collect();
        let uuids: Vec<ClientUuid> = before_paths.keys().cloned().collect();

        let mut handles = Vec::new();
        for (uuid, peer) in self.registrar.registry().lookup_many(&uuids) {
            let Some(before_path) = before_paths.get(&uuid) else {
                continue;
            };
            let message = build(before_path.clone());
            let metrics = self.metrics.clone();
            let timeout = self.fanout_timeout;

            handles.push(tokio::spawn(async move {
                let name = message.transaction_name();
                match tokio::time::timeout(timeout, peer.request(&message)).await {
                    Ok(Ok(Message::SyncAck(ack))) => {
                        metrics.fanout_sent.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "{} delivered to {} (acked {})",
                            name,
                            uuid,
                            ack.latest_sync_timestamp
                        );
                        true
                    }
                    Ok(Ok(other)) => {
                        metrics.fanout_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "{} to {} answered with {}",
                            name,
                            uuid,
                            other.transaction_name()
                        );
                        false
                    }
                    Ok(Err(e)) => {
                        metrics.fanout_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("{} to {} failed: {}", name, uuid, e);
                        false
                    }
                    Err(_) => {
                        metrics.fanout_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("{} to {} timed out", name, uuid);
                        false
                    }
                }
            }));
        }
        Deliveries(handles)
    }

    /// CONFLICTLIST: pending conflicts under the requested roots.
    ///
    /// An empty root list means every root the client is bound to.
    pub async fn conflict_list(&self, req: &ConflictList) -> SyncResult<Vec<Conflict>> {
        let roots = if req.root_dirs.is_empty() {
            self.registrar.root_dirs(&req.uuid).await?
        } else {
            for root in &req.root_dirs {
                self.registrar.require_binding(&req.uuid, root).await?;
            }
            req.root_dirs.clone()
        };

        let mut conflicts = BTreeMap::new();
        for root in &roots {
            for conflict in self.store.list_conflicts(root).await? {
                conflicts
                    .entry(conflict.after_path.clone())
                    .or_insert(conflict);
            }
        }
        Ok(conflicts.into_values().collect())
    }

    /// CHOOSEONE: resolve a pending conflict and force the winner on everyone.
    pub async fn choose_one(&self, req: &ChooseOne) -> SyncResult<(ChooseOneAck, Deliveries)> {
        let (_, binding) = self
            .registrar
            .resolve_root(&req.uuid, &req.after_path)
            .await?;
        let root = binding.after_path;

        let (record, contents) = {
            let _guard = self.registrar.locks().path(&req.after_path).await;

            let conflict = self
                .store
                .get_conflict(&req.after_path)
                .await?
                .ok_or_else(|| {
                    SyncError::NotFound(format!("no conflict pending for {}", req.after_path))
                })?;
            let current = self.store.get_file(&req.after_path).await?;
            let current_ts = current
                .as_ref()
                .map(|f| f.latest_sync_timestamp)
                .unwrap_or_default();

            let (hash, side_ts, side_key, metadata) = match req.side {
                Side::Server => (
                    conflict.server_side_hash.clone(),
                    conflict.server_side_sync_timestamp,
                    SERVER_SIDE.to_string(),
                    current.map(|f| f.metadata).unwrap_or_default(),
                ),
                Side::Client => (
                    conflict.client_side_hash.clone(),
                    conflict.client_side_timestamp,
                    conflict.client_uuid.to_string(),
                    conflict.client_metadata.clone(),
                ),
            };

            if req.selected_timestamp != SyncTimestamp::zero()
                && req.selected_timestamp != side_ts
            {
                return Err(SyncError::Validation(format!(
                    "selected timestamp {} does not match the {:?} side at {}",
                    req.selected_timestamp, req.side, side_ts
                )));
            }

            let area = self.store.area();
            let contents = if hash.is_empty() {
                None
            } else {
                match area.read_conflict(&root, &req.after_path, &side_key).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.is_not_found() => {
                        return Err(SyncError::NotFound(format!(
                            "conflict copy {} of {} is missing",
                            side_key, req.after_path
                        )))
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let timestamp = conflict
                .server_side_sync_timestamp
                .max(conflict.client_side_timestamp)
                .max(current_ts)
                .next();

            let record = self
                .commit(
                    &root,
                    &req.uuid,
                    &req.after_path,
                    timestamp,
                    hash,
                    metadata,
                    contents.as_deref(),
                )
                .await?;

            self.store.delete_conflict(&req.after_path).await?;
            let cleared = area.clear_conflicts(&root, &req.after_path).await?;
            tracing::info!(
                "Conflict on {} resolved to the {:?} side at {} ({} copies cleared)",
                req.after_path,
                req.side,
                record.latest_sync_timestamp,
                cleared
            );
            (record, contents)
        };

        self.metrics.resolutions_total.fetch_add(1, Ordering::Relaxed);

        let file_bytes = contents.unwrap_or_default();
        let deliveries = self
            .fan_out(&root, &req.uuid, |before_path| {
                Message::ForceSync(ForceSync {
                    latest_hash: record.latest_hash.clone(),
                    latest_sync_timestamp: record.latest_sync_timestamp,
                    before_path,
                    after_path: record.after_path.clone(),
                    file_bytes: file_bytes.clone(),
                })
            })
            .await;

        Ok((
            ChooseOneAck {
                uuid: req.uuid.clone(),
                after_path: req.after_path.clone(),
            },
            deliveries,
        ))
    }

    /// FULLSCAN: classify a client's listing of one root.
    pub async fn full_scan(&self, req: &FullScan) -> SyncResult<ScanReport> {
        self.registrar
            .require_binding(&req.uuid, &req.root_dir)
            .await?;
        self.scan_report(&req.root_dir, &req.entries).await
    }

    /// Classify a listing against the stored records of `root`.
    pub async fn scan_report(&self, root: &str, entries: &[ScanEntry]) -> SyncResult<ScanReport> {
        let files = self.store.list_files(root).await?;
        Ok(ScanReport {
            root_dir: root.to_string(),
            results: classify(root, entries, &files)?,
        })
    }

    /// GIVEYOU: the latest bytes of a file, or a history snapshot.
    pub async fn give_you(&self, req: &GiveYou) -> SyncResult<FileContent> {
        self.registrar
            .resolve_root(&req.uuid, &req.after_path)
            .await?;

        if let Some(timestamp) = req.timestamp {
            let (entry, file_bytes) = self
                .history
                .history_content(&req.after_path, timestamp)
                .await?;
            return Ok(FileContent {
                after_path: entry.after_path,
                timestamp: entry.timestamp,
                hash: entry.hash,
                metadata: entry.metadata,
                file_bytes,
            });
        }

        let _guard = self.registrar.locks().path(&req.after_path).await;
        let file = self
            .store
            .get_file(&req.after_path)
            .await?
            .filter(|f| f.contents_existed)
            .ok_or_else(|| SyncError::NotFound(format!("no live copy of {}", req.after_path)))?;

        let file_bytes = match self
            .store
            .area()
            .read_latest(&file.root_dir, &file.after_path)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(SyncError::NotFound(format!(
                    "latest copy of {} is missing",
                    file.after_path
                )))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(FileContent {
            after_path: file.after_path,
            timestamp: file.latest_sync_timestamp,
            hash: file.latest_hash,
            metadata: file.metadata,
            file_bytes,
        })
    }

    /// Delete a file's record, conflict and latest bytes. History stays.
    pub async fn remove_file(&self, after_path: &str) -> SyncResult<FileRecord> {
        validate_path(after_path).map_err(SyncError::Validation)?;
        let _guard = self.registrar.locks().path(after_path).await;

        let file = self
            .store
            .get_file(after_path)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("file {after_path}")))?;
        self.store.delete_file(after_path).await?;
        self.store.delete_conflict(after_path).await?;

        let area = self.store.area();
        area.remove_latest(&file.root_dir, after_path).await?;
        area.clear_conflicts(&file.root_dir, after_path).await?;

        tracing::info!("Removed file {}", after_path);
        Ok(file)
    }
}

/// Compare a client listing with the server's records of one root.
///
/// Matching hashes on a live record are up to date. Paths only the client
/// has are pushed. When both have a path with different content, the newer
/// modification time wins. Live paths only the server has are pulled;
/// removed ones the client no longer lists are omitted. Results are sorted
/// by path.
pub fn classify(
    root: &str,
    entries: &[ScanEntry],
    files: &[FileRecord],
) -> SyncResult<Vec<ScanResult>> {
    let mut server: BTreeMap<&str, &FileRecord> = files
        .iter()
        .map(|f| (f.after_path.as_str(), f))
        .collect();
    let mut results: BTreeMap<String, ScanResult> = BTreeMap::new();

    for entry in entries {
        if !is_within(root, &entry.after_path) {
            return Err(SyncError::Validation(format!(
                "{} is not inside root directory {}",
                entry.after_path, root
            )));
        }
        if results.contains_key(&entry.after_path) {
            continue;
        }

        let result = match server.remove(entry.after_path.as_str()) {
            None => ScanResult {
                after_path: entry.after_path.clone(),
                action: ScanAction::PleaseSync,
                latest_hash: String::new(),
                latest_sync_timestamp: SyncTimestamp::zero(),
            },
            Some(file) => {
                let action = if file.contents_existed && file.latest_hash == entry.hash {
                    ScanAction::UpToDate
                } else if entry.mod_time > file.metadata.modified {
                    ScanAction::PleaseSync
                } else {
                    ScanAction::MustSync
                };
                server_result(file, action)
            }
        };
        results.insert(entry.after_path.clone(), result);
    }

    for file in server.into_values().filter(|f| f.contents_existed) {
        results.insert(
            file.after_path.clone(),
            server_result(file, ScanAction::MustSync),
        );
    }

    Ok(results.into_values().collect())
}

fn server_result(file: &FileRecord, action: ScanAction) -> ScanResult {
    ScanResult {
        after_path: file.after_path.clone(),
        action,
        latest_hash: if file.contents_existed {
            file.latest_hash.clone()
        } else {
            String::new()
        },
        latest_sync_timestamp: file.latest_sync_timestamp,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::KeyedLocks;
    use crate::peer::mock::MockPeer;
    use crate::registration::tests::fast_hasher;
    use crate::registry::ConnectionRegistry;
    use crate::storage::test_store;
    use proptest::prelude::*;
    use sync_types::{RegisterRootDir, SyncEvent, SyncRootDir};

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: SyncEngine,
        registrar: Arc<Registrar>,
        store: VersionedStore,
        metrics: Arc<ServerMetrics>,
        a: Arc<MockPeer>,
        b: Arc<MockPeer>,
    }

    async fn fixture() -> Fixture {
        let (dir, store) = test_store().await;
        let locks = Arc::new(KeyedLocks::new());
        let registrar = Arc::new(Registrar::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
            locks.clone(),
            "server-pw".into(),
            fast_hasher(),
        ));

        let a = MockPeer::new("a");
        let b = MockPeer::new("b");
        registrar
            .register_client(&ClientUuid::from("a"), "server-pw", a.clone())
            .await
            .unwrap();
        registrar
            .register_client(&ClientUuid::from("b"), "server-pw", b.clone())
            .await
            .unwrap();
        registrar
            .register_root_dir(&RegisterRootDir {
                uuid: ClientUuid::from("a"),
                root_dir_password: "root-pw".into(),
                before_path: "/home/a/r".into(),
                after_path: "/r".into(),
            })
            .await
            .unwrap();
        registrar
            .sync_root_dir(&SyncRootDir {
                uuid: ClientUuid::from("b"),
                root_dir_password: "root-pw".into(),
                before_path: "/home/b/r".into(),
                after_path: "/r".into(),
            })
            .await
            .unwrap();

        let metrics = Arc::new(ServerMetrics::default());
        let engine = SyncEngine::new(
            registrar.clone(),
            History::new(store.clone(), locks),
            metrics.clone(),
            Duration::from_secs(1),
            1024,
        );
        Fixture {
            _dir: dir,
            engine,
            registrar,
            store,
            metrics,
            a,
            b,
        }
    }

    fn push(uuid: &str, path: &str, baseline: u64, bytes: &[u8]) -> PleaseSyncContent {
        PleaseSyncContent {
            uuid: ClientUuid::from(uuid),
            event: SyncEvent::Write,
            before_path: format!("/home/{uuid}/r"),
            after_path: path.into(),
            last_update_timestamp: SyncTimestamp::new(baseline),
            last_update_hash: content_hash(bytes),
            metadata: FileMetadata {
                name: "f".into(),
                size: bytes.len() as u64,
                mode: 0o644,
                modified: 1_705_000_000,
                is_dir: false,
            },
            file_bytes: bytes.to_vec(),
        }
    }

    async fn seed(fx: &Fixture, hash: &str, ts: u64, bytes: &[u8]) {
        fx.store.area().write_latest("/r", "/r/f", bytes).await.unwrap();
        fx.store
            .put_file(&FileRecord {
                after_path: "/r/f".into(),
                root_dir: "/r".into(),
                latest_hash: hash.into(),
                latest_sync_timestamp: SyncTimestamp::new(ts),
                contents_existed: true,
                metadata: FileMetadata::default(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_path_has_zero_baseline() {
        let fx = fixture().await;
        let meta = fx
            .engine
            .file_meta(&PleaseSyncMeta {
                uuid: ClientUuid::from("a"),
                after_path: "/r/new".into(),
            })
            .await
            .unwrap();
        assert_eq!(meta.latest_sync_timestamp, SyncTimestamp::zero());
        assert!(meta.latest_hash.is_empty());
    }

    #[tokio::test]
    async fn push_commits_and_notifies_other_subscribers() {
        let fx = fixture().await;

        let (ack, deliveries) = fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();
        assert!(!ack.conflict);
        assert_eq!(ack.latest_sync_timestamp, SyncTimestamp::new(1));
        assert_eq!(deliveries.settled().await, 1);

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_hash, content_hash(b"v1"));
        assert!(file.contents_existed);
        assert_eq!(fx.store.area().read_latest("/r", "/r/f").await.unwrap(), b"v1");
        assert_eq!(fx.store.list_history("/r/f").await.unwrap().len(), 1);

        assert_eq!(
            fx.b.requests(),
            vec![Message::MustSync(MustSync {
                latest_hash: content_hash(b"v1"),
                latest_sync_timestamp: SyncTimestamp::new(1),
                before_path: "/home/b/r".into(),
                after_path: "/r/f".into(),
            })]
        );
        assert!(fx.a.requests().is_empty());
        assert_eq!(fx.metrics.fanout_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn identical_content_still_advances_timestamp() {
        let fx = fixture().await;
        let mut baseline = 0;
        for _ in 0..3 {
            let (ack, _) = fx
                .engine
                .please_sync(push("a", "/r/f", baseline, b"same"))
                .await
                .unwrap();
            assert!(!ack.conflict);
            assert!(ack.latest_sync_timestamp.value() > baseline);
            baseline = ack.latest_sync_timestamp.value();
        }
        assert_eq!(baseline, 3);
    }

    #[tokio::test]
    async fn stale_divergent_push_records_conflict() {
        let fx = fixture().await;
        seed(&fx, "H1", 10, b"server copy").await;

        let mut req = push("b", "/r/f", 8, b"client copy");
        req.last_update_hash = "H2".into();
        let (ack, deliveries) = fx.engine.please_sync(req).await.unwrap();

        assert!(ack.conflict);
        assert_eq!(ack.latest_sync_timestamp, SyncTimestamp::new(10));
        assert!(deliveries.is_empty());

        let conflict = fx.store.get_conflict("/r/f").await.unwrap().unwrap();
        assert_eq!(conflict.server_side_hash, "H1");
        assert_eq!(conflict.server_side_sync_timestamp, SyncTimestamp::new(10));
        assert_eq!(conflict.client_side_hash, "H2");
        assert_eq!(conflict.client_side_timestamp, SyncTimestamp::new(8));
        assert_eq!(conflict.client_uuid, ClientUuid::from("b"));

        let area = fx.store.area();
        assert_eq!(
            area.read_conflict("/r", "/r/f", SERVER_SIDE).await.unwrap(),
            b"server copy"
        );
        assert_eq!(area.read_conflict("/r", "/r/f", "b").await.unwrap(), b"client copy");

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_sync_timestamp, SyncTimestamp::new(10));
        assert_eq!(fx.metrics.conflicts_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stale_push_with_matching_hash_is_not_a_conflict() {
        let fx = fixture().await;
        seed(&fx, "H1", 10, b"server copy").await;

        let mut req = push("b", "/r/f", 8, b"server copy");
        req.last_update_hash = "H1".into();
        let (ack, _) = fx.engine.please_sync(req).await.unwrap();

        assert!(!ack.conflict);
        assert_eq!(ack.latest_sync_timestamp, SyncTimestamp::new(11));
        assert!(fx.store.get_conflict("/r/f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_conflict_freezes_the_path() {
        let fx = fixture().await;
        seed(&fx, "H1", 10, b"server copy").await;
        let mut req = push("b", "/r/f", 8, b"client copy");
        req.last_update_hash = "H2".into();
        fx.engine.please_sync(req).await.unwrap();

        let (ack, _) = fx
            .engine
            .please_sync(push("a", "/r/f", 10, b"third"))
            .await
            .unwrap();

        assert!(ack.conflict);
        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_hash, "H1");
        assert_eq!(
            fx.store.area().read_latest("/r", "/r/f").await.unwrap(),
            b"server copy"
        );
    }

    #[tokio::test]
    async fn choosing_client_side_resolves_and_forces_sync() {
        let fx = fixture().await;
        seed(&fx, "H1", 10, b"server copy").await;
        let mut req = push("b", "/r/f", 8, b"client copy");
        req.last_update_hash = "H2".into();
        fx.engine.please_sync(req).await.unwrap();

        let choose = ChooseOne {
            uuid: ClientUuid::from("b"),
            after_path: "/r/f".into(),
            selected_timestamp: SyncTimestamp::new(8),
            side: Side::Client,
        };
        let (ack, deliveries) = fx.engine.choose_one(&choose).await.unwrap();
        assert_eq!(ack.after_path, "/r/f");
        assert_eq!(deliveries.settled().await, 1);

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_hash, "H2");
        assert_eq!(file.latest_sync_timestamp, SyncTimestamp::new(11));
        assert_eq!(
            fx.store.area().read_latest("/r", "/r/f").await.unwrap(),
            b"client copy"
        );

        let listed = fx
            .engine
            .conflict_list(&ConflictList {
                uuid: ClientUuid::from("a"),
                root_dirs: vec!["/r".into()],
            })
            .await
            .unwrap();
        assert!(listed.is_empty());
        assert!(fx
            .store
            .area()
            .read_conflict("/r", "/r/f", SERVER_SIDE)
            .await
            .is_err());

        match fx.a.requests().as_slice() {
            [Message::ForceSync(force)] => {
                assert_eq!(force.file_bytes, b"client copy");
                assert_eq!(force.before_path, "/home/a/r");
                assert_eq!(force.latest_sync_timestamp, SyncTimestamp::new(11));
            }
            other => panic!("unexpected pushes to a: {other:?}"),
        }

        let again = fx.engine.choose_one(&choose).await.unwrap_err();
        assert!(matches!(again, SyncError::NotFound(_)));
        assert_eq!(fx.metrics.resolutions_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stale_selected_timestamp_is_rejected() {
        let fx = fixture().await;
        seed(&fx, "H1", 10, b"server copy").await;
        let mut req = push("b", "/r/f", 8, b"client copy");
        req.last_update_hash = "H2".into();
        fx.engine.please_sync(req).await.unwrap();

        let err = fx
            .engine
            .choose_one(&ChooseOne {
                uuid: ClientUuid::from("a"),
                after_path: "/r/f".into(),
                selected_timestamp: SyncTimestamp::new(9),
                side: Side::Server,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(fx.store.get_conflict("/r/f").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn end_to_end_conflict_scenario() {
        let fx = fixture().await;

        let (ack, deliveries) = fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();
        let t1 = ack.latest_sync_timestamp;
        deliveries.settled().await;
        match fx.b.requests().as_slice() {
            [Message::MustSync(m)] => {
                assert_eq!(m.latest_hash, content_hash(b"v1"));
                assert_eq!(m.latest_sync_timestamp, t1);
            }
            other => panic!("unexpected pushes to b: {other:?}"),
        }

        let (ack, _) = fx
            .engine
            .please_sync(push("a", "/r/f", t1.value() - 1, b"v2"))
            .await
            .unwrap();
        assert!(ack.conflict);

        fx.engine
            .choose_one(&ChooseOne {
                uuid: ClientUuid::from("a"),
                after_path: "/r/f".into(),
                selected_timestamp: SyncTimestamp::zero(),
                side: Side::Client,
            })
            .await
            .unwrap();

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_hash, content_hash(b"v2"));
    }

    #[tokio::test]
    async fn offline_subscriber_does_not_fail_the_push() {
        let fx = fixture().await;
        fx.registrar.registry().unbind(&ClientUuid::from("b"));

        let (ack, deliveries) = fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();
        assert!(!ack.conflict);
        assert!(deliveries.is_empty());
        assert!(fx.store.get_file("/r/f").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_subscriber_is_counted() {
        let fx = fixture().await;
        fx.b.fail();

        let (_, deliveries) = fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();
        assert_eq!(deliveries.settled().await, 0);
        assert_eq!(fx.metrics.fanout_failed.load(Ordering::Relaxed), 1);
        assert!(fx.store.get_file("/r/f").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_keeps_history_and_hides_latest() {
        let fx = fixture().await;
        fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();

        let mut remove = push("a", "/r/f", 1, b"");
        remove.event = SyncEvent::Remove;
        let (ack, _) = fx.engine.please_sync(remove).await.unwrap();
        assert_eq!(ack.latest_sync_timestamp, SyncTimestamp::new(2));

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert!(!file.contents_existed);
        assert!(file.latest_hash.is_empty());

        let latest = fx
            .engine
            .give_you(&GiveYou {
                uuid: ClientUuid::from("b"),
                after_path: "/r/f".into(),
                timestamp: None,
            })
            .await;
        assert!(matches!(latest, Err(SyncError::NotFound(_))));

        let old = fx
            .engine
            .give_you(&GiveYou {
                uuid: ClientUuid::from("b"),
                after_path: "/r/f".into(),
                timestamp: Some(SyncTimestamp::new(1)),
            })
            .await
            .unwrap();
        assert_eq!(old.file_bytes, b"v1");
    }

    #[tokio::test]
    async fn oversized_push_is_rejected() {
        let fx = fixture().await;
        let err = fx
            .engine
            .please_sync(push("a", "/r/big", 0, &[0u8; 2048]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn unsubscribed_client_cannot_push() {
        let fx = fixture().await;
        fx.registrar
            .register_client(&ClientUuid::from("c"), "server-pw", MockPeer::new("c"))
            .await
            .unwrap();
        let err = fx
            .engine
            .please_sync(push("c", "/r/f", 0, b"v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
    }

    #[tokio::test]
    async fn remove_file_keeps_history() {
        let fx = fixture().await;
        fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();

        fx.engine.remove_file("/r/f").await.unwrap();

        assert!(fx.store.get_file("/r/f").await.unwrap().is_none());
        assert!(fx.store.area().read_latest("/r", "/r/f").await.is_err());
        assert_eq!(fx.store.list_history("/r/f").await.unwrap().len(), 1);
        assert!(matches!(
            fx.engine.remove_file("/r/f").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn push_after_remove_continues_from_history() {
        let fx = fixture().await;
        for (baseline, bytes) in [(0, b"v1"), (1, b"v2"), (2, b"v3")] {
            fx.engine
                .please_sync(push("a", "/r/f", baseline, bytes))
                .await
                .unwrap();
        }
        fx.engine.remove_file("/r/f").await.unwrap();

        let (ack, _) = fx
            .engine
            .please_sync(push("a", "/r/f", 0, b"NEW"))
            .await
            .unwrap();
        assert!(!ack.conflict);
        assert_eq!(ack.latest_sync_timestamp, SyncTimestamp::new(4));

        let history = fx.engine.history.list_history("/r/f").await.unwrap();
        assert_eq!(history.len(), 4);
        let (entry, bytes) = fx
            .engine
            .history
            .history_content("/r/f", SyncTimestamp::new(4))
            .await
            .unwrap();
        assert_eq!(bytes, b"NEW");
        assert_eq!(entry.hash, content_hash(b"NEW"));
    }

    #[tokio::test]
    async fn concurrent_pushes_from_same_baseline_conflict_once() {
        let fx = fixture().await;
        fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();

        let engine = Arc::new(fx.engine);
        let racers: Vec<_> = [("a", &b"from-a"[..]), ("b", &b"from-b"[..])]
            .into_iter()
            .map(|(uuid, bytes)| {
                let engine = engine.clone();
                let req = push(uuid, "/r/f", 1, bytes);
                tokio::spawn(async move { engine.please_sync(req).await.unwrap().0 })
            })
            .collect();

        let mut acks = Vec::new();
        for racer in racers {
            acks.push(racer.await.unwrap());
        }
        let committed: Vec<_> = acks.iter().filter(|ack| !ack.conflict).collect();
        let conflicted: Vec<_> = acks.iter().filter(|ack| ack.conflict).collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(conflicted.len(), 1);
        assert_eq!(committed[0].latest_sync_timestamp, SyncTimestamp::new(2));

        let conflict = fx.store.get_conflict("/r/f").await.unwrap().unwrap();
        assert_eq!(conflict.client_uuid, conflicted[0].uuid);
        assert_eq!(conflict.server_side_sync_timestamp, SyncTimestamp::new(2));
        assert_eq!(conflict.client_side_timestamp, SyncTimestamp::new(1));

        let file = fx.store.get_file("/r/f").await.unwrap().unwrap();
        assert_eq!(file.latest_sync_timestamp, SyncTimestamp::new(2));
    }

    fn record(path: &str, hash: &str, ts: u64, live: bool, modified: u64) -> FileRecord {
        FileRecord {
            after_path: path.into(),
            root_dir: "/r".into(),
            latest_hash: hash.into(),
            latest_sync_timestamp: SyncTimestamp::new(ts),
            contents_existed: live,
            metadata: FileMetadata {
                modified,
                ..FileMetadata::default()
            },
        }
    }

    fn entry(path: &str, hash: &str, mod_time: u64) -> ScanEntry {
        ScanEntry {
            after_path: path.into(),
            hash: hash.into(),
            mod_time,
        }
    }

    #[test]
    fn classify_covers_every_case() {
        let files = vec![
            record("/r/same", "h", 1, true, 100),
            record("/r/client-newer", "s", 2, true, 100),
            record("/r/server-newer", "s", 3, true, 300),
            record("/r/server-only", "s", 4, true, 100),
            record("/r/removed", "", 5, false, 100),
        ];
        let entries = vec![
            entry("/r/same", "h", 50),
            entry("/r/client-newer", "c", 200),
            entry("/r/server-newer", "c", 200),
            entry("/r/client-only", "c", 10),
        ];

        let results = classify("/r", &entries, &files).unwrap();
        let actions: Vec<_> = results
            .iter()
            .map(|r| (r.after_path.as_str(), r.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("/r/client-newer", ScanAction::PleaseSync),
                ("/r/client-only", ScanAction::PleaseSync),
                ("/r/same", ScanAction::UpToDate),
                ("/r/server-newer", ScanAction::MustSync),
                ("/r/server-only", ScanAction::MustSync),
            ]
        );
    }

    #[test]
    fn classify_rejects_paths_outside_root() {
        let err = classify("/r", &[entry("/rx/f", "h", 0)], &[]).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn full_scan_requires_binding() {
        let fx = fixture().await;
        fx.engine.please_sync(push("a", "/r/f", 0, b"v1")).await.unwrap();

        let report = fx
            .engine
            .full_scan(&FullScan {
                uuid: ClientUuid::from("b"),
                root_dir: "/r".into(),
                entries: vec![],
            })
            .await
            .unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].action, ScanAction::MustSync);

        let err = fx
            .engine
            .full_scan(&FullScan {
                uuid: ClientUuid::from("b"),
                root_dir: "/other".into(),
                entries: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn accepted_pushes_strictly_increase_timestamp(
            contents in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..32),
                1..8,
            )
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let fx = fixture().await;
                let mut last = SyncTimestamp::zero();
                for bytes in &contents {
                    let (ack, _) = fx
                        .engine
                        .please_sync(push("a", "/r/f", last.value(), bytes))
                        .await
                        .unwrap();
                    assert!(!ack.conflict);
                    assert!(ack.latest_sync_timestamp > last);
                    last = ack.latest_sync_timestamp;
                }
            });
        }
    }
}
