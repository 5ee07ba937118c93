//! Registration manager: clients, root directories and their passwords.
//!
//! Owns the `Client` and `RootDirectory` entities, checks the server and
//! root directory passwords, and binds client uuids to live connections.

use crate::error::{StorageError, SyncError, SyncResult};
use crate::locks::KeyedLocks;
use crate::model::{validate_path, Client, FileRecord, RootBinding, RootDirectory};
use crate::peer::PeerHandle;
use crate::registry::ConnectionRegistry;
use crate::storage::VersionedStore;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::sync::Arc;
use sync_types::{ClientUuid, RegisterRootDir, SyncRootDir};

/// Sequence issuing `Client::sequential_id`.
pub const CLIENT_SEQUENCE: &str = "client";

const MAX_UUID_LEN: usize = 128;

/// Argon2id hashing of root directory passwords into PHC strings.
#[derive(Debug, Clone)]
pub struct RootPasswordHasher {
    params: Params,
}

impl Default for RootPasswordHasher {
    fn default() -> Self {
        Self {
            params: Params::DEFAULT,
        }
    }
}

impl RootPasswordHasher {
    /// Hasher with explicit Argon2 parameters.
    pub fn with_params(params: Params) -> Self {
        Self { params }
    }

    /// Hash a password with a fresh random salt.
    pub async fn hash(&self, password: &str) -> Result<String, StorageError> {
        let params = self.params.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let mut salt = [0u8; 16];
            getrandom::getrandom(&mut salt)
                .map_err(|e| StorageError::PasswordHash(e.to_string()))?;
            let salt = SaltString::encode_b64(&salt)
                .map_err(|e| StorageError::PasswordHash(e.to_string()))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| StorageError::PasswordHash(e.to_string()))
        })
        .await
        .map_err(|e| StorageError::PasswordHash(e.to_string()))?
    }

    /// Check a password against a stored PHC string.
    pub async fn verify(&self, password: &str, phc: &str) -> Result<bool, StorageError> {
        let password = password.to_string();
        let phc = phc.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed =
                PasswordHash::new(&phc).map_err(|e| StorageError::PasswordHash(e.to_string()))?;
            match Argon2::default().verify_password(password.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(argon2::password_hash::Error::Password) => Ok(false),
                Err(e) => Err(StorageError::PasswordHash(e.to_string())),
            }
        })
        .await
        .map_err(|e| StorageError::PasswordHash(e.to_string()))?
    }
}

/// Reject uuids that cannot safely name keys and conflict copies.
pub fn validate_uuid(uuid: &ClientUuid) -> SyncResult<()> {
    let value = uuid.as_str();
    if value.is_empty() {
        return Err(SyncError::Validation("client uuid is empty".to_string()));
    }
    if value.len() > MAX_UUID_LEN {
        return Err(SyncError::Validation(format!(
            "client uuid longer than {MAX_UUID_LEN} bytes"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(SyncError::Validation(format!(
            "client uuid {value:?} may only contain ASCII letters, digits and '-'"
        )));
    }
    Ok(())
}

fn check_path(path: &str) -> SyncResult<()> {
    validate_path(path).map_err(SyncError::Validation)
}

/// The registration manager.
pub struct Registrar {
    store: VersionedStore,
    registry: Arc<ConnectionRegistry>,
    locks: Arc<KeyedLocks>,
    server_password: String,
    hasher: RootPasswordHasher,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("registry", &self.registry)
            .field("server_password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Registrar {
    /// Create a registration manager.
    pub fn new(
        store: VersionedStore,
        registry: Arc<ConnectionRegistry>,
        locks: Arc<KeyedLocks>,
        server_password: String,
        hasher: RootPasswordHasher,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            server_password,
            hasher,
        }
    }

    /// The store this manager writes to.
    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// The uuid to connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Keyed locks shared with the engine.
    pub fn locks(&self) -> &Arc<KeyedLocks> {
        &self.locks
    }

    /// Register (or reconnect) a client and bind it to `peer`.
    pub async fn register_client(
        &self,
        uuid: &ClientUuid,
        password: &str,
        peer: PeerHandle,
    ) -> SyncResult<Client> {
        validate_uuid(uuid)?;

        // blake3::Hash compares in constant time.
        if blake3::hash(password.as_bytes()) != blake3::hash(self.server_password.as_bytes()) {
            return Err(SyncError::Authentication(format!(
                "bad server password for client {uuid}"
            )));
        }

        let address = peer.remote();
        let client = {
            let _guard = self.locks.client(uuid).await;
            match self.store.get_client(uuid).await? {
                Some(mut existing) => {
                    if existing.address != address {
                        existing.address = address;
                        self.store.put_client(&existing).await?;
                    }
                    tracing::debug!("Client {} reconnected", uuid);
                    existing
                }
                None => {
                    let sequential_id = self.store.next_id(CLIENT_SEQUENCE).await?;
                    let client = Client {
                        uuid: uuid.clone(),
                        sequential_id,
                        address,
                        roots: Vec::new(),
                    };
                    if self.store.create_client(&client).await? {
                        tracing::info!("Registered client {} (id {})", uuid, sequential_id);
                        client
                    } else {
                        // Another writer created it first; the issued id stays burned.
                        self.require_client(uuid).await?
                    }
                }
            }
        };

        self.registry.bind(uuid.clone(), peer);
        Ok(client)
    }

    /// Create or update a root directory owned by the requesting client.
    pub async fn register_root_dir(&self, req: &RegisterRootDir) -> SyncResult<()> {
        check_path(&req.after_path)?;
        if req.before_path.is_empty() {
            return Err(SyncError::Validation("beforePath is empty".to_string()));
        }
        self.require_client(&req.uuid).await?;

        {
            let _guard = self.locks.root(&req.after_path).await;
            match self.store.get_root_dir(&req.after_path).await? {
                Some(existing) if existing.owner != req.uuid => {
                    if !self
                        .root_password_matches(&req.after_path, &req.root_dir_password)
                        .await?
                    {
                        return Err(SyncError::Validation(format!(
                            "root directory {} is owned by another client",
                            req.after_path
                        )));
                    }
                    tracing::debug!(
                        "Client {} re-registered foreign root {} with its password",
                        req.uuid,
                        req.after_path
                    );
                }
                existing => {
                    let hash = self.hasher.hash(&req.root_dir_password).await?;
                    self.store
                        .put_password_hash(&req.after_path, &hash)
                        .await?;
                    self.store
                        .put_root_dir(&RootDirectory {
                            before_path: req.before_path.clone(),
                            after_path: req.after_path.clone(),
                            owner: req.uuid.clone(),
                        })
                        .await?;
                    tracing::info!(
                        "{} root directory {} for {}",
                        if existing.is_some() { "Updated" } else { "Registered" },
                        req.after_path,
                        req.uuid
                    );
                }
            }
        }

        self.bind_root(&req.uuid, &req.after_path, &req.before_path)
            .await
    }

    /// Join a root directory registered by another client.
    pub async fn sync_root_dir(&self, req: &SyncRootDir) -> SyncResult<()> {
        check_path(&req.after_path)?;
        if req.before_path.is_empty() {
            return Err(SyncError::Validation("beforePath is empty".to_string()));
        }
        self.require_client(&req.uuid).await?;

        if self.store.get_root_dir(&req.after_path).await?.is_none() {
            return Err(SyncError::NotFound(format!(
                "root directory {}",
                req.after_path
            )));
        }
        if !self
            .root_password_matches(&req.after_path, &req.root_dir_password)
            .await?
        {
            return Err(SyncError::Authentication(format!(
                "bad password for root directory {}",
                req.after_path
            )));
        }

        self.bind_root(&req.uuid, &req.after_path, &req.before_path)
            .await?;
        tracing::info!("Client {} joined root directory {}", req.uuid, req.after_path);
        Ok(())
    }

    async fn root_password_matches(&self, root: &str, password: &str) -> SyncResult<bool> {
        match self.store.get_password_hash(root).await? {
            Some(phc) => Ok(self.hasher.verify(password, &phc).await?),
            None => Ok(false),
        }
    }

    async fn bind_root(&self, uuid: &ClientUuid, root: &str, before_path: &str) -> SyncResult<()> {
        let _guard = self.locks.client(uuid).await;
        let mut client = self.require_client(uuid).await?;
        if client.bind_root(root, before_path) {
            self.store.put_client(&client).await?;
        }
        Ok(())
    }

    /// Root directories a client owns or joined.
    pub async fn root_dirs(&self, uuid: &ClientUuid) -> SyncResult<Vec<String>> {
        let client = self.require_client(uuid).await?;
        Ok(client.roots.into_iter().map(|b| b.after_path).collect())
    }

    /// Remove a client record and its binding. Its roots and files stay.
    pub async fn disconnect(&self, uuid: &ClientUuid) -> SyncResult<()> {
        {
            let _guard = self.locks.client(uuid).await;
            if !self.store.delete_client(uuid).await? {
                return Err(SyncError::NotFound(format!("client {uuid}")));
            }
        }
        self.registry.unbind(uuid);
        tracing::info!("Client {} disconnected and removed", uuid);
        Ok(())
    }

    /// The client record, or `NotFound`.
    pub async fn require_client(&self, uuid: &ClientUuid) -> SyncResult<Client> {
        self.store
            .get_client(uuid)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("client {uuid}")))
    }

    /// Find the root directory `after_path` belongs to for this client.
    ///
    /// Picks the longest bound root containing the path. Fails `NotFound` if
    /// no registered root contains it and `Authentication` if one does but
    /// the client is not bound to it.
    pub async fn resolve_root(
        &self,
        uuid: &ClientUuid,
        after_path: &str,
    ) -> SyncResult<(Client, RootBinding)> {
        check_path(after_path)?;
        let client = self.require_client(uuid).await?;

        match client.owning_root(after_path).cloned() {
            Some(binding) => {
                if self.store.get_root_dir(&binding.after_path).await?.is_none() {
                    return Err(SyncError::NotFound(format!(
                        "root directory {}",
                        binding.after_path
                    )));
                }
                Ok((client, binding))
            }
            None => match self.registered_ancestor(after_path).await? {
                Some(root) => Err(SyncError::Authentication(format!(
                    "client {uuid} is not subscribed to root directory {root}"
                ))),
                None => Err(SyncError::NotFound(format!(
                    "no root directory contains {after_path}"
                ))),
            },
        }
    }

    /// The client's binding for exactly `root`.
    pub async fn require_binding(
        &self,
        uuid: &ClientUuid,
        root: &str,
    ) -> SyncResult<(Client, RootBinding)> {
        check_path(root)?;
        let client = self.require_client(uuid).await?;
        let exists = self.store.get_root_dir(root).await?.is_some();

        match client.binding(root).cloned() {
            Some(binding) if exists => Ok((client, binding)),
            _ if !exists => Err(SyncError::NotFound(format!("root directory {root}"))),
            _ => Err(SyncError::Authentication(format!(
                "client {uuid} is not subscribed to root directory {root}"
            ))),
        }
    }

    async fn registered_ancestor(&self, after_path: &str) -> SyncResult<Option<String>> {
        for (idx, _) in after_path.match_indices('/').skip(1) {
            let candidate = &after_path[..idx];
            if self.store.get_root_dir(candidate).await?.is_some() {
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(None)
    }

    /// Every client bound to `root`, with its local path of the root.
    pub async fn subscribers(&self, root: &str) -> SyncResult<Vec<(ClientUuid, String)>> {
        Ok(self
            .store
            .list_clients()
            .await?
            .into_iter()
            .filter_map(|client| {
                let before = client.binding(root)?.before_path.clone();
                Some((client.uuid, before))
            })
            .collect())
    }

    /// Every client record.
    pub async fn list_clients(&self) -> SyncResult<Vec<Client>> {
        Ok(self.store.list_clients().await?)
    }

    /// Every root directory.
    pub async fn list_root_dirs(&self) -> SyncResult<Vec<RootDirectory>> {
        Ok(self.store.list_root_dirs().await?)
    }

    /// File records of one root directory.
    pub async fn list_files(&self, root: &str) -> SyncResult<Vec<FileRecord>> {
        check_path(root)?;
        if self.store.get_root_dir(root).await?.is_none() {
            return Err(SyncError::NotFound(format!("root directory {root}")));
        }
        Ok(self.store.list_files(root).await?)
    }

    /// Delete a root directory with its files, conflicts and latest bytes.
    ///
    /// History snapshots are retained.
    pub async fn remove_root_dir(&self, root: &str) -> SyncResult<()> {
        check_path(root)?;
        {
            let _guard = self.locks.root(root).await;
            if !self.store.delete_root_dir(root).await? {
                return Err(SyncError::NotFound(format!("root directory {root}")));
            }
            self.store.delete_password_hash(root).await?;

            for file in self.store.list_files(root).await? {
                let _path_guard = self.locks.path(&file.after_path).await;
                self.store.delete_file(&file.after_path).await?;
                self.store.delete_conflict(&file.after_path).await?;
            }
            self.store.area().remove_root(root).await?;
        }

        for client in self.store.list_clients().await? {
            if client.binding(root).is_none() {
                continue;
            }
            let _guard = self.locks.client(&client.uuid).await;
            if let Some(mut fresh) = self.store.get_client(&client.uuid).await? {
                fresh.roots.retain(|b| b.after_path != root);
                self.store.put_client(&fresh).await?;
            }
        }

        tracing::info!("Removed root directory {}", root);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peer::mock::MockPeer;
    use crate::peer::PeerConnection;
    use crate::storage::test_store;
    use sync_types::FileMetadata;

    pub(crate) fn fast_hasher() -> RootPasswordHasher {
        RootPasswordHasher::with_params(Params::new(1024, 1, 1, None).unwrap())
    }

    pub(crate) async fn registrar() -> (tempfile::TempDir, Arc<ConnectionRegistry>, Registrar) {
        let (dir, store) = test_store().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let registrar = Registrar::new(
            store,
            registry.clone(),
            Arc::new(KeyedLocks::new()),
            "server-pw".to_string(),
            fast_hasher(),
        );
        (dir, registry, registrar)
    }

    fn root_req(uuid: &str, pw: &str, after: &str) -> RegisterRootDir {
        RegisterRootDir {
            uuid: ClientUuid::from(uuid),
            root_dir_password: pw.into(),
            before_path: format!("/home/{uuid}{after}"),
            after_path: after.into(),
        }
    }

    fn join_req(uuid: &str, pw: &str, after: &str) -> SyncRootDir {
        SyncRootDir {
            uuid: ClientUuid::from(uuid),
            root_dir_password: pw.into(),
            before_path: format!("/home/{uuid}{after}"),
            after_path: after.into(),
        }
    }

    #[tokio::test]
    async fn password_hash_round_trip() {
        let hasher = fast_hasher();
        let phc = hasher.hash("secret").await.unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(hasher.verify("secret", &phc).await.unwrap());
        assert!(!hasher.verify("wrong", &phc).await.unwrap());
        assert!(hasher.verify("secret", "not a phc").await.is_err());
    }

    #[test]
    fn uuid_validation() {
        assert!(validate_uuid(&ClientUuid::from("3f2a9c1e-0b7d-4e55-9a61-7c2d8e4f1a90")).is_ok());
        assert!(validate_uuid(&ClientUuid::from("")).is_err());
        assert!(validate_uuid(&ClientUuid::from("a/b")).is_err());
        assert!(validate_uuid(&ClientUuid::from("a_b")).is_err());
        assert!(validate_uuid(&ClientUuid::new("x".repeat(129))).is_err());
    }

    #[tokio::test]
    async fn wrong_server_password_is_rejected() {
        let (_dir, registry, registrar) = registrar().await;
        let err = registrar
            .register_client(&ClientUuid::from("a"), "nope", MockPeer::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reconnect_keeps_sequential_id() {
        let (_dir, registry, registrar) = registrar().await;
        let a = ClientUuid::from("a");

        let first = registrar
            .register_client(&a, "server-pw", MockPeer::new("a"))
            .await
            .unwrap();
        let second_peer = MockPeer::new("a");
        let second_id = second_peer.id();
        let again = registrar
            .register_client(&a, "server-pw", second_peer)
            .await
            .unwrap();
        let b = registrar
            .register_client(&ClientUuid::from("b"), "server-pw", MockPeer::new("b"))
            .await
            .unwrap();

        assert_eq!(first.sequential_id, 1);
        assert_eq!(again.sequential_id, 1);
        assert_eq!(b.sequential_id, 2);
        assert_eq!(registry.lookup(&a).unwrap().id(), second_id);
    }

    #[tokio::test]
    async fn root_dir_requires_known_client_and_valid_path() {
        let (_dir, _registry, registrar) = registrar().await;

        let err = registrar
            .register_root_dir(&root_req("a", "pw", "/r"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        registrar
            .register_client(&ClientUuid::from("a"), "server-pw", MockPeer::new("a"))
            .await
            .unwrap();
        let err = registrar
            .register_root_dir(&root_req("a", "pw", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_root_with_other_password_is_rejected() {
        let (_dir, _registry, registrar) = registrar().await;
        for uuid in ["a", "b"] {
            registrar
                .register_client(&ClientUuid::from(uuid), "server-pw", MockPeer::new(uuid))
                .await
                .unwrap();
        }

        registrar.register_root_dir(&root_req("a", "pw", "/r")).await.unwrap();
        let err = registrar
            .register_root_dir(&root_req("b", "other", "/r"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        registrar.register_root_dir(&root_req("b", "pw", "/r")).await.unwrap();
        let root = registrar.store.get_root_dir("/r").await.unwrap().unwrap();
        assert_eq!(root.owner, ClientUuid::from("a"));
        assert_eq!(
            registrar.root_dirs(&ClientUuid::from("b")).await.unwrap(),
            vec!["/r"]
        );
    }

    #[tokio::test]
    async fn join_checks_root_password() {
        let (_dir, _registry, registrar) = registrar().await;
        for uuid in ["a", "b"] {
            registrar
                .register_client(&ClientUuid::from(uuid), "server-pw", MockPeer::new(uuid))
                .await
                .unwrap();
        }
        registrar.register_root_dir(&root_req("a", "pw", "/r")).await.unwrap();

        let err = registrar.sync_root_dir(&join_req("b", "bad", "/r")).await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        let err = registrar.sync_root_dir(&join_req("b", "pw", "/s")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        registrar.sync_root_dir(&join_req("b", "pw", "/r")).await.unwrap();
        let subs = registrar.subscribers("/r").await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1], (ClientUuid::from("b"), "/home/b/r".to_string()));
    }

    #[tokio::test]
    async fn resolve_root_distinguishes_unknown_and_unsubscribed() {
        let (_dir, _registry, registrar) = registrar().await;
        for uuid in ["a", "b"] {
            registrar
                .register_client(&ClientUuid::from(uuid), "server-pw", MockPeer::new(uuid))
                .await
                .unwrap();
        }
        registrar.register_root_dir(&root_req("a", "pw", "/r")).await.unwrap();

        let (_, binding) = registrar
            .resolve_root(&ClientUuid::from("a"), "/r/docs/f")
            .await
            .unwrap();
        assert_eq!(binding.after_path, "/r");

        let err = registrar
            .resolve_root(&ClientUuid::from("b"), "/r/f")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));

        let err = registrar
            .resolve_root(&ClientUuid::from("a"), "/rx/f")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err = registrar
            .resolve_root(&ClientUuid::from("a"), "/r/../etc")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn disconnect_removes_record_and_binding() {
        let (_dir, registry, registrar) = registrar().await;
        let a = ClientUuid::from("a");
        registrar
            .register_client(&a, "server-pw", MockPeer::new("a"))
            .await
            .unwrap();
        registrar.register_root_dir(&root_req("a", "pw", "/r")).await.unwrap();

        registrar.disconnect(&a).await.unwrap();

        assert!(registry.lookup(&a).is_err());
        assert!(matches!(
            registrar.require_client(&a).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(registrar.store.get_root_dir("/r").await.unwrap().is_some());
        assert!(matches!(
            registrar.disconnect(&a).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_root_dir_drops_files_and_bindings() {
        let (_dir, _registry, registrar) = registrar().await;
        let a = ClientUuid::from("a");
        registrar
            .register_client(&a, "server-pw", MockPeer::new("a"))
            .await
            .unwrap();
        registrar.register_root_dir(&root_req("a", "pw", "/r")).await.unwrap();
        registrar
            .store
            .put_file(&FileRecord {
                after_path: "/r/f".into(),
                root_dir: "/r".into(),
                latest_hash: "h".into(),
                latest_sync_timestamp: sync_types::SyncTimestamp::new(1),
                contents_existed: true,
                metadata: FileMetadata::default(),
            })
            .await
            .unwrap();

        registrar.remove_root_dir("/r").await.unwrap();

        assert!(registrar.store.get_file("/r/f").await.unwrap().is_none());
        assert!(registrar.store.get_password_hash("/r").await.unwrap().is_none());
        assert!(registrar.root_dirs(&a).await.unwrap().is_empty());
        assert!(matches!(
            registrar.remove_root_dir("/r").await,
            Err(SyncError::NotFound(_))
        ));
    }
}
