//! Main SyncServer coordination.
//!
//! SyncServer owns the store handle and wires the registration manager,
//! sync engine, history satellite, connection registry and rate limiters
//! together. Everything is constructed once at startup and shared by `Arc`.

use crate::config::Config;
use crate::engine::SyncEngine;
use crate::error::ServerError;
use crate::history::History;
use crate::limits::RateLimits;
use crate::locks::KeyedLocks;
use crate::registration::{Registrar, RootPasswordHasher};
use crate::registry::ConnectionRegistry;
use crate::storage::{FileArea, SqliteStorage, VersionedStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Operational metrics for monitoring server activity.
///
/// Counters only increase (reset on restart). `active_connections` is a gauge.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Transactions answered, successful or not.
    pub transactions_total: AtomicU64,
    /// PLEASESYNC pushes committed.
    pub pushes_total: AtomicU64,
    /// Conflicts recorded.
    pub conflicts_total: AtomicU64,
    /// Conflicts resolved by CHOOSEONE.
    pub resolutions_total: AtomicU64,
    /// MUSTSYNC/FORCESYNC pushes acknowledged by their target.
    pub fanout_sent: AtomicU64,
    /// MUSTSYNC/FORCESYNC pushes that failed or timed out.
    pub fanout_failed: AtomicU64,
    /// Background RESCAN rounds completed per client root.
    pub rescans_total: AtomicU64,
    /// Connections accepted (before registration).
    pub connections_total: AtomicU64,
    /// Connections currently open.
    pub active_connections: AtomicU64,
    /// Frame bytes read from clients.
    pub bytes_received: AtomicU64,
    /// Frame bytes written to clients.
    pub bytes_sent: AtomicU64,
    /// Requests rejected by a rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Transactions answered with `Failed`.
    pub errors_total: AtomicU64,
}

/// Decrements `active_connections` when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    metrics: Arc<ServerMetrics>,
}

impl ServerMetrics {
    /// Count a new connection and return a guard for its lifetime.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Main sync server.
pub struct SyncServer {
    config: Config,
    store: VersionedStore,
    registrar: Arc<Registrar>,
    engine: SyncEngine,
    history: History,
    rate_limits: RateLimits,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("online_clients", &self.online_clients())
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Open the configured database and file areas and build the server.
    pub async fn open(config: Config) -> Result<Self, ServerError> {
        let kv = SqliteStorage::new(&config.storage.database).await?;
        let area = FileArea::new(&config.storage.files_dir);
        let store = VersionedStore::open(Arc::new(kv), area).await?;
        tracing::info!(
            "Opened store at {} with file areas under {}",
            config.storage.database.display(),
            config.storage.files_dir.display()
        );
        Ok(Self::new(config, store))
    }

    /// Build the server over an open store.
    pub fn new(config: Config, store: VersionedStore) -> Self {
        Self::with_hasher(config, store, RootPasswordHasher::default())
    }

    /// Build the server with explicit root password hashing parameters.
    pub fn with_hasher(config: Config, store: VersionedStore, hasher: RootPasswordHasher) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(ServerMetrics::default());

        let registrar = Arc::new(Registrar::new(
            store.clone(),
            registry,
            locks.clone(),
            config.server.password.clone(),
            hasher,
        ));
        let history = History::new(store.clone(), locks);
        let engine = SyncEngine::new(
            registrar.clone(),
            history.clone(),
            metrics.clone(),
            Duration::from_secs(config.limits.fanout_timeout_secs),
            config.storage.max_file_size as u64,
        );
        let rate_limits = RateLimits::new(&config.limits);

        Self {
            config,
            store,
            registrar,
            engine,
            history,
            rate_limits,
            metrics,
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the versioned store.
    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// Get the registration manager.
    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.registrar.registry()
    }

    /// Get the keyed locks.
    pub fn locks(&self) -> &Arc<KeyedLocks> {
        self.registrar.locks()
    }

    /// Get the sync engine.
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Get the history satellite.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Number of clients bound to a live connection.
    pub fn online_clients(&self) -> usize {
        self.registry().len()
    }
}
