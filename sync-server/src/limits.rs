//! Rate limiting for rootsync-server.
//!
//! Connections are limited per remote endpoint id, since iroh connections may
//! arrive through relays and carry no stable IP. Transactions are limited per
//! registered client uuid, and a direct limiter caps the whole server.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use sync_types::ClientUuid;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters shared by every session.
#[derive(Clone)]
pub struct RateLimits {
    /// Connection attempts per endpoint id (`limits.connections_per_minute`).
    connection_limiter: Arc<KeyedLimiter<[u8; 32]>>,
    /// Transactions per client uuid (`limits.messages_per_minute`).
    transaction_limiter: Arc<KeyedLimiter<ClientUuid>>,
    /// Transactions across all clients (`limits.global_requests_per_second`).
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("transaction_keys", &self.transaction_limiter.len())
            .finish()
    }
}

// Config::validate rejects zero rates; MIN only guards a bypassed validation.
fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(non_zero(config.connections_per_minute));
        let transaction_quota = Quota::per_minute(non_zero(config.messages_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            transaction_limiter: Arc::new(RateLimiter::keyed(transaction_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check a connection attempt from an endpoint.
    pub fn check_connection(&self, endpoint_id: &[u8; 32]) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(endpoint_id)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check one transaction from a registered client, then the global cap.
    pub fn check_transaction(&self, uuid: &ClientUuid) -> Result<(), RateLimitError> {
        self.transaction_limiter
            .check_key(uuid)
            .map_err(|_| RateLimitError::TransactionLimitExceeded)?;
        self.check_global()
    }

    /// Check the server-wide request rate.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked endpoint keys.
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Number of tracked client keys.
    pub fn transaction_keys_count(&self) -> usize {
        self.transaction_limiter.len()
    }

    /// Evict keys whose cells have fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.transaction_limiter.retain_recent();
    }
}

/// Which limit rejected a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this endpoint.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many transactions from this client.
    #[error("transaction rate limit exceeded")]
    TransactionLimitExceeded,
    /// Too many transactions across all clients.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
