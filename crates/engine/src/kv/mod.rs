//! Key-value backend shared by cart locks and the cart view cache.
//!
//! Two implementations:
//!
//! - [`MemoryBackend`] - `moka` cache with per-entry TTL, for a single process
//! - `RedisBackend` (feature `redis`) - shared across engine instances
//!
//! Keys are plain strings. Locks live under `lock:cart:*`, cached views under
//! `cart:view:*`.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Errors raised by a key-value backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or refused the command.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Redis client error.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Minimal set of key-value primitives with expiry.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Store `value` under `key` only if the key is absent (or expired).
    ///
    /// Returns `true` if this call stored the value.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, BackendError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove `key` only while it still holds `expected`, atomically.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError>;

    /// Number of live keys starting with `prefix`.
    async fn count_prefix(&self, prefix: &str) -> Result<u64, BackendError>;
}
