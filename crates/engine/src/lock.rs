//! Per-cart mutual exclusion across engine instances.
//!
//! A lock is a key holding a random token with a short TTL. Acquire is a
//! set-if-absent; release deletes the key only while it still holds our
//! token, so a holder whose TTL lapsed cannot free a lock that was since
//! handed to someone else.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{CartError, Result};
use crate::kv::{BackendError, KeyValueBackend};
use crate::models::CartOwner;

/// Opaque proof of lock ownership.
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// A fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockToken").field(&"[REDACTED]").finish()
    }
}

/// Acquire/release capability over a shared store.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try once to take `key` for `ttl`. `None` if someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> std::result::Result<Option<LockToken>, BackendError>;

    /// Release `key` if it is still held with `token`.
    ///
    /// Returns `false` when the lock had already expired or changed hands.
    async fn release(&self, key: &str, token: &LockToken) -> std::result::Result<bool, BackendError>;
}

/// [`LockManager`] over any [`KeyValueBackend`].
#[derive(Clone)]
pub struct KvLockManager {
    backend: Arc<dyn KeyValueBackend>,
}

impl KvLockManager {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LockManager for KvLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> std::result::Result<Option<LockToken>, BackendError> {
        let token = LockToken::generate();
        let acquired = self.backend.set_if_absent(key, token.as_str(), ttl).await?;
        Ok(acquired.then_some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> std::result::Result<bool, BackendError> {
        self.backend.compare_and_delete(key, token.as_str()).await
    }
}

/// Prefix shared by every cart lock key.
pub const LOCK_PREFIX: &str = "lock:cart:";

/// Lock key for an owner's cart.
#[must_use]
pub fn lock_key(owner: &CartOwner) -> String {
    format!("{LOCK_PREFIX}{}", owner.key())
}

/// How hard to try for a lock before reporting `LockBusy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Safety expiry for a crashed holder.
    pub ttl: Duration,
    /// Total acquisition attempts.
    pub attempts: u32,
    /// Base pause between attempts; up to the same amount of jitter is added.
    pub retry_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            attempts: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl LockPolicy {
    fn pause(&self) -> Duration {
        let base = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=base);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Bounded acquisition of cart locks.
#[derive(Clone)]
pub struct CartLocks {
    manager: Arc<dyn LockManager>,
    policy: LockPolicy,
}

impl CartLocks {
    #[must_use]
    pub fn new(manager: Arc<dyn LockManager>, policy: LockPolicy) -> Self {
        Self { manager, policy }
    }

    #[must_use]
    pub const fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Take the owner's cart lock, retrying briefly.
    ///
    /// # Errors
    ///
    /// `LockBusy` once every attempt found the lock held, `Backend` if the
    /// store failed.
    pub async fn lock(&self, owner: &CartOwner) -> Result<HeldLock> {
        let key = lock_key(owner);
        let attempts = self.policy.attempts.max(1);

        for attempt in 0..attempts {
            if let Some(token) = self.manager.acquire(&key, self.policy.ttl).await? {
                debug!(key = %key, attempt, "Cart lock acquired");
                return Ok(HeldLock {
                    manager: Arc::clone(&self.manager),
                    key,
                    token: Some(token),
                });
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.pause()).await;
            }
        }

        warn!(key = %key, attempts, "Cart lock busy");
        Err(CartError::LockBusy(owner.to_string()))
    }

    /// Take the lock once, without waiting. `None` if it is held.
    ///
    /// # Errors
    ///
    /// `Backend` if the store failed.
    pub async fn try_lock(&self, owner: &CartOwner) -> Result<Option<HeldLock>> {
        let key = lock_key(owner);
        let token = self.manager.acquire(&key, self.policy.ttl).await?;
        Ok(token.map(|token| HeldLock {
            manager: Arc::clone(&self.manager),
            key,
            token: Some(token),
        }))
    }
}

/// A held cart lock.
///
/// Call [`release`](Self::release) on every path. If the guard is dropped
/// while still held (a cancelled request, a panic), release is handed to a
/// background task; without a runtime the TTL is the only recovery.
pub struct HeldLock {
    manager: Arc<dyn LockManager>,
    key: String,
    token: Option<LockToken>,
}

impl HeldLock {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock.
    ///
    /// A lock that already expired is logged, not reported as an error.
    ///
    /// # Errors
    ///
    /// `Backend` if the store failed; the TTL then frees the key.
    pub async fn release(mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };
        if self.manager.release(&self.key, &token).await? {
            debug!(key = %self.key, "Cart lock released");
        } else {
            warn!(key = %self.key, "Cart lock expired before release");
        }
        Ok(())
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let manager = Arc::clone(&self.manager);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&key, &token).await {
                        error!(key = %key, error = %e, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => warn!(key = %key, "Lock dropped outside a runtime; left to expire"),
        }
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("key", &self.key)
            .field("held", &self.token.is_some())
            .finish_non_exhaustive()
    }
}
