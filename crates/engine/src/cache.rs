//! Disposable cache of cart views.
//!
//! Reads check the cache first and refill it after a miss.
//! Writes never update an entry, they delete it, so the next read rebuilds
//! from the store. Backend failures degrade to a miss; the store stays the
//! only source of truth.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::kv::KeyValueBackend;
use crate::lock::LOCK_PREFIX;
use crate::models::{Cart, CartItem, CartOwner};
use crate::pricing::CartSummary;

/// Prefix shared by every cached cart view.
pub const VIEW_PREFIX: &str = "cart:view:";

/// Cache key for an owner's cart view.
#[must_use]
pub fn view_key(owner: &CartOwner) -> String {
    format!("{VIEW_PREFIX}{}", owner.key())
}

/// Everything a cart read returns.
///
/// Cached whole, including non-`normal` lines; callers filter on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartView {
    /// `None` when the owner has no active cart yet.
    pub cart: Option<Cart>,
    pub items: Vec<CartItem>,
    pub summary: CartSummary,
}

impl CartView {
    /// Drop lines that are not `normal`. The summary still reports them.
    #[must_use]
    pub fn without_unavailable(mut self) -> Self {
        self.items.retain(|i| i.status.is_purchasable());
        self
    }
}

/// Retention per owner kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub guest: Duration,
    pub user: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            guest: Duration::from_secs(7 * 24 * 60 * 60),
            user: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheTtl {
    #[must_use]
    pub const fn for_owner(&self, owner: &CartOwner) -> Duration {
        if owner.is_guest() { self.guest } else { self.user }
    }
}

/// Operational counters. Not part of the consistency contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Cart locks currently held.
    pub lock_keys: u64,
    /// Cart views currently cached.
    pub cache_keys: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Read-through, invalidate-on-write cache of [`CartView`]s.
#[derive(Clone)]
pub struct CartCache {
    backend: Arc<dyn KeyValueBackend>,
    ttl: CacheTtl,
    counters: Arc<Counters>,
}

impl CartCache {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, ttl: CacheTtl) -> Self {
        Self {
            backend,
            ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cached view for `owner`, if any.
    pub async fn get(&self, owner: &CartOwner) -> Option<CartView> {
        let key = view_key(owner);
        let raw = match self.backend.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        };

        let view = raw.and_then(|json| match serde_json::from_str::<CartView>(&json) {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if view.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache miss");
        }
        view
    }

    /// Store a view.
    ///
    /// # Errors
    ///
    /// `Backend` if the write failed.
    pub async fn put(&self, owner: &CartOwner, view: &CartView) -> Result<()> {
        let json = serde_json::to_string(view).map_err(|e| {
            crate::kv::BackendError::Unavailable(format!("cannot encode cart view: {e}"))
        })?;
        self.backend
            .set(&view_key(owner), &json, self.ttl.for_owner(owner))
            .await?;
        Ok(())
    }

    /// Delete the owner's cached view.
    ///
    /// Called after a mutation has committed. A failure is logged; the entry
    /// then lives until its TTL.
    pub async fn invalidate(&self, owner: &CartOwner) {
        let key = view_key(owner);
        match self.backend.delete(&key).await {
            Ok(_) => debug!(key = %key, "Cache invalidated"),
            Err(e) => error!(key = %key, error = %e, "Cache invalidation failed"),
        }
    }

    /// Invalidation owed by a mutation of `owner` that is about to start.
    ///
    /// Create it once the cart lock is held and finish it with
    /// [`PendingInvalidation::complete`].
    #[must_use]
    pub fn pending_invalidation(&self, owner: &CartOwner) -> PendingInvalidation {
        PendingInvalidation {
            cache: self.clone(),
            owner: Some(owner.clone()),
        }
    }

    /// Key counts and hit/miss counters.
    ///
    /// # Errors
    ///
    /// `Backend` if the key scan failed.
    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            lock_keys: self.backend.count_prefix(LOCK_PREFIX).await?,
            cache_keys: self.backend.count_prefix(VIEW_PREFIX).await?,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        })
    }
}

/// Cache invalidation that runs even if the mutating call is cancelled.
///
/// A caller may drop a mutation future after some writes committed. The
/// guard then hands the invalidation to a background task, so the cached
/// view cannot outlive the change.
pub struct PendingInvalidation {
    cache: CartCache,
    owner: Option<CartOwner>,
}

impl PendingInvalidation {
    /// Invalidate now.
    pub async fn complete(mut self) {
        if let Some(owner) = &self.owner {
            self.cache.invalidate(owner).await;
        }
        self.owner = None;
    }
}

impl Drop for PendingInvalidation {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        let cache = self.cache.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cache.invalidate(&owner).await });
            }
            Err(_) => warn!(owner = %owner, "Cache invalidation dropped outside a runtime"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cart_core::{ItemStatus, SessionToken, UserId};

    use super::*;
    use crate::kv::MemoryBackend;
    use crate::models::cart::tests::item;
    use crate::pricing::{PricingOptions, PricingRules};

    fn view(items: Vec<CartItem>) -> CartView {
        let summary =
            CartSummary::build(&items, &PricingOptions::default(), &PricingRules::default())
                .unwrap();
        CartView {
            cart: None,
            items,
            summary,
        }
    }

    #[test]
    fn test_ttl_depends_on_owner_kind() {
        let ttl = CacheTtl::default();
        let guest = CartOwner::Session(SessionToken::parse("g1").unwrap());
        let user = CartOwner::User(UserId::new(1));
        assert!(ttl.for_owner(&guest) > ttl.for_owner(&user));
        assert_eq!(ttl.for_owner(&user), Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let cache = CartCache::new(Arc::new(MemoryBackend::default()), CacheTtl::default());
        let owner = CartOwner::User(UserId::new(1));
        let cached = view(vec![item(1, 1000, 1, ItemStatus::Normal)]);

        assert!(cache.get(&owner).await.is_none());
        cache.put(&owner, &cached).await.unwrap();
        assert_eq!(cache.get(&owner).await, Some(cached));

        cache.invalidate(&owner).await;
        assert!(cache.get(&owner).await.is_none());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.cache_keys, 0);
    }

    #[tokio::test]
    async fn test_put_overwrites_previous_view() {
        let cache = CartCache::new(Arc::new(MemoryBackend::default()), CacheTtl::default());
        let owner = CartOwner::User(UserId::new(2));

        cache.put(&owner, &view(Vec::new())).await.unwrap();
        let updated = view(vec![item(1, 500, 2, ItemStatus::Normal)]);
        cache.put(&owner, &updated).await.unwrap();

        assert_eq!(cache.get(&owner).await, Some(updated));
        assert_eq!(cache.stats().await.unwrap().cache_keys, 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let backend = MemoryBackend::default();
        let cache = CartCache::new(Arc::new(backend.clone()), CacheTtl::default());
        let owner = CartOwner::User(UserId::new(3));
        backend
            .set(&view_key(&owner), "not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get(&owner).await.is_none());
    }

    #[test]
    fn test_view_filters_unavailable_lines() {
        let filtered = view(vec![
            item(1, 1000, 1, ItemStatus::Normal),
            item(2, 1000, 1, ItemStatus::Invalid),
        ])
        .without_unavailable();
        assert_eq!(filtered.items.len(), 1);
        assert_eq!(filtered.summary.invalid_items.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_invalidation_still_runs() {
        let cache = CartCache::new(Arc::new(MemoryBackend::default()), CacheTtl::default());
        let owner = CartOwner::User(UserId::new(4));
        cache.put(&owner, &view(Vec::new())).await.unwrap();

        let finished = cache.pending_invalidation(&owner);
        finished.complete().await;
        assert!(cache.get(&owner).await.is_none());

        cache.put(&owner, &view(Vec::new())).await.unwrap();
        drop(cache.pending_invalidation(&owner));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&owner).await.is_none());
    }
}
