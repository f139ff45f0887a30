//! Integration tests for the cart engine.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p cart-integration-tests
//! ```
//!
//! Every test runs against in-process backends: [`MemoryStore`] for carts
//! and catalog, [`MemoryBackend`] for locks and cache.
//!
//! # Test Categories
//!
//! - `service_flows` - add, update, remove, read, checkout, merge
//! - `sync_scenarios` - reconciliation and auto-fix against catalog changes
//! - `concurrency` - lock serialization and optimistic retries
//! - `pricing_scenarios` - end-to-end totals through the service

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use cart_core::{
    CartId, CartItemId, CatalogStatus, Money, ProductId, SessionToken, SkuId, UserId,
};
use cart_engine::catalog::Catalog;
use cart_engine::db::{CartRepository, MemoryStore, RepositoryError};
use cart_engine::kv::MemoryBackend;
use cart_engine::lock::LockPolicy;
use cart_engine::models::{Cart, CartItem, CartOwner, Identity, NewCartItem, ProductInfo, SkuInfo};
use cart_engine::occ::{FieldUpdates, RetryPolicy, RowRef, RowSnapshot, VersionedStore, VersionedTx};
use cart_engine::{Backends, CartEngine, CartService, EngineSettings};

/// Settings with generous lock and retry budgets so contention in tests
/// resolves by waiting rather than failing.
#[must_use]
pub fn test_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.lock = LockPolicy {
        ttl: Duration::from_secs(10),
        attempts: 400,
        retry_delay: Duration::from_millis(5),
    };
    settings.retry = RetryPolicy {
        max_retries: 20,
        base_delay: Duration::from_millis(1),
        backoff_factor: 1.0,
    };
    settings
}

#[must_use]
pub fn user(id: i64) -> Identity {
    Identity::user(UserId::new(id))
}

/// # Panics
///
/// Panics if `token` is not a valid session token.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn guest(token: &str) -> Identity {
    Identity::guest(SessionToken::parse(token).unwrap())
}

/// An active product weighing half a kilogram.
#[must_use]
pub fn product_info(id: i64, price_cents: i64, stock: u32) -> ProductInfo {
    let id = ProductId::new(id);
    ProductInfo {
        id,
        name: format!("Product {id}"),
        image: Some(format!("/img/{id}.jpg")),
        status: CatalogStatus::Active,
        price: Money::from_cents(price_cents),
        stock,
        weight: Decimal::new(5, 1),
        version: 1,
    }
}

/// Engine over a fresh in-memory store.
pub struct TestContext {
    pub store: MemoryStore,
    pub kv: MemoryBackend,
    pub engine: CartEngine,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    #[must_use]
    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = MemoryStore::new();
        let kv = MemoryBackend::default();
        let engine = CartEngine::in_memory(&store, kv.clone(), settings);
        Self { store, kv, engine }
    }

    #[must_use]
    pub fn service(&self) -> &CartService {
        self.engine.service()
    }

    /// Seed an active product without variants.
    pub async fn product(&self, id: i64, price_cents: i64, stock: u32) -> ProductId {
        let product = product_info(id, price_cents, stock);
        let id = product.id;
        self.store.put_product(product).await;
        id
    }

    /// Seed an active SKU of `product_id`.
    pub async fn sku(&self, id: i64, product_id: ProductId, price_cents: i64, stock: u32) -> SkuId {
        let id = SkuId::new(id);
        self.store
            .put_sku(SkuInfo {
                id,
                product_id,
                status: CatalogStatus::Active,
                price: Money::from_cents(price_cents),
                stock,
                attributes: [("color".to_owned(), "red".to_owned())].into(),
                image: None,
                version: 1,
            })
            .await;
        id
    }

    /// The owner's active cart straight from the store.
    ///
    /// # Panics
    ///
    /// Panics if the identity is empty or the store fails.
    #[allow(clippy::unwrap_used)]
    pub async fn cart(&self, identity: &Identity) -> Option<Cart> {
        self.store
            .find_active_cart(&identity.resolve().unwrap())
            .await
            .unwrap()
    }

    /// The owner's lines straight from the store.
    ///
    /// # Panics
    ///
    /// Panics if the owner has no cart.
    #[allow(clippy::unwrap_used)]
    pub async fn items(&self, identity: &Identity) -> Vec<CartItem> {
        let cart = self.cart(identity).await.unwrap();
        self.store.list_items(cart.id).await.unwrap()
    }
}

// =============================================================================
// Probe store
// =============================================================================

/// Store wrapper that records how many writes overlap in time.
///
/// Every write sleeps for `delay` while counted as in flight, which widens
/// the window in which unserialized writers would be seen together.
#[derive(Clone)]
pub struct ProbeStore {
    inner: MemoryStore,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl ProbeStore {
    #[must_use]
    pub fn new(inner: MemoryStore, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Highest number of writes seen in flight at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Writes observed so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Service wired over this probe.
    #[must_use]
    pub fn engine(&self, settings: EngineSettings) -> CartEngine {
        CartEngine::with_backends(
            Backends {
                carts: Arc::new(self.clone()),
                rows: Arc::new(self.clone()),
                catalog: Arc::new(self.clone()),
                kv: Arc::new(MemoryBackend::default()),
            },
            settings,
        )
    }

    async fn probe<T>(&self, write: impl Future<Output = T> + Send) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let out = write.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl CartRepository for ProbeStore {
    async fn find_active_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError> {
        self.inner.find_active_cart(owner).await
    }

    async fn create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError> {
        self.probe(self.inner.create_cart(owner)).await
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        self.inner.get_cart(id).await
    }

    async fn list_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, RepositoryError> {
        self.inner.list_items(cart_id).await
    }

    async fn get_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Option<CartItem>, RepositoryError> {
        self.inner.get_item(cart_id, item_id).await
    }

    async fn find_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        sku_id: Option<SkuId>,
    ) -> Result<Option<CartItem>, RepositoryError> {
        self.inner.find_item(cart_id, product_id, sku_id).await
    }

    async fn insert_item(&self, item: NewCartItem) -> Result<CartItem, RepositoryError> {
        self.probe(self.inner.insert_item(item)).await
    }

    async fn delete_items(
        &self,
        cart_id: CartId,
        item_ids: &[CartItemId],
    ) -> Result<u64, RepositoryError> {
        self.probe(self.inner.delete_items(cart_id, item_ids)).await
    }

    async fn delete_all_items(&self, cart_id: CartId) -> Result<u64, RepositoryError> {
        self.probe(self.inner.delete_all_items(cart_id)).await
    }

    async fn list_active_carts(
        &self,
        after: Option<CartId>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        self.inner.list_active_carts(after, limit).await
    }

    async fn list_idle_guest_carts(
        &self,
        idle_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        self.inner.list_idle_guest_carts(idle_since, limit).await
    }
}

#[async_trait]
impl VersionedStore for ProbeStore {
    async fn read_row(&self, row: RowRef) -> Result<Option<RowSnapshot>, RepositoryError> {
        VersionedStore::read_row(&self.inner, row).await
    }

    async fn write_if_version(
        &self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        self.probe(VersionedStore::write_if_version(
            &self.inner,
            row,
            expected_version,
            updates,
        ))
        .await
    }

    async fn begin(&self) -> Result<Box<dyn VersionedTx>, RepositoryError> {
        self.inner.begin().await
    }
}

#[async_trait]
impl Catalog for ProbeStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<ProductInfo>, RepositoryError> {
        self.inner.get_product(id).await
    }

    async fn get_sku(&self, id: SkuId) -> Result<Option<SkuInfo>, RepositoryError> {
        self.inner.get_sku(id).await
    }
}
