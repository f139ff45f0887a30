//! Cart service: the public operation surface.
//!
//! Every mutating call runs as
//!
//! 1. take the owner's cart lock
//! 2. mutate the store (racy row writes through the optimistic controller)
//! 3. recompute the cart aggregates
//! 4. invalidate the cached view
//! 5. release the lock
//!
//! and the lock is released on every exit path. Reads never take the lock.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Span, info, instrument, warn};

use cart_core::{CartId, CartItemId, CartStatus, ItemStatus, ProductId, SessionToken, SkuId, UserId};

use crate::cache::{CacheStats, CartCache, CartView};
use crate::catalog::{Catalog, Inventory, StockLine, find_offer, require_offer};
use crate::config::{EngineSettings, SyncSettings};
use crate::db::CartRepository;
use crate::error::{CartError, Result};
use crate::kv::KeyValueBackend;
use crate::lock::{CartLocks, KvLockManager};
use crate::models::{Cart, CartItem, CartOwner, Identity, NewCartItem};
use crate::occ::{
    BatchOp, Column, FieldUpdates, OptimisticController, RowRef, UpdateOutcome, VersionedStore,
};
use crate::pricing::{CartSummary, PriceBreakdown, PricingOptions, PricingRules, calculate};
use crate::store::CartStore;
use crate::sync::{AutoFixReport, SweepReport, SyncEngine, SyncReport};

/// Largest quantity a single cart line may hold.
pub const MAX_ITEM_QUANTITY: u32 = 999;

/// Storage and coordination backends the service runs on.
#[derive(Clone)]
pub struct Backends {
    pub carts: Arc<dyn CartRepository>,
    pub rows: Arc<dyn VersionedStore>,
    pub catalog: Arc<dyn Catalog>,
    pub kv: Arc<dyn KeyValueBackend>,
}

/// Changes to one cart line. `None` leaves a field as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub quantity: Option<u32>,
    pub selected: Option<bool>,
}

impl ItemUpdate {
    #[must_use]
    pub const fn quantity(quantity: u32) -> Self {
        Self {
            quantity: Some(quantity),
            selected: None,
        }
    }

    #[must_use]
    pub const fn selected(selected: bool) -> Self {
        Self {
            quantity: None,
            selected: Some(selected),
        }
    }

    const fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.selected.is_none()
    }

    fn fields(&self) -> FieldUpdates {
        let mut updates = FieldUpdates::new();
        if let Some(quantity) = self.quantity {
            updates = updates.set(Column::Quantity, quantity);
        }
        if let Some(selected) = self.selected {
            updates = updates.set(Column::Selected, selected);
        }
        updates.set(Column::UpdatedAt, Utc::now())
    }
}

/// Priced selection handed to order creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutQuote {
    pub cart_id: CartId,
    /// Selected `normal` lines.
    pub items: Vec<CartItem>,
    pub pricing: PriceBreakdown,
}

/// Outcome of folding a guest cart into a user cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// The user's cart, if a guest cart existed to merge.
    pub cart_id: Option<CartId>,
    /// Guest lines added to or combined into the user's cart.
    pub merged_items: u32,
    /// Lines whose merged quantity was cut to available stock.
    pub clamped_items: u32,
    /// Guest lines dropped (invalid, unavailable, or out of stock).
    pub skipped_items: u32,
}

/// Outcome of an expiry pass over idle guest carts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expired: u32,
    /// Carts left for a later pass because their lock was held.
    pub skipped: u32,
}

fn resolve(identity: &Identity) -> Result<CartOwner> {
    let owner = identity.resolve().ok_or_else(|| {
        CartError::Validation("a user id or session token is required".to_owned())
    })?;
    Span::current().record("owner", tracing::field::display(&owner));
    Ok(owner)
}

fn validate_quantity(quantity: u32) -> Result<()> {
    if quantity == 0 || quantity > MAX_ITEM_QUANTITY {
        return Err(CartError::Validation(format!(
            "quantity must be between 1 and {MAX_ITEM_QUANTITY}, got {quantity}"
        )));
    }
    Ok(())
}

fn no_cart(owner: &CartOwner) -> CartError {
    CartError::NotFound(format!("active cart for {owner}"))
}

/// Public cart operations.
///
/// Cheap to clone; clones share backends and counters.
#[derive(Clone)]
pub struct CartService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: CartStore,
    catalog: Arc<dyn Catalog>,
    inventory: Inventory,
    locks: CartLocks,
    cache: CartCache,
    sync: SyncEngine,
    pricing: PricingRules,
    settings: SyncSettings,
}

impl CartService {
    /// Wire the service over the given backends.
    #[must_use]
    pub fn new(backends: Backends, settings: EngineSettings) -> Self {
        let occ = OptimisticController::new(backends.rows, settings.retry);
        let store = CartStore::new(backends.carts, occ.clone());
        let locks = CartLocks::new(
            Arc::new(KvLockManager::new(Arc::clone(&backends.kv))),
            settings.lock,
        );
        let cache = CartCache::new(backends.kv, settings.cache_ttl);
        let sync = SyncEngine::new(
            store.clone(),
            Arc::clone(&backends.catalog),
            cache.clone(),
            locks.clone(),
            settings.sync.batch_size,
        );

        Self {
            inner: Arc::new(ServiceInner {
                store,
                catalog: backends.catalog,
                inventory: Inventory::new(occ),
                locks,
                cache,
                sync,
                pricing: settings.pricing,
                settings: settings.sync,
            }),
        }
    }

    /// The reconciliation engine, for sweeps and the scheduled sweeper.
    #[must_use]
    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync
    }

    /// Run `mutation` under the owner's lock, then invalidate and release.
    async fn locked<T>(
        &self,
        owner: &CartOwner,
        mutation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = self.inner.locks.lock(owner).await?;
        // Declared after the lock: a cancelled call queues the invalidation
        // before the release.
        let invalidation = self.inner.cache.pending_invalidation(owner);
        let result = mutation.await;
        invalidation.complete().await;
        if let Err(e) = lock.release().await {
            warn!(owner = %owner, error = %e, "Cart lock release failed; it will expire");
        }
        result
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add `quantity` of a product (or SKU) to the cart.
    ///
    /// An existing line for the same pair is merged: quantities add up, the
    /// price snapshot is refreshed to the catalog price, and the merged
    /// quantity is checked against stock.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing or inactive product/SKU, `InsufficientStock`,
    /// `Validation` for a bad quantity or a line already marked invalid,
    /// `LockBusy`.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn add_item(
        &self,
        identity: &Identity,
        product_id: ProductId,
        sku_id: Option<SkuId>,
        quantity: u32,
    ) -> Result<CartItem> {
        let owner = resolve(identity)?;
        validate_quantity(quantity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.get_or_create(&owner).await?;
            let offer = require_offer(inner.catalog.as_ref(), product_id, sku_id).await?;

            let item_id = match inner.store.repo().find_item(cart.id, product_id, sku_id).await? {
                Some(existing) => {
                    if existing.status == ItemStatus::Invalid {
                        return Err(CartError::Validation(format!(
                            "cart item {} is no longer available; remove it first",
                            existing.id
                        )));
                    }
                    let (price, weight, stock) = (offer.price, offer.weight, offer.stock);
                    inner
                        .store
                        .occ()
                        .update_with(RowRef::item(existing.id), move |snapshot| {
                            let current = snapshot.count(Column::Quantity).unwrap_or(0);
                            let merged = current
                                .checked_add(quantity)
                                .filter(|q| *q <= MAX_ITEM_QUANTITY)
                                .ok_or_else(|| {
                                    CartError::Validation(format!(
                                        "merged quantity exceeds {MAX_ITEM_QUANTITY}"
                                    ))
                                })?;
                            if merged > stock {
                                return Err(CartError::insufficient_stock(merged, stock));
                            }
                            // Quantity and price were just checked against the
                            // catalog, which is all a sync would look at.
                            Ok(FieldUpdates::new()
                                .set(Column::Quantity, merged)
                                .set(Column::Price, price)
                                .set(Column::Weight, weight)
                                .set(Column::Status, ItemStatus::Normal)
                                .set(Column::UpdatedAt, Utc::now()))
                        })
                        .await?;
                    existing.id
                }
                None => {
                    if offer.stock < quantity {
                        return Err(CartError::insufficient_stock(quantity, offer.stock));
                    }
                    inner
                        .store
                        .repo()
                        .insert_item(NewCartItem {
                            cart_id: cart.id,
                            product_id,
                            sku_id,
                            quantity,
                            price: offer.price,
                            weight: offer.weight,
                            name: offer.name,
                            image: offer.image,
                            sku_attributes: offer.attributes,
                        })
                        .await?
                        .id
                }
            };

            inner.store.recompute_totals(cart.id).await?;
            let item = inner.store.item(cart.id, item_id).await?;
            info!(cart_id = %cart.id, item_id = %item.id, quantity = item.quantity, "Item added");
            Ok(item)
        })
        .await
    }

    /// Change a line's quantity and/or selection.
    ///
    /// Stock is re-checked only when the quantity grows.
    ///
    /// # Errors
    ///
    /// `NotFound` if the cart or line is absent, `InsufficientStock`,
    /// `Validation` for an empty update, a bad quantity, or a quantity change
    /// on an invalid line, `LockBusy`.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn update_item(
        &self,
        identity: &Identity,
        item_id: CartItemId,
        update: ItemUpdate,
    ) -> Result<CartItem> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;
            let item = inner.store.item(cart.id, item_id).await?;
            self.check_update(&item, update).await?;

            inner
                .store
                .occ()
                .update(RowRef::item(item.id), update.fields())
                .await?;
            inner.store.recompute_totals(cart.id).await?;

            info!(cart_id = %cart.id, item_id = %item_id, "Item updated");
            inner.store.item(cart.id, item_id).await
        })
        .await
    }

    async fn check_update(&self, item: &CartItem, update: ItemUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(CartError::Validation(format!(
                "nothing to update on cart item {}",
                item.id
            )));
        }
        let Some(quantity) = update.quantity else {
            return Ok(());
        };
        validate_quantity(quantity)?;
        if item.status == ItemStatus::Invalid {
            return Err(CartError::Validation(format!(
                "cart item {} is no longer available",
                item.id
            )));
        }
        if quantity > item.quantity {
            let offer = require_offer(self.inner.catalog.as_ref(), item.product_id, item.sku_id)
                .await?;
            if offer.stock < quantity {
                return Err(CartError::insufficient_stock(quantity, offer.stock));
            }
        }
        Ok(())
    }

    /// Remove one line.
    ///
    /// # Errors
    ///
    /// `NotFound` if the cart or line is absent, `LockBusy`.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn remove_item(&self, identity: &Identity, item_id: CartItemId) -> Result<()> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;
            let removed = inner.store.repo().delete_items(cart.id, &[item_id]).await?;
            if removed == 0 {
                return Err(CartError::NotFound(format!("cart item {item_id}")));
            }
            inner.store.recompute_totals(cart.id).await?;
            info!(cart_id = %cart.id, item_id = %item_id, "Item removed");
            Ok(())
        })
        .await
    }

    /// Remove every line. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// `LockBusy` or store failures.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn clear(&self, identity: &Identity) -> Result<u64> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let Some(cart) = inner.store.find(&owner).await? else {
                return Ok(0);
            };
            let removed = inner.store.repo().delete_all_items(cart.id).await?;
            inner.store.recompute_totals(cart.id).await?;
            info!(cart_id = %cart.id, removed, "Cart cleared");
            Ok(removed)
        })
        .await
    }

    /// Apply several line updates in one transaction.
    ///
    /// Every update is validated first; then either all rows are written or
    /// none is.
    ///
    /// # Errors
    ///
    /// As [`update_item`](Self::update_item) for whichever line fails first,
    /// or `ConcurrencyConflict` if a row keeps changing.
    #[instrument(skip(self, identity, updates), fields(owner = tracing::field::Empty, lines = updates.len()))]
    pub async fn batch_update(
        &self,
        identity: &Identity,
        updates: Vec<(CartItemId, ItemUpdate)>,
    ) -> Result<Vec<CartItem>> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;

            let mut ops = Vec::with_capacity(updates.len());
            for (item_id, update) in &updates {
                let item = inner.store.item(cart.id, *item_id).await?;
                self.check_update(&item, *update).await?;
                ops.push(BatchOp::set(RowRef::item(item.id), update.fields()));
            }
            inner.store.occ().update_batch(ops).await?;
            inner.store.recompute_totals(cart.id).await?;

            let ids: Vec<CartItemId> = updates.iter().map(|(id, _)| *id).collect();
            let items = inner
                .store
                .items(cart.id)
                .await?
                .into_iter()
                .filter(|i| ids.contains(&i.id))
                .collect();
            info!(cart_id = %cart.id, lines = ids.len(), "Batch update applied");
            Ok(items)
        })
        .await
    }

    /// Select or deselect every line. Returns how many lines changed.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no cart, `LockBusy`, `ConcurrencyConflict`.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn select_all(&self, identity: &Identity, selected: bool) -> Result<u32> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;
            let ops = inner
                .store
                .items(cart.id)
                .await?
                .iter()
                .map(|item| {
                    BatchOp::new(RowRef::item(item.id), move |snapshot| {
                        if snapshot.boolean(Column::Selected) == Some(selected) {
                            return Ok(FieldUpdates::new());
                        }
                        Ok(ItemUpdate::selected(selected).fields())
                    })
                })
                .collect();

            let outcomes = inner.store.occ().update_batch(ops).await?;
            inner.store.recompute_totals(cart.id).await?;

            let changed = outcomes.iter().filter(|o| o.is_applied()).count();
            let changed = u32::try_from(changed).unwrap_or(u32::MAX);
            info!(cart_id = %cart.id, selected, changed, "Selection applied to all items");
            Ok(changed)
        })
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The owner's cart with its summary, cache first.
    ///
    /// Never creates a cart: an owner without one gets an empty view. With
    /// `include_invalid = false` only `normal` lines are listed; the summary
    /// always names the others.
    ///
    /// # Errors
    ///
    /// `Validation` without an identity, or store failures on a miss.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn get_cart(&self, identity: &Identity, include_invalid: bool) -> Result<CartView> {
        let owner = resolve(identity)?;
        let view = self.view(&owner).await?;
        Ok(if include_invalid {
            view
        } else {
            view.without_unavailable()
        })
    }

    async fn view(&self, owner: &CartOwner) -> Result<CartView> {
        if let Some(view) = self.inner.cache.get(owner).await {
            return Ok(view);
        }

        let (cart, items) = match self.inner.store.find(owner).await? {
            Some(cart) => {
                let items = self.inner.store.items(cart.id).await?;
                (Some(cart), items)
            }
            None => (None, Vec::new()),
        };
        let summary = CartSummary::build(&items, &PricingOptions::default(), &self.inner.pricing)?;
        let view = CartView {
            cart,
            items,
            summary,
        };

        self.warm(owner.clone(), view.clone());
        Ok(view)
    }

    /// Cache `view` in the background.
    ///
    /// A mutation may commit between our store read and the cache write; its
    /// invalidation would then run before our write lands. Re-reading the
    /// cart version after the write catches that and drops the entry.
    fn warm(&self, owner: CartOwner, view: CartView) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.cache.put(&owner, &view).await {
                warn!(owner = %owner, error = %e, "Cache warm failed");
                return;
            }
            let cached = view.cart.as_ref().map(|c| c.version);
            match inner.store.find(&owner).await {
                Ok(current) if current.as_ref().map(|c| c.version) == cached => {}
                _ => inner.cache.invalidate(&owner).await,
            }
        });
    }

    /// Units in the cart, across all lines.
    ///
    /// # Errors
    ///
    /// As [`get_cart`](Self::get_cart).
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn item_count(&self, identity: &Identity) -> Result<u32> {
        let owner = resolve(identity)?;
        Ok(self.view(&owner).await?.summary.total_qty)
    }

    /// Price the current cart without changing anything.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed coupon or too many points.
    #[instrument(skip(self, identity, options), fields(owner = tracing::field::Empty))]
    pub async fn calculate(
        &self,
        identity: &Identity,
        options: &PricingOptions,
    ) -> Result<PriceBreakdown> {
        let owner = resolve(identity)?;
        let view = self.view(&owner).await?;
        Ok(calculate(&view.items, options, &self.inner.pricing)?)
    }

    /// Price the selection for order creation.
    ///
    /// Requires a [`sync_cart`](Self::sync_cart) that finished after the
    /// cart last changed and within the configured freshness window. Reads
    /// the store, not the cache.
    ///
    /// # Errors
    ///
    /// `NotFound` without a cart, `StaleCartState` without a fresh sync,
    /// `Validation` when nothing purchasable is selected or the options are
    /// invalid.
    #[instrument(skip(self, identity, options), fields(owner = tracing::field::Empty))]
    pub async fn prepare_checkout(
        &self,
        identity: &Identity,
        options: &PricingOptions,
    ) -> Result<CheckoutQuote> {
        let owner = resolve(identity)?;
        let cart = self.inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;
        self.ensure_fresh(&cart)?;

        let items: Vec<CartItem> = self
            .inner
            .store
            .items(cart.id)
            .await?
            .into_iter()
            .filter(|i| i.selected && i.status == ItemStatus::Normal)
            .collect();
        if items.is_empty() {
            return Err(CartError::Validation(
                "no purchasable items selected".to_owned(),
            ));
        }

        let pricing = calculate(&items, options, &self.inner.pricing)?;
        info!(cart_id = %cart.id, final_amount = %pricing.final_amount, "Checkout prepared");
        Ok(CheckoutQuote {
            cart_id: cart.id,
            items,
            pricing,
        })
    }

    fn ensure_fresh(&self, cart: &Cart) -> Result<()> {
        let Some(synced_at) = cart.synced_at else {
            return Err(CartError::StaleCartState(format!(
                "cart {} has never been synchronized",
                cart.id
            )));
        };
        if synced_at < cart.updated_at {
            return Err(CartError::StaleCartState(format!(
                "cart {} changed after its last sync",
                cart.id
            )));
        }
        let age = (Utc::now() - synced_at).to_std().unwrap_or_default();
        if age > self.inner.settings.max_age {
            return Err(CartError::StaleCartState(format!(
                "cart {} was last synchronized {}s ago",
                cart.id,
                age.as_secs()
            )));
        }
        Ok(())
    }

    /// Hit/miss counters and live key counts.
    ///
    /// # Errors
    ///
    /// `Backend` if the key scan failed.
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.inner.cache.stats().await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Reconcile the cart with the catalog and record the sync for checkout.
    ///
    /// # Errors
    ///
    /// `LockBusy`, catalog or store failures.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn sync_cart(&self, identity: &Identity) -> Result<SyncReport> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            match inner.store.find(&owner).await? {
                Some(cart) => inner.sync.sync_cart(&cart, true).await,
                None => Ok(SyncReport::default()),
            }
        })
        .await
    }

    /// Sync, then repair out-of-stock lines.
    ///
    /// # Errors
    ///
    /// `NotFound` without a cart, `LockBusy`, catalog or store failures.
    #[instrument(skip(self, identity), fields(owner = tracing::field::Empty))]
    pub async fn auto_fix(&self, identity: &Identity) -> Result<AutoFixReport> {
        let owner = resolve(identity)?;
        let inner = &self.inner;

        self.locked(&owner, async {
            let cart = inner.store.find(&owner).await?.ok_or_else(|| no_cart(&owner))?;
            inner.sync.auto_fix(&cart).await
        })
        .await
    }

    /// Reconcile every active cart once.
    ///
    /// # Errors
    ///
    /// Failures to list carts.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.inner.sync.sweep().await
    }

    /// Take stock for a set of lines, all or nothing.
    ///
    /// # Errors
    ///
    /// `InsufficientStock`, `ConcurrencyConflict`, `Validation` for zero
    /// quantities.
    pub async fn reserve_stock(&self, lines: &[StockLine]) -> Result<Vec<UpdateOutcome>> {
        self.inner.inventory.reserve(lines).await
    }

    /// Return stock taken by [`reserve_stock`](Self::reserve_stock).
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` or store failures.
    pub async fn release_stock(&self, lines: &[StockLine]) -> Result<Vec<UpdateOutcome>> {
        self.inner.inventory.restore(lines).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fold a guest cart into the user's cart after login.
    ///
    /// Colliding lines add up; every merged line takes the current catalog
    /// price and is cut to available stock. Lines that are invalid or have
    /// no stock are dropped. The guest cart ends up `merged`.
    ///
    /// # Errors
    ///
    /// `LockBusy` if either cart is locked, catalog or store failures.
    #[instrument(skip(self, session), fields(user_id = %user_id))]
    pub async fn merge_carts(&self, session: &SessionToken, user_id: UserId) -> Result<MergeReport> {
        let guest = CartOwner::Session(session.clone());
        let user = CartOwner::User(user_id);

        // Fixed order so two merges cannot deadlock each other.
        let (first, second) = if guest.key() <= user.key() {
            (&guest, &user)
        } else {
            (&user, &guest)
        };
        let first_lock = self.inner.locks.lock(first).await?;
        let second_lock = match self.inner.locks.lock(second).await {
            Ok(lock) => lock,
            Err(e) => {
                if let Err(release_err) = first_lock.release().await {
                    warn!(error = %release_err, "Lock release failed; it will expire");
                }
                return Err(e);
            }
        };

        let guest_invalidation = self.inner.cache.pending_invalidation(&guest);
        let user_invalidation = self.inner.cache.pending_invalidation(&user);
        let result = self.merge_locked(&guest, &user).await;

        guest_invalidation.complete().await;
        user_invalidation.complete().await;
        for lock in [second_lock, first_lock] {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Lock release failed; it will expire");
            }
        }
        result
    }

    async fn merge_locked(&self, guest: &CartOwner, user: &CartOwner) -> Result<MergeReport> {
        let inner = &self.inner;
        let Some(guest_cart) = inner.store.find(guest).await? else {
            return Ok(MergeReport::default());
        };
        let user_cart = inner.store.get_or_create(user).await?;
        let mut report = MergeReport {
            cart_id: Some(user_cart.id),
            ..MergeReport::default()
        };

        for line in inner.store.items(guest_cart.id).await? {
            if line.status == ItemStatus::Invalid {
                report.skipped_items += 1;
                continue;
            }
            let Some(offer) = find_offer(inner.catalog.as_ref(), line.product_id, line.sku_id).await?
            else {
                report.skipped_items += 1;
                continue;
            };

            let existing = inner
                .store
                .repo()
                .find_item(user_cart.id, line.product_id, line.sku_id)
                .await?;
            let wanted = existing
                .as_ref()
                .map_or(0, |e| e.quantity)
                .saturating_add(line.quantity)
                .min(MAX_ITEM_QUANTITY);
            let quantity = wanted.min(offer.stock);
            if quantity == 0 || existing.as_ref().is_some_and(|e| e.status == ItemStatus::Invalid) {
                report.skipped_items += 1;
                continue;
            }
            if quantity < wanted {
                report.clamped_items += 1;
            }

            match existing {
                // Clamped to current stock at the current price, so the line
                // is `normal` by the same test a sync applies.
                Some(existing) => {
                    inner
                        .store
                        .occ()
                        .update(
                            RowRef::item(existing.id),
                            FieldUpdates::new()
                                .set(Column::Quantity, quantity)
                                .set(Column::Price, offer.price)
                                .set(Column::Weight, offer.weight)
                                .set(Column::Status, ItemStatus::Normal)
                                .set(Column::UpdatedAt, Utc::now()),
                        )
                        .await?;
                }
                None => {
                    inner
                        .store
                        .repo()
                        .insert_item(NewCartItem {
                            cart_id: user_cart.id,
                            product_id: line.product_id,
                            sku_id: line.sku_id,
                            quantity,
                            price: offer.price,
                            weight: offer.weight,
                            name: line.name,
                            image: line.image,
                            sku_attributes: line.sku_attributes,
                        })
                        .await?;
                }
            }
            report.merged_items += 1;
        }

        inner.store.recompute_totals(user_cart.id).await?;
        inner.store.set_status(guest_cart.id, CartStatus::Merged).await?;

        info!(
            guest_cart = %guest_cart.id,
            user_cart = %user_cart.id,
            merged = report.merged_items,
            clamped = report.clamped_items,
            skipped = report.skipped_items,
            "Guest cart merged"
        );
        Ok(report)
    }

    /// Expire guest carts idle for longer than the configured window.
    ///
    /// # Errors
    ///
    /// Failures to list carts; individual carts that fail are logged.
    #[instrument(skip(self))]
    pub async fn expire_guest_carts(&self) -> Result<ExpiryReport> {
        let inner = &self.inner;
        let idle_since = chrono::Duration::from_std(inner.settings.guest_expiry)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let batch = inner.settings.batch_size.max(1);
        let mut report = ExpiryReport::default();

        loop {
            let carts = inner.store.repo().list_idle_guest_carts(idle_since, batch).await?;
            let mut progressed = 0_u32;

            for cart in &carts {
                let Some(lock) = inner.locks.try_lock(&cart.owner).await? else {
                    report.skipped += 1;
                    continue;
                };
                let invalidation = inner.cache.pending_invalidation(&cart.owner);
                let result = async {
                    let current = inner.store.cart(cart.id).await?;
                    if current.status != CartStatus::Active || current.updated_at >= idle_since {
                        return Ok(false);
                    }
                    inner.store.set_status(cart.id, CartStatus::Expired).await?;
                    Ok::<_, CartError>(true)
                }
                .await;
                invalidation.complete().await;
                if let Err(e) = lock.release().await {
                    warn!(cart_id = %cart.id, error = %e, "Lock release failed; it will expire");
                }

                match result {
                    Ok(true) => {
                        report.expired += 1;
                        progressed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(cart_id = %cart.id, error = %e, "Guest cart expiry failed"),
                }
            }

            if progressed == 0 || carts.len() < usize::try_from(batch).unwrap_or(usize::MAX) {
                break;
            }
        }

        info!(expired = report.expired, skipped = report.skipped, "Guest carts expired");
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_bounds() {
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_resolve_requires_identity() {
        let err = resolve(&Identity::default()).unwrap_err();
        assert!(matches!(err, CartError::Validation(_)));
    }

    #[test]
    fn test_item_update_fields() {
        let update = ItemUpdate {
            quantity: Some(3),
            selected: Some(false),
        };
        let fields = update.fields();
        assert_eq!(fields.len(), 3);
        assert!(!update.is_empty());
        assert!(ItemUpdate::default().is_empty());
    }
}
