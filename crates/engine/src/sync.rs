//! Reconciliation of cart lines against catalog truth.
//!
//! Item status transitions, decided only by comparing a line's snapshot with
//! the catalog:
//!
//! | from | to | when |
//! |------|----|------|
//! | any but `invalid` | `invalid` | product/SKU missing or not sellable |
//! | `normal`, `price_changed` | `out_of_stock` | stock < quantity |
//! | `out_of_stock`, `price_changed` | `normal` | stock >= quantity |
//! | `out_of_stock` | `invalid` | auto-fix, stock = 0 |
//! | `out_of_stock` | `normal` | auto-fix, quantity clamped to stock |
//!
//! A catalog price that differs from the snapshot overwrites the snapshot
//! and is reported as a price change; within the same pass the line settles
//! on `normal` or `out_of_stock`, so a second pass over an unchanged catalog
//! writes nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use cart_core::{CartId, CartItemId, ItemStatus, Money, ProductId, SkuId};

use crate::cache::CartCache;
use crate::catalog::{Catalog, find_offer};
use crate::error::Result;
use crate::lock::CartLocks;
use crate::models::{Cart, CartItem, Offer};
use crate::occ::{Column, FieldUpdates, RowRef, RowSnapshot};
use crate::store::CartStore;

// =============================================================================
// Reports
// =============================================================================

/// A snapshot price replaced by the catalog price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub item_id: CartItemId,
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub old_price: Money,
    pub new_price: Money,
}

/// A line asking for more than the catalog has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockIssue {
    pub item_id: CartItemId,
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub requested: u32,
    pub available: u32,
}

/// A line whose quantity auto-fix reduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClampedItem {
    pub item_id: CartItemId,
    pub from: u32,
    pub to: u32,
}

/// What one cart sync found and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub cart_id: Option<CartId>,
    /// Lines compared against the catalog (invalid lines are skipped).
    pub checked_items: u32,
    /// Lines actually written.
    pub updated_items: u32,
    pub price_changes: Vec<PriceChange>,
    pub stock_issues: Vec<StockIssue>,
    /// Lines that became `invalid` in this pass.
    pub invalidated: Vec<CartItemId>,
}

impl SyncReport {
    /// Whether the shopper must see something before checking out.
    #[must_use]
    pub fn has_adjustments(&self) -> bool {
        !self.price_changes.is_empty() || !self.stock_issues.is_empty() || !self.invalidated.is_empty()
    }
}

/// Outcome of an auto-fix pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFixReport {
    /// The sync that ran first.
    pub sync: SyncReport,
    pub clamped: Vec<ClampedItem>,
    /// Out-of-stock lines invalidated because nothing is left.
    pub invalidated: Vec<CartItemId>,
}

/// Outcome of a sweep over all active carts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub carts_checked: u32,
    /// Carts where at least one line was written.
    pub carts_updated: u32,
    pub items_updated: u32,
    /// Carts left alone because a caller held their lock.
    pub carts_skipped: u32,
    pub carts_failed: u32,
}

// =============================================================================
// Engine
// =============================================================================

/// Desired state of a line given the catalog.
struct Verdict {
    status: ItemStatus,
    price: Option<Money>,
    weight: Option<rust_decimal::Decimal>,
}

fn judge(item: &CartItem, offer: Option<&Offer>) -> Verdict {
    match offer {
        None => Verdict {
            status: ItemStatus::Invalid,
            price: None,
            weight: None,
        },
        Some(offer) => Verdict {
            status: if offer.stock >= item.quantity {
                ItemStatus::Normal
            } else {
                ItemStatus::OutOfStock
            },
            price: Some(offer.price),
            weight: Some(offer.weight),
        },
    }
}

/// Updates that move a row from `snapshot` to `verdict`.
///
/// An `invalid` row is terminal and never rewritten here.
fn reconcile(snapshot: &RowSnapshot, verdict: &Verdict) -> FieldUpdates {
    let mut updates = FieldUpdates::new();
    if snapshot.item_status() == Some(ItemStatus::Invalid) {
        return updates;
    }
    if let Some(price) = verdict.price
        && snapshot.decimal(Column::Price) != Some(price.amount())
    {
        updates = updates.set(Column::Price, price);
    }
    if let Some(weight) = verdict.weight
        && snapshot.decimal(Column::Weight) != Some(weight)
    {
        updates = updates.set(Column::Weight, weight);
    }
    if snapshot.item_status() != Some(verdict.status) {
        updates = updates.set(Column::Status, verdict.status);
    }
    if !updates.is_empty() {
        updates = updates.set(Column::UpdatedAt, Utc::now());
    }
    updates
}

/// Reconciles carts against the catalog.
#[derive(Clone)]
pub struct SyncEngine {
    store: CartStore,
    catalog: Arc<dyn Catalog>,
    cache: CartCache,
    locks: CartLocks,
    batch_size: u32,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: CartStore,
        catalog: Arc<dyn Catalog>,
        cache: CartCache,
        locks: CartLocks,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            catalog,
            cache,
            locks,
            batch_size: batch_size.max(1),
        }
    }

    /// Reconcile one cart. The caller holds the cart's lock.
    ///
    /// With `mark_synced`, the cart records the sync time, which checkout
    /// requires.
    ///
    /// # Errors
    ///
    /// Catalog or store failures, `ConcurrencyConflict` on a contended row.
    #[instrument(skip(self, cart), fields(cart_id = %cart.id))]
    pub async fn sync_cart(&self, cart: &Cart, mark_synced: bool) -> Result<SyncReport> {
        let items = self.store.items(cart.id).await?;
        let mut report = SyncReport {
            cart_id: Some(cart.id),
            ..SyncReport::default()
        };

        for item in &items {
            match item.status {
                ItemStatus::Invalid => continue,
                ItemStatus::Normal | ItemStatus::PriceChanged | ItemStatus::OutOfStock => {}
            }
            report.checked_items += 1;

            let offer = find_offer(self.catalog.as_ref(), item.product_id, item.sku_id).await?;
            let verdict = judge(item, offer.as_ref());

            let outcome = self
                .store
                .occ()
                .update_with(RowRef::item(item.id), |snapshot| Ok(reconcile(snapshot, &verdict)))
                .await?;

            if let Some(offer) = &offer {
                if offer.price != item.price {
                    report.price_changes.push(PriceChange {
                        item_id: item.id,
                        product_id: item.product_id,
                        sku_id: item.sku_id,
                        old_price: item.price,
                        new_price: offer.price,
                    });
                }
                if offer.stock < item.quantity {
                    report.stock_issues.push(StockIssue {
                        item_id: item.id,
                        product_id: item.product_id,
                        sku_id: item.sku_id,
                        requested: item.quantity,
                        available: offer.stock,
                    });
                }
            } else {
                report.invalidated.push(item.id);
            }

            if outcome.is_applied() {
                report.updated_items += 1;
                debug!(item_id = %item.id, status = %verdict.status, "Cart item reconciled");
            }
        }

        if mark_synced {
            self.store.recompute_totals_synced(cart.id).await?;
        } else if report.updated_items > 0 {
            self.store.recompute_totals(cart.id).await?;
        }
        if mark_synced || report.updated_items > 0 {
            self.cache.invalidate(&cart.owner).await;
        }

        info!(
            checked = report.checked_items,
            updated = report.updated_items,
            price_changes = report.price_changes.len(),
            stock_issues = report.stock_issues.len(),
            invalidated = report.invalidated.len(),
            "Cart synchronized"
        );
        Ok(report)
    }

    /// Sync, then repair out-of-stock lines. The caller holds the lock.
    ///
    /// Lines with nothing left become `invalid`; lines with some stock are
    /// clamped to it and return to `normal`.
    ///
    /// # Errors
    ///
    /// As [`sync_cart`](Self::sync_cart).
    #[instrument(skip(self, cart), fields(cart_id = %cart.id))]
    pub async fn auto_fix(&self, cart: &Cart) -> Result<AutoFixReport> {
        let sync = self.sync_cart(cart, false).await?;
        let mut report = AutoFixReport {
            sync,
            ..AutoFixReport::default()
        };

        let items = self.store.items(cart.id).await?;
        for item in items.iter().filter(|i| i.status == ItemStatus::OutOfStock) {
            let available = find_offer(self.catalog.as_ref(), item.product_id, item.sku_id)
                .await?
                .map_or(0, |offer| offer.stock);

            let occ = self.store.occ();
            if available == 0 {
                occ.update_with(RowRef::item(item.id), |snapshot| {
                    Ok(match snapshot.item_status() {
                        Some(ItemStatus::OutOfStock) => FieldUpdates::new()
                            .set(Column::Status, ItemStatus::Invalid)
                            .set(Column::UpdatedAt, Utc::now()),
                        _ => FieldUpdates::new(),
                    })
                })
                .await?;
                report.invalidated.push(item.id);
            } else {
                let to = available.min(item.quantity);
                occ.update_with(RowRef::item(item.id), |snapshot| {
                    let mut updates = FieldUpdates::new()
                        .set(Column::Status, ItemStatus::Normal)
                        .set(Column::UpdatedAt, Utc::now());
                    if snapshot.count(Column::Quantity) != Some(to) {
                        updates = updates.set(Column::Quantity, to);
                    }
                    Ok(updates)
                })
                .await?;
                if to < item.quantity {
                    report.clamped.push(ClampedItem {
                        item_id: item.id,
                        from: item.quantity,
                        to,
                    });
                }
            }
        }

        if !report.clamped.is_empty() || !report.invalidated.is_empty() {
            self.store.recompute_totals(cart.id).await?;
            self.cache.invalidate(&cart.owner).await;
        }

        info!(
            clamped = report.clamped.len(),
            invalidated = report.invalidated.len(),
            "Cart auto-fixed"
        );
        Ok(report)
    }

    /// Reconcile every active cart, a batch at a time.
    ///
    /// Each cart is locked for its own sync only. A cart whose lock is held
    /// is skipped and picked up by the next sweep; a cart that fails is
    /// logged and counted.
    ///
    /// # Errors
    ///
    /// Only failures to list carts abort the sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut after = None;

        loop {
            let carts = self
                .store
                .repo()
                .list_active_carts(after, self.batch_size)
                .await?;
            let Some(last) = carts.last() else {
                break;
            };
            after = Some(last.id);

            for cart in &carts {
                let Some(lock) = self.locks.try_lock(&cart.owner).await? else {
                    warn!(cart_id = %cart.id, "Cart busy, skipping in this sweep");
                    report.carts_skipped += 1;
                    continue;
                };

                let result = self.sync_cart(cart, false).await;
                if let Err(e) = lock.release().await {
                    warn!(cart_id = %cart.id, error = %e, "Lock release failed after sync");
                }

                report.carts_checked += 1;
                match result {
                    Ok(sync) => {
                        if sync.updated_items > 0 {
                            report.carts_updated += 1;
                            report.items_updated += sync.updated_items;
                        }
                    }
                    Err(e) => {
                        error!(cart_id = %cart.id, error = %e, "Cart sync failed during sweep");
                        report.carts_failed += 1;
                    }
                }
            }

            if carts.len() < self.batch_size as usize {
                break;
            }
        }

        info!(
            checked = report.carts_checked,
            updated = report.carts_updated,
            items = report.items_updated,
            skipped = report.carts_skipped,
            failed = report.carts_failed,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until stopped.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let engine = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sweep().await {
                            error!(error = %e, "Sweep failed");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for the current sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Sweeper task panicked");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::models::cart::tests::item;
    use crate::models::catalog::tests::product;

    fn offer(price_cents: i64, stock: u32) -> Offer {
        Offer::resolve(&product(1, price_cents, stock), None).unwrap()
    }

    fn snapshot_of(item: &CartItem) -> RowSnapshot {
        RowSnapshot::new(item.version)
            .with(Column::Status, item.status)
            .with(Column::Price, item.price)
            .with(Column::Weight, item.weight)
            .with(Column::Quantity, item.quantity)
    }

    #[test]
    fn test_missing_offer_invalidates() {
        let line = item(1, 1000, 1, ItemStatus::Normal);
        let verdict = judge(&line, None);
        assert_eq!(verdict.status, ItemStatus::Invalid);
        let updates = reconcile(&snapshot_of(&line), &verdict);
        assert!(updates.get(Column::Status).is_some());
    }

    #[test]
    fn test_short_stock_marks_out_of_stock() {
        let mut line = item(1, 1000, 5, ItemStatus::Normal);
        line.weight = Decimal::new(5, 1);
        let verdict = judge(&line, Some(&offer(1000, 2)));
        assert_eq!(verdict.status, ItemStatus::OutOfStock);
        let updates = reconcile(&snapshot_of(&line), &verdict);
        assert_eq!(updates.get(Column::Price), None);
    }

    #[test]
    fn test_price_change_settles_on_normal() {
        let mut line = item(1, 1000, 1, ItemStatus::Normal);
        line.weight = Decimal::new(5, 1);
        let verdict = judge(&line, Some(&offer(1200, 10)));
        assert_eq!(verdict.status, ItemStatus::Normal);

        let updates = reconcile(&snapshot_of(&line), &verdict);
        assert!(updates.get(Column::Price).is_some());
        assert!(updates.get(Column::Status).is_none());
    }

    #[test]
    fn test_invalid_is_terminal() {
        let line = item(1, 1000, 1, ItemStatus::Invalid);
        let verdict = judge(&line, Some(&offer(1000, 10)));
        assert!(reconcile(&snapshot_of(&line), &verdict).is_empty());
    }

    #[test]
    fn test_unchanged_line_needs_no_write() {
        let mut line = item(1, 1000, 1, ItemStatus::Normal);
        line.weight = Decimal::new(5, 1);
        let verdict = judge(&line, Some(&offer(1000, 10)));
        assert!(reconcile(&snapshot_of(&line), &verdict).is_empty());
    }

    #[test]
    fn test_report_adjustments() {
        let mut report = SyncReport::default();
        assert!(!report.has_adjustments());
        report.invalidated.push(CartItemId::new(1));
        assert!(report.has_adjustments());
    }
}
