//! Cart store: identity resolution, get-or-create, aggregate upkeep.
//!
//! Wraps a [`CartRepository`] and routes every update of an existing row
//! through the [`OptimisticController`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use cart_core::{CartId, CartItemId, CartStatus};

use crate::db::{CartRepository, RepositoryError};
use crate::error::{CartError, Result};
use crate::models::{Cart, CartItem, CartOwner, CartTotals};
use crate::occ::{Column, FieldUpdates, OptimisticController, RowRef, UpdateOutcome};

/// Sole writer of persisted cart rows.
#[derive(Clone)]
pub struct CartStore {
    repo: Arc<dyn CartRepository>,
    occ: OptimisticController,
}

impl CartStore {
    #[must_use]
    pub fn new(repo: Arc<dyn CartRepository>, occ: OptimisticController) -> Self {
        Self { repo, occ }
    }

    #[must_use]
    pub fn repo(&self) -> &dyn CartRepository {
        self.repo.as_ref()
    }

    #[must_use]
    pub const fn occ(&self) -> &OptimisticController {
        &self.occ
    }

    /// The owner's active cart, if any.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn find(&self, owner: &CartOwner) -> Result<Option<Cart>> {
        Ok(self.repo.find_active_cart(owner).await?)
    }

    /// The owner's active cart, created if absent.
    ///
    /// A concurrent creator winning the unique index is not an error: its
    /// cart is returned.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn get_or_create(&self, owner: &CartOwner) -> Result<Cart> {
        if let Some(cart) = self.repo.find_active_cart(owner).await? {
            return Ok(cart);
        }

        match self.repo.create_cart(owner).await {
            Ok(cart) => {
                info!(cart_id = %cart.id, "Cart created");
                Ok(cart)
            }
            Err(RepositoryError::Conflict(_)) => {
                debug!("Lost cart creation race, reloading");
                self.repo
                    .find_active_cart(owner)
                    .await?
                    .ok_or_else(|| CartError::NotFound(format!("active cart for {owner}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cart row by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if the cart does not exist.
    pub async fn cart(&self, cart_id: CartId) -> Result<Cart> {
        self.repo
            .get_cart(cart_id)
            .await?
            .ok_or_else(|| CartError::NotFound(format!("cart {cart_id}")))
    }

    /// All lines of a cart.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn items(&self, cart_id: CartId) -> Result<Vec<CartItem>> {
        Ok(self.repo.list_items(cart_id).await?)
    }

    /// One line of a cart.
    ///
    /// # Errors
    ///
    /// `NotFound` if the line is absent or belongs to another cart.
    pub async fn item(&self, cart_id: CartId, item_id: CartItemId) -> Result<CartItem> {
        self.repo
            .get_item(cart_id, item_id)
            .await?
            .ok_or_else(|| CartError::NotFound(format!("cart item {item_id}")))
    }

    /// Rewrite the cart's aggregate fields from its current lines.
    ///
    /// Always touches `updated_at`, which marks the cart as mutated.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` if the cart row keeps changing, or repository
    /// failures.
    pub async fn recompute_totals(&self, cart_id: CartId) -> Result<CartTotals> {
        self.write_totals(cart_id, None).await
    }

    /// Like [`recompute_totals`](Self::recompute_totals), and record a
    /// completed sync at the same instant.
    ///
    /// # Errors
    ///
    /// As [`recompute_totals`](Self::recompute_totals).
    pub async fn recompute_totals_synced(&self, cart_id: CartId) -> Result<CartTotals> {
        self.write_totals(cart_id, Some(Utc::now())).await
    }

    async fn write_totals(
        &self,
        cart_id: CartId,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<CartTotals> {
        let items = self.repo.list_items(cart_id).await?;
        let totals = CartTotals::fold(&items);
        let now = synced_at.unwrap_or_else(Utc::now);

        self.occ
            .update_with(RowRef::cart(cart_id), move |_| {
                let updates = FieldUpdates::new()
                    .set(Column::ItemCount, totals.item_count)
                    .set(Column::TotalQty, totals.total_qty)
                    .set(Column::TotalAmount, totals.total_amount)
                    .set(Column::UpdatedAt, now);
                Ok(match synced_at {
                    Some(at) => updates.set(Column::SyncedAt, at),
                    None => updates,
                })
            })
            .await?;

        debug!(
            cart_id = %cart_id,
            item_count = totals.item_count,
            total_qty = totals.total_qty,
            total_amount = %totals.total_amount,
            "Cart totals recomputed"
        );
        Ok(totals)
    }

    /// Move a cart to a new lifecycle status.
    ///
    /// # Errors
    ///
    /// As [`recompute_totals`](Self::recompute_totals).
    pub async fn set_status(&self, cart_id: CartId, status: CartStatus) -> Result<UpdateOutcome> {
        let outcome = self
            .occ
            .update(
                RowRef::cart(cart_id),
                FieldUpdates::new()
                    .set(Column::Status, status)
                    .set(Column::UpdatedAt, Utc::now()),
            )
            .await?;
        info!(cart_id = %cart_id, status = %status, "Cart status changed");
        Ok(outcome)
    }
}
