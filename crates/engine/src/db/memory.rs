//! In-process store for tests and local development.
//!
//! Implements the same traits as [`super::PgStore`] over a single
//! `tokio::sync::Mutex`-guarded state. Transactions take the mutex for their
//! whole lifetime and work on a staged copy that replaces the state on
//! commit, so a rolled-back batch leaves no trace.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use cart_core::{
    CartId, CartItemId, CartStatus, CatalogStatus, ItemStatus, Money, ProductId, SkuId,
};

use super::{CartRepository, RepositoryError};
use crate::catalog::Catalog;
use crate::models::{Cart, CartItem, CartOwner, NewCartItem, ProductInfo, SkuInfo};
use crate::occ::{
    Column, FieldUpdates, FieldValue, RowRef, RowSnapshot, Table, VersionedStore, VersionedTx,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    carts: BTreeMap<i64, Cart>,
    items: BTreeMap<i64, CartItem>,
    products: BTreeMap<i64, ProductInfo>,
    skus: BTreeMap<i64, SkuInfo>,
    next_cart_id: i64,
    next_item_id: i64,
}

/// Thread-safe in-memory cart and catalog store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Catalog seeding
    // =========================================================================

    /// Insert or replace a product.
    pub async fn put_product(&self, product: ProductInfo) {
        let mut state = self.state.lock().await;
        state.products.insert(product.id.as_i64(), product);
    }

    /// Insert or replace a SKU.
    pub async fn put_sku(&self, sku: SkuInfo) {
        let mut state = self.state.lock().await;
        state.skus.insert(sku.id.as_i64(), sku);
    }

    /// Change a product's price, as a catalog edit would.
    pub async fn set_product_price(&self, id: ProductId, price: Money) {
        let mut state = self.state.lock().await;
        if let Some(product) = state.products.get_mut(&id.as_i64()) {
            product.price = price;
            product.version += 1;
        }
    }

    /// Change a product's stock level.
    pub async fn set_product_stock(&self, id: ProductId, stock: u32) {
        let mut state = self.state.lock().await;
        if let Some(product) = state.products.get_mut(&id.as_i64()) {
            product.stock = stock;
            product.version += 1;
        }
    }

    /// Change a product's publication status.
    pub async fn set_product_status(&self, id: ProductId, status: CatalogStatus) {
        let mut state = self.state.lock().await;
        if let Some(product) = state.products.get_mut(&id.as_i64()) {
            product.status = status;
            product.version += 1;
        }
    }

    /// Change a SKU's stock level.
    pub async fn set_sku_stock(&self, id: SkuId, stock: u32) {
        let mut state = self.state.lock().await;
        if let Some(sku) = state.skus.get_mut(&id.as_i64()) {
            sku.stock = stock;
            sku.version += 1;
        }
    }

    /// Remove a SKU from the catalog.
    pub async fn remove_sku(&self, id: SkuId) {
        let mut state = self.state.lock().await;
        state.skus.remove(&id.as_i64());
    }

    /// Rewind a cart's `updated_at`, simulating an idle cart.
    pub async fn backdate_cart(&self, id: CartId, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(cart) = state.carts.get_mut(&id.as_i64()) {
            cart.updated_at = updated_at;
        }
    }
}

// =============================================================================
// Versioned rows
// =============================================================================

fn to_count(column: Column, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Unsupported(format!("{} out of range: {value}", column.name()))
    })
}

fn type_mismatch(column: Column, value: &FieldValue) -> RepositoryError {
    RepositoryError::Unsupported(format!(
        "cannot assign {:?} to {}",
        value.kind(),
        column.name()
    ))
}

fn apply_to_cart(cart: &mut Cart, updates: &FieldUpdates) -> Result<(), RepositoryError> {
    for (column, value) in updates.iter() {
        match (column, value) {
            (Column::ItemCount, FieldValue::Int(v)) => cart.item_count = to_count(*column, *v)?,
            (Column::TotalQty, FieldValue::Int(v)) => cart.total_qty = to_count(*column, *v)?,
            (Column::TotalAmount, FieldValue::Decimal(v)) => cart.total_amount = Money::new(*v),
            (Column::Status, FieldValue::Text(v)) => {
                cart.status = v
                    .parse::<CartStatus>()
                    .map_err(|e| RepositoryError::Unsupported(e.to_string()))?;
            }
            (Column::SyncedAt, FieldValue::Timestamp(v)) => cart.synced_at = Some(*v),
            (Column::UpdatedAt, FieldValue::Timestamp(v)) => cart.updated_at = *v,
            _ => return Err(type_mismatch(*column, value)),
        }
    }
    Ok(())
}

fn apply_to_item(item: &mut CartItem, updates: &FieldUpdates) -> Result<(), RepositoryError> {
    for (column, value) in updates.iter() {
        match (column, value) {
            (Column::Quantity, FieldValue::Int(v)) => {
                let quantity = to_count(*column, *v)?;
                if quantity == 0 {
                    return Err(RepositoryError::Conflict(
                        "cart_item quantity must be >= 1".to_owned(),
                    ));
                }
                item.quantity = quantity;
            }
            (Column::Selected, FieldValue::Bool(v)) => item.selected = *v,
            (Column::Status, FieldValue::Text(v)) => {
                item.status = v
                    .parse::<ItemStatus>()
                    .map_err(|e| RepositoryError::Unsupported(e.to_string()))?;
            }
            (Column::Price, FieldValue::Decimal(v)) => item.price = Money::new(*v),
            (Column::Weight, FieldValue::Decimal(v)) => item.weight = *v,
            (Column::UpdatedAt, FieldValue::Timestamp(v)) => item.updated_at = *v,
            _ => return Err(type_mismatch(*column, value)),
        }
    }
    Ok(())
}

/// Catalog rows only track stock; `updated_at` is accepted and ignored.
fn apply_stock(stock: &mut u32, updates: &FieldUpdates) -> Result<(), RepositoryError> {
    for (column, value) in updates.iter() {
        match (column, value) {
            (Column::Stock, FieldValue::Int(v)) => *stock = to_count(*column, *v)?,
            (Column::UpdatedAt, FieldValue::Timestamp(_)) => {}
            _ => return Err(type_mismatch(*column, value)),
        }
    }
    Ok(())
}

impl MemoryState {
    fn read_row(&self, row: RowRef) -> Option<RowSnapshot> {
        match row.table {
            Table::Cart => self.carts.get(&row.id).map(|cart| {
                let snapshot = RowSnapshot::new(cart.version)
                    .with(Column::ItemCount, cart.item_count)
                    .with(Column::TotalQty, cart.total_qty)
                    .with(Column::TotalAmount, cart.total_amount)
                    .with(Column::Status, cart.status)
                    .with(Column::UpdatedAt, cart.updated_at);
                match cart.synced_at {
                    Some(at) => snapshot.with(Column::SyncedAt, at),
                    None => snapshot,
                }
            }),
            Table::CartItem => self.items.get(&row.id).map(|item| {
                RowSnapshot::new(item.version)
                    .with(Column::Quantity, item.quantity)
                    .with(Column::Selected, item.selected)
                    .with(Column::Status, item.status)
                    .with(Column::Price, item.price)
                    .with(Column::Weight, item.weight)
                    .with(Column::UpdatedAt, item.updated_at)
            }),
            Table::Product => self
                .products
                .get(&row.id)
                .map(|p| RowSnapshot::new(p.version).with(Column::Stock, p.stock)),
            Table::Sku => self
                .skus
                .get(&row.id)
                .map(|s| RowSnapshot::new(s.version).with(Column::Stock, s.stock)),
        }
    }

    fn write_if_version(
        &mut self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        updates.validate(row.table)?;

        // Apply to a copy so a failing assignment leaves the row untouched.
        match row.table {
            Table::Cart => {
                let Some(current) = self.carts.get(&row.id) else {
                    return Ok(false);
                };
                if current.version != expected_version {
                    return Ok(false);
                }
                let mut next = current.clone();
                apply_to_cart(&mut next, updates)?;
                next.version += 1;
                self.carts.insert(row.id, next);
            }
            Table::CartItem => {
                let Some(current) = self.items.get(&row.id) else {
                    return Ok(false);
                };
                if current.version != expected_version {
                    return Ok(false);
                }
                let mut next = current.clone();
                apply_to_item(&mut next, updates)?;
                next.version += 1;
                self.items.insert(row.id, next);
            }
            Table::Product => {
                let Some(current) = self.products.get(&row.id) else {
                    return Ok(false);
                };
                if current.version != expected_version {
                    return Ok(false);
                }
                let mut next = current.clone();
                apply_stock(&mut next.stock, updates)?;
                next.version += 1;
                self.products.insert(row.id, next);
            }
            Table::Sku => {
                let Some(current) = self.skus.get(&row.id) else {
                    return Ok(false);
                };
                if current.version != expected_version {
                    return Ok(false);
                }
                let mut next = current.clone();
                apply_stock(&mut next.stock, updates)?;
                next.version += 1;
                self.skus.insert(row.id, next);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn read_row(&self, row: RowRef) -> Result<Option<RowSnapshot>, RepositoryError> {
        Ok(self.state.lock().await.read_row(row))
    }

    async fn write_if_version(
        &self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        self.state
            .lock()
            .await
            .write_if_version(row, expected_version, updates)
    }

    async fn begin(&self) -> Result<Box<dyn VersionedTx>, RepositoryError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl VersionedTx for MemoryTx {
    async fn read_row(&mut self, row: RowRef) -> Result<Option<RowSnapshot>, RepositoryError> {
        Ok(self.staged.read_row(row))
    }

    async fn write_if_version(
        &mut self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        self.staged.write_if_version(row, expected_version, updates)
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let Self { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// =============================================================================
// Cart repository
// =============================================================================

#[async_trait]
impl CartRepository for MemoryStore {
    async fn find_active_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .carts
            .values()
            .find(|c| c.status == CartStatus::Active && &c.owner == owner)
            .cloned())
    }

    async fn create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        if state
            .carts
            .values()
            .any(|c| c.status == CartStatus::Active && &c.owner == owner)
        {
            return Err(RepositoryError::Conflict(format!(
                "active cart already exists for {owner}"
            )));
        }

        state.next_cart_id += 1;
        let now = Utc::now();
        let cart = Cart {
            id: CartId::new(state.next_cart_id),
            owner: owner.clone(),
            status: CartStatus::Active,
            item_count: 0,
            total_qty: 0,
            total_amount: Money::ZERO,
            version: 1,
            synced_at: None,
            created_at: now,
            updated_at: now,
        };
        state.carts.insert(cart.id.as_i64(), cart.clone());
        Ok(cart)
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        Ok(self.state.lock().await.carts.get(&id.as_i64()).cloned())
    }

    async fn list_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|i| i.cart_id == cart_id)
            .cloned()
            .collect())
    }

    async fn get_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .get(&item_id.as_i64())
            .filter(|i| i.cart_id == cart_id)
            .cloned())
    }

    async fn find_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        sku_id: Option<SkuId>,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .find(|i| i.cart_id == cart_id && i.product_id == product_id && i.sku_id == sku_id)
            .cloned())
    }

    async fn insert_item(&self, item: NewCartItem) -> Result<CartItem, RepositoryError> {
        let mut state = self.state.lock().await;
        if !state.carts.contains_key(&item.cart_id.as_i64()) {
            return Err(RepositoryError::NotFound);
        }
        if item.quantity == 0 {
            return Err(RepositoryError::Conflict(
                "cart_item quantity must be >= 1".to_owned(),
            ));
        }
        if state.items.values().any(|i| {
            i.cart_id == item.cart_id && i.product_id == item.product_id && i.sku_id == item.sku_id
        }) {
            return Err(RepositoryError::Conflict(format!(
                "cart {} already holds product {}",
                item.cart_id, item.product_id
            )));
        }

        state.next_item_id += 1;
        let now = Utc::now();
        let row = CartItem {
            id: CartItemId::new(state.next_item_id),
            cart_id: item.cart_id,
            product_id: item.product_id,
            sku_id: item.sku_id,
            quantity: item.quantity,
            selected: true,
            status: ItemStatus::Normal,
            price: item.price,
            weight: item.weight,
            name: item.name,
            image: item.image,
            sku_attributes: item.sku_attributes,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        state.items.insert(row.id.as_i64(), row.clone());
        Ok(row)
    }

    async fn delete_items(
        &self,
        cart_id: CartId,
        item_ids: &[CartItemId],
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state
            .items
            .retain(|_, i| !(i.cart_id == cart_id && item_ids.contains(&i.id)));
        Ok((before - state.items.len()) as u64)
    }

    async fn delete_all_items(&self, cart_id: CartId) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|_, i| i.cart_id != cart_id);
        Ok((before - state.items.len()) as u64)
    }

    async fn list_active_carts(
        &self,
        after: Option<CartId>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let state = self.state.lock().await;
        let start = after.map_or(i64::MIN, |id| id.as_i64().saturating_add(1));
        Ok(state
            .carts
            .range(start..)
            .map(|(_, cart)| cart)
            .filter(|c| c.status == CartStatus::Active)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_idle_guest_carts(
        &self,
        idle_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .carts
            .values()
            .filter(|c| {
                c.status == CartStatus::Active && c.owner.is_guest() && c.updated_at < idle_since
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[async_trait]
impl Catalog for MemoryStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<ProductInfo>, RepositoryError> {
        Ok(self.state.lock().await.products.get(&id.as_i64()).cloned())
    }

    async fn get_sku(&self, id: SkuId) -> Result<Option<SkuInfo>, RepositoryError> {
        Ok(self.state.lock().await.skus.get(&id.as_i64()).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cart_core::UserId;
    use rust_decimal::Decimal;

    use super::*;
    use crate::models::SkuAttributes;

    fn new_item(cart_id: CartId, product: i64) -> NewCartItem {
        NewCartItem {
            cart_id,
            product_id: ProductId::new(product),
            sku_id: None,
            quantity: 1,
            price: Money::from_cents(1000),
            weight: Decimal::ONE,
            name: "thing".to_string(),
            image: None,
            sku_attributes: SkuAttributes::new(),
        }
    }

    #[tokio::test]
    async fn test_one_active_cart_per_owner() {
        let store = MemoryStore::new();
        let owner = CartOwner::User(UserId::new(1));
        store.create_cart(&owner).await.unwrap();
        let err = store.create_cart(&owner).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_line_is_a_conflict() {
        let store = MemoryStore::new();
        let cart = store
            .create_cart(&CartOwner::User(UserId::new(1)))
            .await
            .unwrap();
        store.insert_item(new_item(cart.id, 5)).await.unwrap();
        let err = store.insert_item(new_item(cart.id, 5)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_write_if_version_rejects_stale_version() {
        let store = MemoryStore::new();
        let cart = store
            .create_cart(&CartOwner::User(UserId::new(1)))
            .await
            .unwrap();
        let item = store.insert_item(new_item(cart.id, 5)).await.unwrap();
        let row = RowRef::item(item.id);
        let updates = FieldUpdates::new().set(Column::Quantity, 3_u32);

        assert!(store.write_if_version(row, 1, &updates).await.unwrap());
        assert!(!store.write_if_version(row, 1, &updates).await.unwrap());

        let stored = store.get_item(cart.id, item.id).await.unwrap().unwrap();
        assert_eq!(stored.quantity, 3);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_violates_check() {
        let store = MemoryStore::new();
        let cart = store
            .create_cart(&CartOwner::User(UserId::new(1)))
            .await
            .unwrap();
        let item = store.insert_item(new_item(cart.id, 5)).await.unwrap();
        let updates = FieldUpdates::new().set(Column::Quantity, 0_u32);
        let err = store
            .write_if_version(RowRef::item(item.id), 1, &updates)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_writes() {
        let store = MemoryStore::new();
        let cart = store
            .create_cart(&CartOwner::User(UserId::new(1)))
            .await
            .unwrap();
        let item = store.insert_item(new_item(cart.id, 5)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let updates = FieldUpdates::new().set(Column::Selected, false);
        assert!(
            tx.write_if_version(RowRef::item(item.id), 1, &updates)
                .await
                .unwrap()
        );
        tx.rollback().await.unwrap();

        let stored = store.get_item(cart.id, item.id).await.unwrap().unwrap();
        assert!(stored.selected);
        assert_eq!(stored.version, 1);
    }
}
