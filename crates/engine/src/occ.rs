//! Optimistic concurrency control over versioned rows.
//!
//! Every mutable row the engine touches (carts, cart items, catalog stock)
//! carries a `version` counter. [`OptimisticController`] turns a desired set
//! of field updates into a guarded write:
//!
//! 1. read the row and its current version,
//! 2. `UPDATE ... SET ..., version = version + 1 WHERE id = ? AND version = ?`,
//! 3. on zero affected rows another writer won; back off and go to 1,
//! 4. give up with [`CartError::ConcurrencyConflict`] once the retry budget
//!    is spent.
//!
//! [`OptimisticController::update_batch`] runs the same loop for several rows
//! inside one transaction and rolls everything back on the first failure.
//! Components never hand-roll version checks; they call this module.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, instrument, warn};

use cart_core::{CartId, CartItemId, CartStatus, ItemStatus, Money, ProductId, SkuId};

use crate::db::RepositoryError;
use crate::error::{CartError, Result};

// =============================================================================
// Row addressing
// =============================================================================

/// Tables that hold versioned rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Cart,
    CartItem,
    Product,
    Sku,
}

impl Table {
    /// Fully qualified table name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cart => "cart.cart",
            Self::CartItem => "cart.cart_item",
            Self::Product => "catalog.product",
            Self::Sku => "catalog.sku",
        }
    }

    /// Columns the controller may write on this table.
    #[must_use]
    pub const fn columns(&self) -> &'static [Column] {
        match self {
            Self::Cart => &[
                Column::ItemCount,
                Column::TotalQty,
                Column::TotalAmount,
                Column::Status,
                Column::SyncedAt,
                Column::UpdatedAt,
            ],
            Self::CartItem => &[
                Column::Quantity,
                Column::Selected,
                Column::Status,
                Column::Price,
                Column::Weight,
                Column::UpdatedAt,
            ],
            Self::Product | Self::Sku => &[Column::Stock, Column::UpdatedAt],
        }
    }

    /// Whether `column` belongs to this table.
    #[must_use]
    pub fn allows(&self, column: Column) -> bool {
        self.columns().contains(&column)
    }
}

/// Writable columns across all versioned tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    ItemCount,
    TotalQty,
    TotalAmount,
    Status,
    SyncedAt,
    UpdatedAt,
    Quantity,
    Selected,
    Price,
    Weight,
    Stock,
}

impl Column {
    /// SQL column name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ItemCount => "item_count",
            Self::TotalQty => "total_qty",
            Self::TotalAmount => "total_amount",
            Self::Status => "status",
            Self::SyncedAt => "synced_at",
            Self::UpdatedAt => "updated_at",
            Self::Quantity => "quantity",
            Self::Selected => "selected",
            Self::Price => "price",
            Self::Weight => "weight",
            Self::Stock => "stock",
        }
    }

    /// Value type stored in this column.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::ItemCount | Self::TotalQty | Self::Quantity | Self::Stock => ValueKind::Int,
            Self::TotalAmount | Self::Price | Self::Weight => ValueKind::Decimal,
            Self::Status => ValueKind::Text,
            Self::SyncedAt | Self::UpdatedAt => ValueKind::Timestamp,
            Self::Selected => ValueKind::Bool,
        }
    }
}

/// Type tag of a [`FieldValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bool,
    Decimal,
    Text,
    Timestamp,
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Type tag of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Bool(_) => ValueKind::Bool,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::Text(_) => ValueKind::Text,
            Self::Timestamp(_) => ValueKind::Timestamp,
        }
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Decimal> for FieldValue {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<Money> for FieldValue {
    fn from(v: Money) -> Self {
        Self::Decimal(v.amount())
    }
}

impl From<ItemStatus> for FieldValue {
    fn from(v: ItemStatus) -> Self {
        Self::Text(v.as_str().to_owned())
    }
}

impl From<CartStatus> for FieldValue {
    fn from(v: CartStatus) -> Self {
        Self::Text(v.as_str().to_owned())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// Identifies one versioned row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowRef {
    pub table: Table,
    pub id: i64,
}

impl RowRef {
    #[must_use]
    pub const fn cart(id: CartId) -> Self {
        Self {
            table: Table::Cart,
            id: id.as_i64(),
        }
    }

    #[must_use]
    pub const fn item(id: CartItemId) -> Self {
        Self {
            table: Table::CartItem,
            id: id.as_i64(),
        }
    }

    #[must_use]
    pub const fn product(id: ProductId) -> Self {
        Self {
            table: Table::Product,
            id: id.as_i64(),
        }
    }

    #[must_use]
    pub const fn sku(id: SkuId) -> Self {
        Self {
            table: Table::Sku,
            id: id.as_i64(),
        }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table.name(), self.id)
    }
}

// =============================================================================
// Updates and snapshots
// =============================================================================

/// Ordered set of column assignments for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdates(Vec<(Column, FieldValue)>);

impl FieldUpdates {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Add (or replace) an assignment.
    #[must_use]
    pub fn set(mut self, column: Column, value: impl Into<FieldValue>) -> Self {
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(c, _)| *c == column) {
            slot.1 = value;
        } else {
            self.0.push((column, value));
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Column, FieldValue)> {
        self.0.iter()
    }

    /// Look up the value assigned to `column`, if any.
    #[must_use]
    pub fn get(&self, column: Column) -> Option<&FieldValue> {
        self.0.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    /// Check every assignment against the table's schema.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Unsupported` for a column the table does not
    /// have or a value of the wrong type.
    pub fn validate(&self, table: Table) -> std::result::Result<(), RepositoryError> {
        for (column, value) in &self.0 {
            if !table.allows(*column) {
                return Err(RepositoryError::Unsupported(format!(
                    "column {} is not writable on {}",
                    column.name(),
                    table.name()
                )));
            }
            if column.kind() != value.kind() {
                return Err(RepositoryError::Unsupported(format!(
                    "column {} expects {:?}, got {:?}",
                    column.name(),
                    column.kind(),
                    value.kind()
                )));
            }
        }
        Ok(())
    }
}

/// Current state of a versioned row as read by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSnapshot {
    pub version: i64,
    values: BTreeMap<Column, FieldValue>,
}

impl RowSnapshot {
    #[must_use]
    pub const fn new(version: i64) -> Self {
        Self {
            version,
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, column: Column, value: impl Into<FieldValue>) -> Self {
        self.values.insert(column, value.into());
        self
    }

    #[must_use]
    pub fn get(&self, column: Column) -> Option<&FieldValue> {
        self.values.get(&column)
    }

    #[must_use]
    pub fn int(&self, column: Column) -> Option<i64> {
        match self.values.get(&column) {
            Some(FieldValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Integer column narrowed to `u32`; negative or oversized values read as `None`.
    #[must_use]
    pub fn count(&self, column: Column) -> Option<u32> {
        self.int(column).and_then(|v| u32::try_from(v).ok())
    }

    #[must_use]
    pub fn decimal(&self, column: Column) -> Option<Decimal> {
        match self.values.get(&column) {
            Some(FieldValue::Decimal(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn boolean(&self, column: Column) -> Option<bool> {
        match self.values.get(&column) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn text(&self, column: Column) -> Option<&str> {
        match self.values.get(&column) {
            Some(FieldValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Parse the `status` column of a cart item row.
    #[must_use]
    pub fn item_status(&self) -> Option<ItemStatus> {
        self.text(Column::Status).and_then(|s| s.parse().ok())
    }
}

// =============================================================================
// Store traits
// =============================================================================

/// Storage capable of version-guarded conditional updates.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read a row's version and writable columns.
    async fn read_row(&self, row: RowRef) -> std::result::Result<Option<RowSnapshot>, RepositoryError>;

    /// Apply `updates` and bump the version if the row is still at `expected_version`.
    ///
    /// Returns `false` when no row matched (another writer got there first).
    async fn write_if_version(
        &self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> std::result::Result<bool, RepositoryError>;

    /// Start a transaction for a batch of conditional updates.
    async fn begin(&self) -> std::result::Result<Box<dyn VersionedTx>, RepositoryError>;
}

/// A transaction over a [`VersionedStore`].
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait VersionedTx: Send {
    async fn read_row(&mut self, row: RowRef) -> std::result::Result<Option<RowSnapshot>, RepositoryError>;

    async fn write_if_version(
        &mut self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> std::result::Result<bool, RepositoryError>;

    async fn commit(self: Box<Self>) -> std::result::Result<(), RepositoryError>;

    async fn rollback(self: Box<Self>) -> std::result::Result<(), RepositoryError>;
}

// =============================================================================
// Controller
// =============================================================================

/// Bounded retry schedule for optimistic updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.base_delay.mul_f64(self.backoff_factor.powi(exponent))
    }
}

/// What an optimistic update ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The row was written; `version` is the new version.
    Applied { version: i64 },
    /// The builder produced no changes; the row was left at `version`.
    Unchanged { version: i64 },
}

impl UpdateOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    #[must_use]
    pub const fn version(&self) -> i64 {
        match self {
            Self::Applied { version } | Self::Unchanged { version } => *version,
        }
    }
}

/// Computes the updates for a row from its current snapshot.
pub type UpdateFn = Box<dyn Fn(&RowSnapshot) -> Result<FieldUpdates> + Send + Sync>;

/// One row of a batch update.
pub struct BatchOp {
    row: RowRef,
    build: UpdateFn,
}

impl BatchOp {
    /// Updates derived from the row's current state.
    pub fn new<F>(row: RowRef, build: F) -> Self
    where
        F: Fn(&RowSnapshot) -> Result<FieldUpdates> + Send + Sync + 'static,
    {
        Self {
            row,
            build: Box::new(build),
        }
    }

    /// Fixed updates, independent of the current state.
    #[must_use]
    pub fn set(row: RowRef, updates: FieldUpdates) -> Self {
        Self::new(row, move |_| Ok(updates.clone()))
    }

    #[must_use]
    pub const fn row(&self) -> RowRef {
        self.row
    }
}

/// Version-checked conditional updates with bounded retry and backoff.
#[derive(Clone)]
pub struct OptimisticController {
    store: Arc<dyn VersionedStore>,
    policy: RetryPolicy,
}

impl OptimisticController {
    #[must_use]
    pub fn new(store: Arc<dyn VersionedStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Apply fixed updates to one row.
    ///
    /// # Errors
    ///
    /// `NotFound` if the row does not exist, `ConcurrencyConflict` when the
    /// retry budget runs out, `Repository` for store failures.
    pub async fn update(&self, row: RowRef, updates: FieldUpdates) -> Result<UpdateOutcome> {
        self.update_with(row, move |_| Ok(updates.clone())).await
    }

    /// Apply updates computed from the row's current state.
    ///
    /// `build` is re-run against a fresh snapshot on every attempt, so it must
    /// be a pure function of its input. An empty result leaves the row alone.
    ///
    /// # Errors
    ///
    /// Errors returned by `build` abort immediately. Otherwise as
    /// [`update`](Self::update).
    #[instrument(skip(self, build), fields(row = %row))]
    pub async fn update_with<F>(&self, row: RowRef, build: F) -> Result<UpdateOutcome>
    where
        F: Fn(&RowSnapshot) -> Result<FieldUpdates> + Send + Sync,
    {
        let attempts = self.policy.attempts();

        for attempt in 0..attempts {
            let snapshot = self
                .store
                .read_row(row)
                .await?
                .ok_or_else(|| CartError::NotFound(row.to_string()))?;

            let updates = build(&snapshot)?;
            if updates.is_empty() {
                return Ok(UpdateOutcome::Unchanged {
                    version: snapshot.version,
                });
            }
            updates.validate(row.table)?;

            if self
                .store
                .write_if_version(row, snapshot.version, &updates)
                .await?
            {
                debug!(version = snapshot.version + 1, "Optimistic update applied");
                return Ok(UpdateOutcome::Applied {
                    version: snapshot.version + 1,
                });
            }

            warn!(attempt, expected = snapshot.version, "Version conflict");
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }

        Err(CartError::ConcurrencyConflict {
            row: row.to_string(),
            attempts,
        })
    }

    /// Apply several row updates atomically.
    ///
    /// Either every row is written or none is: the first unresolved conflict,
    /// builder error, or store failure rolls the transaction back.
    ///
    /// # Errors
    ///
    /// As [`update_with`](Self::update_with), for whichever row failed first.
    #[instrument(skip(self, ops), fields(rows = ops.len()))]
    pub async fn update_batch(&self, ops: Vec<BatchOp>) -> Result<Vec<UpdateOutcome>> {
        let mut tx = self.store.begin().await?;
        let mut outcomes = Vec::with_capacity(ops.len());

        for op in &ops {
            let result = self.apply_in_tx(tx.as_mut(), op).await;
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(row = %op.row, error = %err, "Batch update failed, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        error!(error = %rollback_err, "Rollback failed");
                    }
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn apply_in_tx(&self, tx: &mut dyn VersionedTx, op: &BatchOp) -> Result<UpdateOutcome> {
        let attempts = self.policy.attempts();

        for attempt in 0..attempts {
            let snapshot = tx
                .read_row(op.row)
                .await?
                .ok_or_else(|| CartError::NotFound(op.row.to_string()))?;

            let updates = (op.build)(&snapshot)?;
            if updates.is_empty() {
                return Ok(UpdateOutcome::Unchanged {
                    version: snapshot.version,
                });
            }
            updates.validate(op.row.table)?;

            if tx
                .write_if_version(op.row, snapshot.version, &updates)
                .await?
            {
                return Ok(UpdateOutcome::Applied {
                    version: snapshot.version + 1,
                });
            }

            warn!(row = %op.row, attempt, "Version conflict inside batch");
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }

        Err(CartError::ConcurrencyConflict {
            row: op.row.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::catalog::tests::product;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_retry_policy_backoff_grows() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        };
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
    }

    #[test]
    fn test_field_updates_validate_against_table() {
        let ok = FieldUpdates::new().set(Column::Stock, 3_u32);
        assert!(ok.validate(Table::Product).is_ok());

        let wrong_table = FieldUpdates::new().set(Column::Quantity, 3_u32);
        assert!(wrong_table.validate(Table::Product).is_err());

        let wrong_type = FieldUpdates::new().set(Column::Quantity, true);
        assert!(wrong_type.validate(Table::CartItem).is_err());
    }

    #[test]
    fn test_field_updates_set_replaces() {
        let updates = FieldUpdates::new()
            .set(Column::Stock, 3_u32)
            .set(Column::Stock, 5_u32);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates.get(Column::Stock), Some(&FieldValue::Int(5)));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 10)).await;
        let occ = OptimisticController::new(Arc::new(store.clone()), fast_policy(3));

        let row = RowRef::product(ProductId::new(1));
        let outcome = occ
            .update(row, FieldUpdates::new().set(Column::Stock, 7_u32))
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Applied { version: 2 });
        let snapshot = store.read_row(row).await.unwrap().unwrap();
        assert_eq!(snapshot.count(Column::Stock), Some(7));
    }

    #[tokio::test]
    async fn test_empty_updates_leave_row_unchanged() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 10)).await;
        let occ = OptimisticController::new(Arc::new(store), fast_policy(3));

        let outcome = occ
            .update_with(RowRef::product(ProductId::new(1)), |_| Ok(FieldUpdates::new()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged { version: 1 });
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let occ = OptimisticController::new(Arc::new(MemoryStore::new()), fast_policy(3));
        let err = occ
            .update(
                RowRef::product(ProductId::new(99)),
                FieldUpdates::new().set(Column::Stock, 1_u32),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotFound(_)));
    }

    /// Store whose conditional writes always lose the race.
    struct AlwaysStale {
        inner: MemoryStore,
        writes: AtomicU32,
    }

    #[async_trait]
    impl VersionedStore for AlwaysStale {
        async fn read_row(
            &self,
            row: RowRef,
        ) -> std::result::Result<Option<RowSnapshot>, RepositoryError> {
            self.inner.read_row(row).await
        }

        async fn write_if_version(
            &self,
            _row: RowRef,
            _expected_version: i64,
            _updates: &FieldUpdates,
        ) -> std::result::Result<bool, RepositoryError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn begin(&self) -> std::result::Result<Box<dyn VersionedTx>, RepositoryError> {
            self.inner.begin().await
        }
    }

    #[tokio::test]
    async fn test_conflict_after_retry_budget() {
        let inner = MemoryStore::new();
        inner.put_product(product(1, 1000, 10)).await;
        let store = Arc::new(AlwaysStale {
            inner,
            writes: AtomicU32::new(0),
        });
        let occ = OptimisticController::new(store.clone(), fast_policy(2));

        let err = occ
            .update(
                RowRef::product(ProductId::new(1)),
                FieldUpdates::new().set(Column::Stock, 1_u32),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::ConcurrencyConflict { attempts: 3, .. }));
        assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_failure() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 10)).await;
        store.put_product(product(2, 1000, 1)).await;
        let occ = OptimisticController::new(Arc::new(store.clone()), fast_policy(1));

        let decrement = |qty: u32| {
            move |snap: &RowSnapshot| {
                let stock = snap.count(Column::Stock).unwrap_or(0);
                if stock < qty {
                    return Err(CartError::insufficient_stock(qty, stock));
                }
                Ok(FieldUpdates::new().set(Column::Stock, stock - qty))
            }
        };

        let err = occ
            .update_batch(vec![
                BatchOp::new(RowRef::product(ProductId::new(1)), decrement(3)),
                BatchOp::new(RowRef::product(ProductId::new(2)), decrement(3)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InsufficientStock { .. }));

        let first = store
            .read_row(RowRef::product(ProductId::new(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.count(Column::Stock), Some(10));
        assert_eq!(first.version, 1);
    }
}
