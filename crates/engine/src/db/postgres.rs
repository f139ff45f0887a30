//! `PostgreSQL` implementation of the cart store, versioned rows, and catalog.
//!
//! Queries are built at runtime with `sqlx::query` so the crate compiles
//! without a live database; column names in dynamic `UPDATE`s come only from
//! the closed [`Column`] enum.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use cart_core::{
    CartId, CartItemId, CartStatus, CatalogStatus, ItemStatus, Money, ProductId, SessionToken,
    SkuId, UserId,
};

use super::{CartRepository, RepositoryError};
use crate::catalog::Catalog;
use crate::models::{Cart, CartItem, CartOwner, NewCartItem, ProductInfo, SkuAttributes, SkuInfo};
use crate::occ::{
    Column, FieldUpdates, FieldValue, RowRef, RowSnapshot, Table, ValueKind, VersionedStore,
    VersionedTx,
};

const CART_COLUMNS: &str = "id, user_id, session_token, status, item_count, total_qty, \
     total_amount, version, synced_at, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, cart_id, product_id, sku_id, quantity, selected, status, \
     price, weight, name, image, sku_attributes, version, created_at, updated_at";

/// Cart store backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn corrupt(what: &str, err: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::DataCorruption(format!("{what}: {err}"))
}

fn count(row: &PgRow, column: &str) -> Result<u32, RepositoryError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|e| corrupt(column, e))
}

fn map_cart(row: &PgRow) -> Result<Cart, RepositoryError> {
    let user_id: Option<i64> = row.try_get("user_id")?;
    let session_token: Option<String> = row.try_get("session_token")?;
    let owner = match (user_id, session_token) {
        (Some(id), _) => CartOwner::User(UserId::new(id)),
        (None, Some(token)) => {
            CartOwner::Session(SessionToken::parse(&token).map_err(|e| corrupt("session_token", e))?)
        }
        (None, None) => {
            return Err(RepositoryError::DataCorruption(
                "cart without owner".to_owned(),
            ));
        }
    };
    let status: String = row.try_get("status")?;

    Ok(Cart {
        id: CartId::new(row.try_get("id")?),
        owner,
        status: status
            .parse::<CartStatus>()
            .map_err(|e| corrupt("cart status", e))?,
        item_count: count(row, "item_count")?,
        total_qty: count(row, "total_qty")?,
        total_amount: Money::new(row.try_get("total_amount")?),
        version: row.try_get("version")?,
        synced_at: row.try_get("synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_item(row: &PgRow) -> Result<CartItem, RepositoryError> {
    let status: String = row.try_get("status")?;
    let attributes: Json<SkuAttributes> = row.try_get("sku_attributes")?;

    Ok(CartItem {
        id: CartItemId::new(row.try_get("id")?),
        cart_id: CartId::new(row.try_get("cart_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        sku_id: SkuId::from_column(row.try_get("sku_id")?),
        quantity: count(row, "quantity")?,
        selected: row.try_get("selected")?,
        status: status
            .parse::<ItemStatus>()
            .map_err(|e| corrupt("item status", e))?,
        price: Money::new(row.try_get("price")?),
        weight: row.try_get("weight")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        sku_attributes: attributes.0,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn owner_columns(owner: &CartOwner) -> (Option<i64>, Option<String>) {
    match owner {
        CartOwner::User(id) => (Some(id.as_i64()), None),
        CartOwner::Session(token) => (None, Some(token.as_str().to_owned())),
    }
}

fn map_unique_violation(err: sqlx::Error, message: String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.is_unique_violation()
    {
        return RepositoryError::Conflict(message);
    }
    RepositoryError::Database(err)
}

// =============================================================================
// Versioned rows (shared between pool and transaction executors)
// =============================================================================

fn select_row_sql(table: Table) -> String {
    let columns: Vec<&str> = table.columns().iter().map(Column::name).collect();
    format!(
        "SELECT version, {} FROM {} WHERE id = $1",
        columns.join(", "),
        table.name()
    )
}

fn snapshot_from_row(table: Table, row: &PgRow) -> Result<RowSnapshot, RepositoryError> {
    let mut snapshot = RowSnapshot::new(row.try_get("version")?);
    for column in table.columns() {
        let name = column.name();
        let value = match column.kind() {
            ValueKind::Int => FieldValue::Int(row.try_get::<i64, _>(name)?),
            ValueKind::Bool => FieldValue::Bool(row.try_get::<bool, _>(name)?),
            ValueKind::Decimal => FieldValue::Decimal(row.try_get::<Decimal, _>(name)?),
            ValueKind::Text => FieldValue::Text(row.try_get::<String, _>(name)?),
            ValueKind::Timestamp => match row.try_get::<Option<DateTime<Utc>>, _>(name)? {
                Some(at) => FieldValue::Timestamp(at),
                None => continue,
            },
        };
        snapshot = snapshot.with(*column, value);
    }
    Ok(snapshot)
}

fn update_sql(row: RowRef, updates: &FieldUpdates) -> String {
    let assignments: Vec<String> = updates
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{} = ${}", column.name(), i + 1))
        .collect();
    let n = updates.len();
    format!(
        "UPDATE {} SET {}, version = version + 1 WHERE id = ${} AND version = ${}",
        row.table.name(),
        assignments.join(", "),
        n + 1,
        n + 2
    )
}

fn bind_updates<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    row: RowRef,
    expected_version: i64,
    updates: &FieldUpdates,
) -> Query<'q, Postgres, PgArguments> {
    for (_, value) in updates.iter() {
        query = match value {
            FieldValue::Int(v) => query.bind(*v),
            FieldValue::Bool(v) => query.bind(*v),
            FieldValue::Decimal(v) => query.bind(*v),
            FieldValue::Text(v) => query.bind(v.clone()),
            FieldValue::Timestamp(v) => query.bind(*v),
        };
    }
    query.bind(row.id).bind(expected_version)
}

#[async_trait]
impl VersionedStore for PgStore {
    async fn read_row(&self, row: RowRef) -> Result<Option<RowSnapshot>, RepositoryError> {
        let sql = select_row_sql(row.table);
        let found = sqlx::query(&sql)
            .bind(row.id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|r| snapshot_from_row(row.table, &r)).transpose()
    }

    async fn write_if_version(
        &self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        updates.validate(row.table)?;
        let sql = update_sql(row, updates);
        let result = bind_updates(sqlx::query(&sql), row, expected_version, updates)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin(&self) -> Result<Box<dyn VersionedTx>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgVersionedTx { tx }))
    }
}

struct PgVersionedTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl VersionedTx for PgVersionedTx {
    async fn read_row(&mut self, row: RowRef) -> Result<Option<RowSnapshot>, RepositoryError> {
        let sql = select_row_sql(row.table);
        let found = sqlx::query(&sql)
            .bind(row.id)
            .fetch_optional(&mut *self.tx)
            .await?;
        found.map(|r| snapshot_from_row(row.table, &r)).transpose()
    }

    async fn write_if_version(
        &mut self,
        row: RowRef,
        expected_version: i64,
        updates: &FieldUpdates,
    ) -> Result<bool, RepositoryError> {
        updates.validate(row.table)?;
        let sql = update_sql(row, updates);
        let result = bind_updates(sqlx::query(&sql), row, expected_version, updates)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Cart repository
// =============================================================================

#[async_trait]
impl CartRepository for PgStore {
    async fn find_active_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError> {
        let (user_id, session_token) = owner_columns(owner);
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM cart.cart \
             WHERE status = 'active' \
               AND user_id IS NOT DISTINCT FROM $1 \
               AND session_token IS NOT DISTINCT FROM $2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(session_token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_cart).transpose()
    }

    async fn create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError> {
        let (user_id, session_token) = owner_columns(owner);
        let sql = format!(
            "INSERT INTO cart.cart (user_id, session_token) VALUES ($1, $2) \
             RETURNING {CART_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(session_token)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, format!("active cart already exists for {owner}")))?;
        map_cart(&row)
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        let sql = format!("SELECT {CART_COLUMNS} FROM cart.cart WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_cart).transpose()
    }

    async fn list_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, RepositoryError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM cart.cart_item WHERE cart_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(cart_id.as_i64())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_item).collect()
    }

    async fn get_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let sql =
            format!("SELECT {ITEM_COLUMNS} FROM cart.cart_item WHERE id = $1 AND cart_id = $2");
        let row = sqlx::query(&sql)
            .bind(item_id.as_i64())
            .bind(cart_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_item).transpose()
    }

    async fn find_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        sku_id: Option<SkuId>,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM cart.cart_item \
             WHERE cart_id = $1 AND product_id = $2 AND sku_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(cart_id.as_i64())
            .bind(product_id.as_i64())
            .bind(SkuId::to_column(sku_id))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_item).transpose()
    }

    async fn insert_item(&self, item: NewCartItem) -> Result<CartItem, RepositoryError> {
        let sql = format!(
            "INSERT INTO cart.cart_item \
               (cart_id, product_id, sku_id, quantity, price, weight, name, image, sku_attributes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(item.cart_id.as_i64())
            .bind(item.product_id.as_i64())
            .bind(SkuId::to_column(item.sku_id))
            .bind(i64::from(item.quantity))
            .bind(item.price.amount())
            .bind(item.weight)
            .bind(&item.name)
            .bind(&item.image)
            .bind(Json(&item.sku_attributes))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(
                    e,
                    format!(
                        "cart {} already holds product {}",
                        item.cart_id, item.product_id
                    ),
                )
            })?;
        map_item(&row)
    }

    async fn delete_items(
        &self,
        cart_id: CartId,
        item_ids: &[CartItemId],
    ) -> Result<u64, RepositoryError> {
        let ids: Vec<i64> = item_ids.iter().map(CartItemId::as_i64).collect();
        let result = sqlx::query("DELETE FROM cart.cart_item WHERE cart_id = $1 AND id = ANY($2)")
            .bind(cart_id.as_i64())
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_items(&self, cart_id: CartId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM cart.cart_item WHERE cart_id = $1")
            .bind(cart_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_active_carts(
        &self,
        after: Option<CartId>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM cart.cart \
             WHERE status = 'active' AND id > $1 ORDER BY id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after.map_or(0, |id| id.as_i64()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_cart).collect()
    }

    async fn list_idle_guest_carts(
        &self,
        idle_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM cart.cart \
             WHERE status = 'active' AND session_token IS NOT NULL AND updated_at < $1 \
             ORDER BY id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(idle_since)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_cart).collect()
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[async_trait]
impl Catalog for PgStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<ProductInfo>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, image, status, price, stock, weight, version \
             FROM catalog.product WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;

        Ok(Some(ProductInfo {
            id: ProductId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            image: row.try_get("image")?,
            status: status
                .parse::<CatalogStatus>()
                .map_err(|e| corrupt("product status", e))?,
            price: Money::new(row.try_get("price")?),
            stock: count(&row, "stock")?,
            weight: row.try_get("weight")?,
            version: row.try_get("version")?,
        }))
    }

    async fn get_sku(&self, id: SkuId) -> Result<Option<SkuInfo>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, product_id, status, price, stock, attributes, image, version \
             FROM catalog.sku WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let attributes: Json<SkuAttributes> = row.try_get("attributes")?;

        Ok(Some(SkuInfo {
            id: SkuId::new(row.try_get("id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            status: status
                .parse::<CatalogStatus>()
                .map_err(|e| corrupt("sku status", e))?,
            price: Money::new(row.try_get("price")?),
            stock: count(&row, "stock")?,
            attributes: attributes.0,
            image: row.try_get("image")?,
            version: row.try_get("version")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_sql_numbers_placeholders() {
        let updates = FieldUpdates::new()
            .set(Column::Quantity, 2_u32)
            .set(Column::Selected, true);
        let sql = update_sql(RowRef::item(CartItemId::new(4)), &updates);
        assert_eq!(
            sql,
            "UPDATE cart.cart_item SET quantity = $1, selected = $2, \
             version = version + 1 WHERE id = $3 AND version = $4"
        );
    }

    #[test]
    fn test_select_row_sql_lists_writable_columns() {
        assert_eq!(
            select_row_sql(Table::Sku),
            "SELECT version, stock, updated_at FROM catalog.sku WHERE id = $1"
        );
    }
}
