//! Persistent store for carts and cart items.
//!
//! # Database: `cart`
//!
//! ## Tables
//!
//! - `cart.cart` - One row per cart; one `active` cart per owner (partial unique indexes)
//! - `cart.cart_item` - Cart lines, unique per `(cart_id, product_id, sku_id)`
//! - `catalog.product`, `catalog.sku` - Read-only here apart from version-checked stock
//!
//! Every mutable row carries a `version` column used by [`crate::occ`].
//!
//! # Migrations
//!
//! Migrations are stored in `crates/engine/migrations/` and run via:
//! ```bash
//! cargo run -p cart-cli -- migrate
//! ```
//!
//! # Backends
//!
//! - [`postgres::PgStore`] - production store
//! - [`memory::MemoryStore`] - in-process store for tests and local development

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use cart_core::{CartId, CartItemId, ProductId, SkuId};

use crate::models::{Cart, CartItem, CartOwner, NewCartItem};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., a second active cart for one owner).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// Write the store cannot express (unknown column, wrong value type).
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Row-level access to carts and their items.
///
/// Field updates on existing rows (quantities, flags, statuses, aggregates)
/// are not part of this trait: they go through
/// [`OptimisticController`](crate::occ::OptimisticController) so that every
/// racy write is version-checked.
#[async_trait]
pub trait CartRepository: Send + Sync {
    /// The owner's active cart, if any.
    async fn find_active_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError>;

    /// Create an active cart for `owner`.
    ///
    /// Returns `RepositoryError::Conflict` if the owner already has one.
    async fn create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError>;

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>, RepositoryError>;

    /// All lines of a cart, oldest first.
    async fn list_items(&self, cart_id: CartId) -> Result<Vec<CartItem>, RepositoryError>;

    async fn get_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Option<CartItem>, RepositoryError>;

    /// The line for `(product, sku)` in a cart, if present.
    async fn find_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        sku_id: Option<SkuId>,
    ) -> Result<Option<CartItem>, RepositoryError>;

    /// Insert a new line with status `normal`, selected, version 1.
    ///
    /// Returns `RepositoryError::Conflict` if the `(product, sku)` pair is
    /// already in the cart.
    async fn insert_item(&self, item: NewCartItem) -> Result<CartItem, RepositoryError>;

    /// Delete the given lines of a cart; returns how many were removed.
    async fn delete_items(
        &self,
        cart_id: CartId,
        item_ids: &[CartItemId],
    ) -> Result<u64, RepositoryError>;

    /// Delete every line of a cart.
    async fn delete_all_items(&self, cart_id: CartId) -> Result<u64, RepositoryError>;

    /// Active carts ordered by id, starting after `after`, at most `limit`.
    async fn list_active_carts(
        &self,
        after: Option<CartId>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError>;

    /// Active guest carts not updated since `idle_since`, at most `limit`.
    async fn list_idle_guest_carts(
        &self,
        idle_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError>;
}
