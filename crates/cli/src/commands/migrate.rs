//! Database migration command.
//!
//! # Usage
//!
//! ```bash
//! cart-cli migrate
//! ```
//!
//! # Environment Variables
//!
//! - `CART_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! # Migration Files
//!
//! Migrations live in `crates/engine/migrations/` and are embedded in the
//! binary at build time:
//! ```text
//! migrations/
//! ├── 20260101000000_create_catalog.sql
//! └── 20260101000001_create_cart.sql
//! ```

use cart_engine::EngineConfig;
use cart_engine::db::create_pool;

use super::CommandError;

/// Apply pending cart and catalog migrations.
pub async fn run() -> Result<(), CommandError> {
    let config = EngineConfig::from_env()?;

    tracing::info!("Connecting to cart database...");
    let pool = create_pool(&config.database_url).await?;

    tracing::info!("Running cart migrations...");
    cart_engine::state::migrate(&pool).await?;

    tracing::info!("Cart migrations complete!");
    Ok(())
}
