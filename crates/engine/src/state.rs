//! Engine state: backends wired into a [`CartService`].

use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::{EngineConfig, EngineSettings};
use crate::db::{self, MemoryStore, PgStore};
use crate::kv::{BackendError, KeyValueBackend, MemoryBackend};
use crate::service::{Backends, CartService};

/// Embedded schema migrations for the cart and catalog tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Error bringing the engine up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("key-value backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("CART_REDIS_URL is set but the `redis` feature is not enabled")]
    RedisDisabled,
}

/// Running engine shared across request handlers and background tasks.
///
/// This struct is cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct CartEngine {
    inner: Arc<CartEngineInner>,
}

struct CartEngineInner {
    settings: EngineSettings,
    pool: Option<PgPool>,
    service: CartService,
}

impl CartEngine {
    /// Connect to `PostgreSQL` and the configured key-value backend.
    ///
    /// Migrations are not applied here; run them with [`migrate`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database or Redis cannot be reached.
    pub async fn connect(config: &EngineConfig) -> Result<Self, StartupError> {
        let pool = db::create_pool(&config.database_url).await?;
        tracing::info!("Database pool created");

        let kv = match &config.redis_url {
            Some(url) => redis_backend(url.expose_secret()).await?,
            None => {
                tracing::info!("No Redis configured, using in-process lock and cache backend");
                Arc::new(MemoryBackend::default()) as Arc<dyn KeyValueBackend>
            }
        };

        let store = PgStore::new(pool.clone());
        let backends = Backends {
            carts: Arc::new(store.clone()),
            rows: Arc::new(store.clone()),
            catalog: Arc::new(store),
            kv,
        };

        Ok(Self::build(config.settings.clone(), Some(pool), backends))
    }

    /// Engine over in-process backends, for tests and local tooling.
    #[must_use]
    pub fn in_memory(store: &MemoryStore, kv: MemoryBackend, settings: EngineSettings) -> Self {
        let backends = Backends {
            carts: Arc::new(store.clone()),
            rows: Arc::new(store.clone()),
            catalog: Arc::new(store.clone()),
            kv: Arc::new(kv),
        };
        Self::build(settings, None, backends)
    }

    /// Engine over caller-supplied backends.
    #[must_use]
    pub fn with_backends(backends: Backends, settings: EngineSettings) -> Self {
        Self::build(settings, None, backends)
    }

    fn build(settings: EngineSettings, pool: Option<PgPool>, backends: Backends) -> Self {
        let service = CartService::new(backends, settings.clone());
        Self {
            inner: Arc::new(CartEngineInner {
                settings,
                pool,
                service,
            }),
        }
    }

    /// Get a reference to the cart operations.
    #[must_use]
    pub fn service(&self) -> &CartService {
        &self.inner.service
    }

    /// Get a reference to the engine tunables.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// The database pool, when backed by `PostgreSQL`.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.inner.pool.as_ref()
    }
}

/// Apply pending schema migrations.
///
/// # Errors
///
/// Returns `MigrateError` if a migration fails or the history diverges.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(feature = "redis")]
async fn redis_backend(url: &str) -> Result<Arc<dyn KeyValueBackend>, StartupError> {
    let backend = crate::kv::RedisBackend::connect(url).await?;
    tracing::info!("Connected to Redis");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn redis_backend(_url: &str) -> Result<Arc<dyn KeyValueBackend>, StartupError> {
    Err(StartupError::RedisDisabled)
}
