//! Engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CART_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! ## Optional
//! - `CART_REDIS_URL` - Shared lock/cache backend; in-process when unset
//! - `CART_LOCK_TTL_SECS` - Cart lock expiry (default: 10)
//! - `CART_LOCK_ATTEMPTS` - Lock acquisition attempts (default: 3)
//! - `CART_LOCK_RETRY_MS` - Pause between lock attempts (default: 50)
//! - `CART_OCC_MAX_RETRIES` - Optimistic update retries (default: 3)
//! - `CART_OCC_BASE_DELAY_MS` - First retry delay (default: 10)
//! - `CART_OCC_BACKOFF_FACTOR` - Retry delay growth (default: 2.0)
//! - `CART_CACHE_GUEST_TTL_SECS` - Guest cart view retention (default: 7 days)
//! - `CART_CACHE_USER_TTL_SECS` - User cart view retention (default: 30 minutes)
//! - `CART_SYNC_INTERVAL_SECS` - Sweeper period (default: 300)
//! - `CART_SYNC_BATCH_SIZE` - Carts per sweep page (default: 100)
//! - `CART_SYNC_MAX_AGE_SECS` - How old a sync may be at checkout (default: 900)
//! - `CART_GUEST_EXPIRY_DAYS` - Idle days before a guest cart expires (default: 30)
//! - `CART_FREE_SHIPPING_THRESHOLD` - Selected amount for free shipping (default: 99.00)
//! - `SENTRY_DSN` - Sentry error tracking DSN

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use thiserror::Error;

use cart_core::Money;

use crate::cache::CacheTtl;
use crate::lock::LockPolicy;
use crate::occ::RetryPolicy;
use crate::pricing::PricingRules;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Reconciliation cadence and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Period of the scheduled sweep.
    pub interval: Duration,
    /// Carts loaded per sweep page.
    pub batch_size: u32,
    /// Oldest sync accepted by checkout.
    pub max_age: Duration,
    /// Idle time after which a guest cart expires.
    pub guest_expiry: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 100,
            max_age: Duration::from_secs(900),
            guest_expiry: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Tunables shared by every backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub lock: LockPolicy,
    pub retry: RetryPolicy,
    pub cache_ttl: CacheTtl,
    pub sync: SyncSettings,
    pub pricing: PricingRules,
}

/// Engine configuration for a production deployment.
#[derive(Clone)]
pub struct EngineConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// Redis URL for shared locks and cache
    pub redis_url: Option<SecretString>,
    pub settings: EngineSettings,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("settings", &self.settings)
            .field("sentry_dsn", &self.sentry_dsn)
            .finish()
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the database URL is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_database_url("CART_DATABASE_URL")?,
            redis_url: get_optional_env("CART_REDIS_URL").map(SecretString::from),
            settings: EngineSettings::from_env()?,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
        })
    }
}

impl EngineSettings {
    /// Load tunables from environment variables, defaulting each one.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` for a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lock = LockPolicy {
            ttl: secs("CART_LOCK_TTL_SECS", defaults.lock.ttl)?,
            attempts: parse_env("CART_LOCK_ATTEMPTS", defaults.lock.attempts)?,
            retry_delay: millis("CART_LOCK_RETRY_MS", defaults.lock.retry_delay)?,
        };

        let backoff_factor = parse_env("CART_OCC_BACKOFF_FACTOR", defaults.retry.backoff_factor)?;
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(ConfigError::InvalidEnvVar(
                "CART_OCC_BACKOFF_FACTOR".to_string(),
                "must be a finite number >= 1".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_retries: parse_env("CART_OCC_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: millis("CART_OCC_BASE_DELAY_MS", defaults.retry.base_delay)?,
            backoff_factor,
        };

        let cache_ttl = CacheTtl {
            guest: secs("CART_CACHE_GUEST_TTL_SECS", defaults.cache_ttl.guest)?,
            user: secs("CART_CACHE_USER_TTL_SECS", defaults.cache_ttl.user)?,
        };

        let guest_expiry_days: u64 = parse_env(
            "CART_GUEST_EXPIRY_DAYS",
            defaults.sync.guest_expiry.as_secs() / 86_400,
        )?;
        let sync = SyncSettings {
            interval: secs("CART_SYNC_INTERVAL_SECS", defaults.sync.interval)?,
            batch_size: parse_env("CART_SYNC_BATCH_SIZE", defaults.sync.batch_size)?,
            max_age: secs("CART_SYNC_MAX_AGE_SECS", defaults.sync.max_age)?,
            guest_expiry: Duration::from_secs(guest_expiry_days.saturating_mul(86_400)),
        };

        let mut pricing = defaults.pricing;
        let threshold: Decimal = parse_env(
            "CART_FREE_SHIPPING_THRESHOLD",
            pricing.shipping.free_threshold.amount(),
        )?;
        pricing.shipping.free_threshold = Money::new(threshold);

        Ok(Self {
            lock,
            retry,
            cache_ttl,
            sync,
            pricing,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, or return `default` when unset.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get_optional_env(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_env(key, default_ms).map(Duration::from_millis)
}
