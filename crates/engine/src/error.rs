//! Unified error handling for cart operations.
//!
//! Provides the `CartError` type returned by every public operation. Store and
//! catalog failures bubble up unchanged inside [`CartError::Repository`];
//! lock and version conflicts only appear here once their own bounded retry
//! budget is spent.

use thiserror::Error;

use cart_core::Money;

use crate::db::RepositoryError;
use crate::kv::BackendError;

/// Error type for the cart engine's public surface.
#[derive(Debug, Error)]
pub enum CartError {
    /// Cart, item, product, or SKU is absent (or not sellable).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested quantity exceeds available stock.
    #[error("Insufficient stock: requested {requested}, available {available}")]
    InsufficientStock {
        /// Quantity the caller asked for (after merging).
        requested: u32,
        /// Quantity the catalog can supply.
        available: u32,
    },

    /// Optimistic retries exhausted while updating a versioned row.
    #[error("Concurrency conflict on {row} after {attempts} attempts")]
    ConcurrencyConflict {
        /// Row that kept changing underneath us.
        row: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Mutual exclusion for the cart could not be obtained.
    #[error("Cart is busy: {0}")]
    LockBusy(String),

    /// Bad quantity, malformed coupon, missing identity, etc.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checkout attempted without a fresh, successful sync.
    #[error("Cart state is stale: {0}")]
    StaleCartState(String),

    /// Persistent store failure.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Cache/lock backend failure.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl CartError {
    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockBusy(_) | Self::ConcurrencyConflict { .. })
    }

    /// Shorthand for a stock shortfall.
    #[must_use]
    pub const fn insufficient_stock(requested: u32, available: u32) -> Self {
        Self::InsufficientStock {
            requested,
            available,
        }
    }
}

/// Error raised by the pricing engine for inputs it cannot price.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    /// Coupon code is empty or has an impossible discount definition.
    #[error("malformed coupon {code}: {reason}")]
    MalformedCoupon {
        /// Coupon code as supplied.
        code: String,
        /// What is wrong with it.
        reason: String,
    },

    /// More points requested than the redemption rules allow.
    #[error("cannot redeem {requested} points (maximum worth {max_value})")]
    PointsExceedLimit {
        /// Points requested.
        requested: u64,
        /// Maximum value redeemable on this cart.
        max_value: Money,
    },
}

impl From<PricingError> for CartError {
    fn from(err: PricingError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result type alias for `CartError`.
pub type Result<T> = std::result::Result<T, CartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_error_display() {
        let err = CartError::NotFound("product 7".to_string());
        assert_eq!(err.to_string(), "Not found: product 7");

        let err = CartError::insufficient_stock(5, 2);
        assert_eq!(
            err.to_string(),
            "Insufficient stock: requested 5, available 2"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CartError::LockBusy("lock:cart:user:1".to_string()).is_retryable());
        assert!(
            CartError::ConcurrencyConflict {
                row: "cart.cart_item#1".to_string(),
                attempts: 4,
            }
            .is_retryable()
        );
        assert!(!CartError::Validation("quantity".to_string()).is_retryable());
        assert!(!CartError::StaleCartState("never synced".to_string()).is_retryable());
    }

    #[test]
    fn test_pricing_error_maps_to_validation() {
        let err: CartError = PricingError::MalformedCoupon {
            code: "X".to_string(),
            reason: "empty".to_string(),
        }
        .into();
        assert!(matches!(err, CartError::Validation(_)));
    }
}
