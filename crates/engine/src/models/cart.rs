//! Cart and cart item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cart_core::{
    CartId, CartItemId, CartStatus, ItemStatus, Money, ProductId, SessionToken, SkuId, UserId,
};

use super::catalog::SkuAttributes;

/// Who a cart belongs to. Exactly one active cart exists per owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    /// Authenticated shopper.
    User(UserId),
    /// Anonymous shopper identified by a session token.
    Session(SessionToken),
}

impl CartOwner {
    /// Stable key fragment used by cache and lock keys.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Session(token) => format!("session:{token}"),
        }
    }

    /// Whether this owner is an anonymous guest.
    #[must_use]
    pub const fn is_guest(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

impl std::fmt::Display for CartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Caller identity as presented by the request layer.
///
/// Either field may be present; an authenticated user id always wins over
/// the session token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<UserId>,
    pub session: Option<SessionToken>,
}

impl Identity {
    /// Identity of an authenticated shopper.
    #[must_use]
    pub const fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            session: None,
        }
    }

    /// Identity of a guest shopper.
    #[must_use]
    pub const fn guest(session: SessionToken) -> Self {
        Self {
            user_id: None,
            session: Some(session),
        }
    }

    /// Resolve to the owner whose cart this identity addresses.
    #[must_use]
    pub fn resolve(&self) -> Option<CartOwner> {
        match (&self.user_id, &self.session) {
            (Some(user_id), _) => Some(CartOwner::User(*user_id)),
            (None, Some(token)) => Some(CartOwner::Session(token.clone())),
            (None, None) => None,
        }
    }
}

/// A shopping cart row.
///
/// `item_count`, `total_qty` and `total_amount` are denormalised and are
/// rewritten from [`CartTotals::fold`] after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub owner: CartOwner,
    pub status: CartStatus,
    pub item_count: u32,
    pub total_qty: u32,
    pub total_amount: Money,
    pub version: i64,
    /// When the last user-initiated sync completed.
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: CartItemId,
    pub cart_id: CartId,
    pub product_id: ProductId,
    /// `None` when the product is sold without variants.
    pub sku_id: Option<SkuId>,
    pub quantity: u32,
    pub selected: bool,
    pub status: ItemStatus,
    /// Price snapshot; authoritative for pricing until reconciliation replaces it.
    pub price: Money,
    /// Unit weight in kilograms, refreshed together with the price snapshot.
    pub weight: Decimal,
    /// Display snapshot, immutable after the line is created.
    pub name: String,
    pub image: Option<String>,
    pub sku_attributes: SkuAttributes,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartItem {
    /// Snapshot price times quantity.
    #[must_use]
    pub fn line_total(&self) -> Money {
        self.price * self.quantity
    }
}

/// Fields for inserting a new cart line.
#[derive(Debug, Clone)]
pub struct NewCartItem {
    pub cart_id: CartId,
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub quantity: u32,
    pub price: Money,
    pub weight: Decimal,
    pub name: String,
    pub image: Option<String>,
    pub sku_attributes: SkuAttributes,
}

/// Cart aggregate fields derived from its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CartTotals {
    /// Number of lines, any status.
    pub item_count: u32,
    /// Sum of quantities, any status.
    pub total_qty: u32,
    /// Sum of line totals over purchasable lines.
    pub total_amount: Money,
}

impl CartTotals {
    /// Fold the aggregate fields over a cart's current items.
    #[must_use]
    pub fn fold(items: &[CartItem]) -> Self {
        items.iter().fold(Self::default(), |mut acc, item| {
            acc.item_count += 1;
            acc.total_qty += item.quantity;
            if item.status.is_purchasable() {
                acc.total_amount += item.line_total();
            }
            acc
        })
    }

    /// Whether a stored cart row already carries these totals.
    #[must_use]
    pub fn matches(&self, cart: &Cart) -> bool {
        self.item_count == cart.item_count
            && self.total_qty == cart.total_qty
            && self.total_amount == cart.total_amount
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn item(id: i64, price_cents: i64, quantity: u32, status: ItemStatus) -> CartItem {
        let now = Utc::now();
        CartItem {
            id: CartItemId::new(id),
            cart_id: CartId::new(1),
            product_id: ProductId::new(id),
            sku_id: None,
            quantity,
            selected: true,
            status,
            price: Money::from_cents(price_cents),
            weight: Decimal::ONE,
            name: format!("product {id}"),
            image: None,
            sku_attributes: SkuAttributes::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_identity_prefers_user_over_session() {
        let identity = Identity {
            user_id: Some(UserId::new(9)),
            session: Some(SessionToken::parse("guest-1").unwrap()),
        };
        assert_eq!(identity.resolve(), Some(CartOwner::User(UserId::new(9))));
    }

    #[test]
    fn test_identity_without_credentials_resolves_to_none() {
        assert_eq!(Identity::default().resolve(), None);
    }

    #[test]
    fn test_owner_keys() {
        assert_eq!(CartOwner::User(UserId::new(3)).key(), "user:3");
        let guest = CartOwner::Session(SessionToken::parse("abc").unwrap());
        assert_eq!(guest.key(), "session:abc");
        assert!(guest.is_guest());
    }

    #[test]
    fn test_totals_fold_counts_all_lines_but_prices_only_normal() {
        let items = vec![
            item(1, 5000, 2, ItemStatus::Normal),
            item(2, 3000, 1, ItemStatus::Normal),
            item(3, 1000, 4, ItemStatus::OutOfStock),
        ];
        let totals = CartTotals::fold(&items);
        assert_eq!(totals.item_count, 3);
        assert_eq!(totals.total_qty, 7);
        assert_eq!(totals.total_amount, Money::from_cents(13_000));
    }
}
