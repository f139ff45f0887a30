//! Status enums for carts, cart items, and catalog entries.
//!
//! Statuses are persisted as lowercase `snake_case` text and parsed back with
//! `FromStr`; an unknown value in storage is a data-corruption error for the
//! caller to surface, never a silent default.

use serde::{Deserialize, Serialize};

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseStatusError {
    /// Which status type was being parsed.
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

/// Lifecycle status of a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    /// The one cart currently used by its owner.
    #[default]
    Active,
    /// A guest cart whose items were folded into an authenticated cart.
    Merged,
    /// A guest cart abandoned for longer than the retention window.
    Expired,
}

impl CartStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CartStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "merged" => Ok(Self::Merged),
            "expired" => Ok(Self::Expired),
            _ => Err(ParseStatusError::new("cart status", s)),
        }
    }
}

/// Validity status of a cart line, owned by catalog reconciliation.
///
/// Independent from the user-controlled `selected` flag: only
/// [`ItemStatus::Normal`] lines are priced, selected or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Purchasable at the snapshot price.
    #[default]
    Normal,
    /// Product or SKU is gone or inactive. Terminal until removed.
    Invalid,
    /// Snapshot price was refreshed from the catalog.
    PriceChanged,
    /// Available stock is below the requested quantity.
    OutOfStock,
}

impl ItemStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Invalid => "invalid",
            Self::PriceChanged => "price_changed",
            Self::OutOfStock => "out_of_stock",
        }
    }

    /// Whether the line takes part in pricing.
    #[must_use]
    pub const fn is_purchasable(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "invalid" => Ok(Self::Invalid),
            "price_changed" => Ok(Self::PriceChanged),
            "out_of_stock" => Ok(Self::OutOfStock),
            _ => Err(ParseStatusError::new("item status", s)),
        }
    }
}

/// Publication status of a product or SKU in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    /// On sale.
    #[default]
    Active,
    /// Temporarily withdrawn from sale.
    Inactive,
    /// Soft-deleted.
    Deleted,
}

impl CatalogStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }

    /// Whether entries in this state may be sold.
    #[must_use]
    pub const fn is_sellable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CatalogStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "deleted" => Ok(Self::Deleted),
            _ => Err(ParseStatusError::new("catalog status", s)),
        }
    }
}

/// Membership tier of the cart owner, driving the membership discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberTier {
    /// Guests and members without a paid tier.
    #[default]
    Regular,
    Silver,
    Gold,
    Platinum,
}

impl std::fmt::Display for MemberTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Silver => write!(f, "silver"),
            Self::Gold => write!(f, "gold"),
            Self::Platinum => write!(f, "platinum"),
        }
    }
}

impl std::str::FromStr for MemberTier {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            "platinum" => Ok(Self::Platinum),
            _ => Err(ParseStatusError::new("member tier", s)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_round_trips_through_text() {
        for status in [
            ItemStatus::Normal,
            ItemStatus::Invalid,
            ItemStatus::PriceChanged,
            ItemStatus::OutOfStock,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        let err = "archived".parse::<CartStatus>().unwrap_err();
        assert_eq!(err.to_string(), "invalid cart status: archived");
    }

    #[test]
    fn test_only_normal_items_are_purchasable() {
        assert!(ItemStatus::Normal.is_purchasable());
        assert!(!ItemStatus::PriceChanged.is_purchasable());
        assert!(!ItemStatus::OutOfStock.is_purchasable());
        assert!(!ItemStatus::Invalid.is_purchasable());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ItemStatus::OutOfStock).unwrap();
        assert_eq!(json, "\"out_of_stock\"");
        let tier: MemberTier = serde_json::from_str("\"gold\"").unwrap();
        assert_eq!(tier, MemberTier::Gold);
    }
}
