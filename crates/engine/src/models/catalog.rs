//! Catalog views consumed by the cart engine.
//!
//! The catalog is owned by another service; these types describe only what
//! the cart reads from it.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cart_core::{CatalogStatus, Money, ProductId, SkuId};

/// Variant attributes such as `color -> red`, ordered for stable output.
pub type SkuAttributes = BTreeMap<String, String>;

/// Product as seen by the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: ProductId,
    pub name: String,
    pub image: Option<String>,
    pub status: CatalogStatus,
    pub price: Money,
    pub stock: u32,
    /// Unit weight in kilograms.
    pub weight: Decimal,
    pub version: i64,
}

/// SKU (variant) as seen by the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuInfo {
    pub id: SkuId,
    pub product_id: ProductId,
    pub status: CatalogStatus,
    pub price: Money,
    pub stock: u32,
    pub attributes: SkuAttributes,
    pub image: Option<String>,
    pub version: i64,
}

/// Effective purchase terms for a (product, sku) pair.
///
/// With a SKU, price, stock and attributes come from the SKU; without one
/// the product's own price and stock apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub name: String,
    pub image: Option<String>,
    pub price: Money,
    pub stock: u32,
    pub weight: Decimal,
    pub attributes: SkuAttributes,
}

impl Offer {
    /// Combine a product and optional SKU into an offer.
    ///
    /// Returns `None` when either side is not sellable or the SKU belongs to
    /// a different product.
    #[must_use]
    pub fn resolve(product: &ProductInfo, sku: Option<&SkuInfo>) -> Option<Self> {
        if !product.status.is_sellable() {
            return None;
        }

        match sku {
            None => Some(Self {
                product_id: product.id,
                sku_id: None,
                name: product.name.clone(),
                image: product.image.clone(),
                price: product.price,
                stock: product.stock,
                weight: product.weight,
                attributes: SkuAttributes::new(),
            }),
            Some(sku) if sku.product_id == product.id && sku.status.is_sellable() => Some(Self {
                product_id: product.id,
                sku_id: Some(sku.id),
                name: product.name.clone(),
                image: sku.image.clone().or_else(|| product.image.clone()),
                price: sku.price,
                stock: sku.stock,
                weight: product.weight,
                attributes: sku.attributes.clone(),
            }),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn product(id: i64, price_cents: i64, stock: u32) -> ProductInfo {
        ProductInfo {
            id: ProductId::new(id),
            name: format!("product {id}"),
            image: Some(format!("https://cdn.example.test/{id}.jpg")),
            status: CatalogStatus::Active,
            price: Money::from_cents(price_cents),
            stock,
            weight: Decimal::new(5, 1),
            version: 1,
        }
    }

    pub(crate) fn sku(id: i64, product_id: i64, price_cents: i64, stock: u32) -> SkuInfo {
        SkuInfo {
            id: SkuId::new(id),
            product_id: ProductId::new(product_id),
            status: CatalogStatus::Active,
            price: Money::from_cents(price_cents),
            stock,
            attributes: SkuAttributes::from([("size".to_string(), "M".to_string())]),
            image: None,
            version: 1,
        }
    }

    #[test]
    fn test_offer_without_sku_uses_product_terms() {
        let offer = Offer::resolve(&product(1, 1999, 4), None);
        let offer = offer.as_ref();
        assert_eq!(offer.map(|o| o.price), Some(Money::from_cents(1999)));
        assert_eq!(offer.map(|o| o.stock), Some(4));
    }

    #[test]
    fn test_offer_with_sku_uses_sku_terms() {
        let offer = Offer::resolve(&product(1, 1999, 4), Some(&sku(10, 1, 2499, 2)));
        let offer = offer.as_ref();
        assert_eq!(offer.map(|o| o.price), Some(Money::from_cents(2499)));
        assert_eq!(offer.map(|o| o.stock), Some(2));
        assert_eq!(
            offer.and_then(|o| o.attributes.get("size").cloned()),
            Some("M".to_string())
        );
    }

    #[test]
    fn test_inactive_or_foreign_sku_is_not_an_offer() {
        let mut p = product(1, 1999, 4);
        assert!(Offer::resolve(&p, Some(&sku(10, 2, 2499, 2))).is_none());

        let mut s = sku(10, 1, 2499, 2);
        s.status = CatalogStatus::Inactive;
        assert!(Offer::resolve(&p, Some(&s)).is_none());

        p.status = CatalogStatus::Deleted;
        assert!(Offer::resolve(&p, None).is_none());
    }
}
