//! Catalog collaborator boundary.
//!
//! The catalog (products, SKUs, prices, stock) is owned elsewhere. The cart
//! reads it through [`Catalog`] and adjusts stock only through
//! [`Inventory`], which uses the same optimistic controller as cart rows.

use async_trait::async_trait;
use tracing::{info, instrument};

use cart_core::{ProductId, SkuId};

use crate::db::RepositoryError;
use crate::error::{CartError, Result};
use crate::models::{Offer, ProductInfo, SkuInfo};
use crate::occ::{BatchOp, Column, FieldUpdates, OptimisticController, RowRef, UpdateOutcome};

/// Read access to catalog truth.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_product(&self, id: ProductId) -> std::result::Result<Option<ProductInfo>, RepositoryError>;

    async fn get_sku(&self, id: SkuId) -> std::result::Result<Option<SkuInfo>, RepositoryError>;
}

/// Look up the current purchase terms for a `(product, sku)` pair.
///
/// Returns `Ok(None)` when the product or SKU is missing or not sellable.
///
/// # Errors
///
/// Propagates catalog read failures.
pub async fn find_offer(
    catalog: &dyn Catalog,
    product_id: ProductId,
    sku_id: Option<SkuId>,
) -> std::result::Result<Option<Offer>, RepositoryError> {
    let Some(product) = catalog.get_product(product_id).await? else {
        return Ok(None);
    };

    let sku = match sku_id {
        Some(id) => match catalog.get_sku(id).await? {
            Some(sku) => Some(sku),
            None => return Ok(None),
        },
        None => None,
    };

    Ok(Offer::resolve(&product, sku.as_ref()))
}

/// Like [`find_offer`], but absent offers become `CartError::NotFound`.
///
/// # Errors
///
/// `NotFound` for a missing or inactive product/SKU.
pub async fn require_offer(
    catalog: &dyn Catalog,
    product_id: ProductId,
    sku_id: Option<SkuId>,
) -> Result<Offer> {
    find_offer(catalog, product_id, sku_id).await?.ok_or_else(|| {
        CartError::NotFound(match sku_id {
            Some(sku) => format!("product {product_id} sku {sku}"),
            None => format!("product {product_id}"),
        })
    })
}

/// One product/SKU quantity to take from or return to stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub quantity: u32,
}

impl StockLine {
    /// The row holding this line's stock counter.
    #[must_use]
    pub const fn stock_row(&self) -> RowRef {
        match self.sku_id {
            Some(sku) => RowRef::sku(sku),
            None => RowRef::product(self.product_id),
        }
    }
}

/// Version-checked stock adjustments.
#[derive(Clone)]
pub struct Inventory {
    occ: OptimisticController,
}

impl Inventory {
    #[must_use]
    pub const fn new(occ: OptimisticController) -> Self {
        Self { occ }
    }

    /// Take stock for every line, or for none of them.
    ///
    /// # Errors
    ///
    /// `InsufficientStock` for the first line that cannot be covered,
    /// `ConcurrencyConflict` if a stock row keeps changing, `Validation` for a
    /// zero quantity.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(&self, lines: &[StockLine]) -> Result<Vec<UpdateOutcome>> {
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(CartError::Validation(format!(
                "cannot reserve zero units of product {}",
                line.product_id
            )));
        }

        let ops = lines
            .iter()
            .map(|line| {
                let quantity = line.quantity;
                BatchOp::new(line.stock_row(), move |snapshot| {
                    let stock = snapshot.count(Column::Stock).ok_or_else(|| {
                        RepositoryError::DataCorruption("stock column missing".to_owned())
                    })?;
                    if stock < quantity {
                        return Err(CartError::insufficient_stock(quantity, stock));
                    }
                    Ok(FieldUpdates::new()
                        .set(Column::Stock, stock - quantity)
                        .set(Column::UpdatedAt, chrono::Utc::now()))
                })
            })
            .collect();

        let outcomes = self.occ.update_batch(ops).await?;
        info!(lines = lines.len(), "Stock reserved");
        Ok(outcomes)
    }

    /// Return previously reserved stock.
    ///
    /// # Errors
    ///
    /// As [`reserve`](Self::reserve), minus the stock check.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn restore(&self, lines: &[StockLine]) -> Result<Vec<UpdateOutcome>> {
        let ops = lines
            .iter()
            .map(|line| {
                let quantity = line.quantity;
                BatchOp::new(line.stock_row(), move |snapshot| {
                    let stock = snapshot.count(Column::Stock).ok_or_else(|| {
                        RepositoryError::DataCorruption("stock column missing".to_owned())
                    })?;
                    Ok(FieldUpdates::new()
                        .set(Column::Stock, stock.saturating_add(quantity))
                        .set(Column::UpdatedAt, chrono::Utc::now()))
                })
            })
            .collect();

        self.occ.update_batch(ops).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::catalog::tests::{product, sku};
    use crate::occ::RetryPolicy;

    #[tokio::test]
    async fn test_find_offer_missing_product() {
        let store = MemoryStore::new();
        let offer = find_offer(&store, ProductId::new(1), None).await.unwrap();
        assert!(offer.is_none());
    }

    #[tokio::test]
    async fn test_require_offer_reports_not_found() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 5)).await;
        let err = require_offer(&store, ProductId::new(1), Some(SkuId::new(3)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Not found: product 1 sku 3");
    }

    #[tokio::test]
    async fn test_reserve_decrements_sku_stock() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 5)).await;
        store.put_sku(sku(10, 1, 1200, 4)).await;
        let inventory = Inventory::new(OptimisticController::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
        ));

        inventory
            .reserve(&[StockLine {
                product_id: ProductId::new(1),
                sku_id: Some(SkuId::new(10)),
                quantity: 3,
            }])
            .await
            .unwrap();

        let sku = store.get_sku(SkuId::new(10)).await.unwrap().unwrap();
        assert_eq!(sku.stock, 1);
        assert_eq!(sku.version, 2);
        let product = store.get_product(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(product.stock, 5);
    }

    #[tokio::test]
    async fn test_reserve_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.put_product(product(1, 1000, 5)).await;
        store.put_product(product(2, 1000, 1)).await;
        let inventory = Inventory::new(OptimisticController::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
        ));

        let err = inventory
            .reserve(&[
                StockLine {
                    product_id: ProductId::new(1),
                    sku_id: None,
                    quantity: 2,
                },
                StockLine {
                    product_id: ProductId::new(2),
                    sku_id: None,
                    quantity: 2,
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CartError::InsufficientStock {
                requested: 2,
                available: 1
            }
        ));
        let first = store.get_product(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(first.stock, 5);
    }
}
