//! Reconciliation of carts against catalog changes.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use cart_core::{CatalogStatus, ItemStatus, Money};
use cart_engine::kv::KeyValueBackend;
use cart_engine::lock::{KvLockManager, LockManager, lock_key};
use cart_engine::pricing::PricingOptions;
use cart_integration_tests::{TestContext, user};

#[tokio::test]
async fn test_short_stock_then_auto_fix_clamps() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    let item = ctx.service().add_item(&me, product, None, 5).await.unwrap();

    ctx.store.set_product_stock(product, 2).await;
    let report = ctx.service().sync_cart(&me).await.unwrap();

    assert_eq!(report.checked_items, 1);
    assert_eq!(report.updated_items, 1);
    assert_eq!(report.stock_issues.len(), 1);
    assert_eq!(report.stock_issues[0].requested, 5);
    assert_eq!(report.stock_issues[0].available, 2);
    assert!(report.has_adjustments());
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::OutOfStock);

    // Out-of-stock lines are not priced
    let priced = ctx
        .service()
        .calculate(&me, &PricingOptions::default())
        .await
        .unwrap();
    assert_eq!(priced.selected_amount, Money::ZERO);

    let fixed = ctx.service().auto_fix(&me).await.unwrap();
    assert_eq!(fixed.clamped.len(), 1);
    assert_eq!(fixed.clamped[0].item_id, item.id);
    assert_eq!(fixed.clamped[0].from, 5);
    assert_eq!(fixed.clamped[0].to, 2);
    assert!(fixed.invalidated.is_empty());

    let line = &ctx.items(&me).await[0];
    assert_eq!(line.status, ItemStatus::Normal);
    assert_eq!(line.quantity, 2);
    let cart = ctx.cart(&me).await.unwrap();
    assert_eq!(cart.total_qty, 2);
    assert_eq!(cart.total_amount, Money::from_cents(2000));
}

#[tokio::test]
async fn test_auto_fix_invalidates_lines_without_stock() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    let item = ctx.service().add_item(&me, product, None, 3).await.unwrap();

    ctx.store.set_product_stock(product, 0).await;
    let fixed = ctx.service().auto_fix(&me).await.unwrap();

    assert_eq!(fixed.sync.stock_issues.len(), 1);
    assert_eq!(fixed.invalidated, vec![item.id]);
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::Invalid);

    // Invalid is terminal: restocking does not bring the line back
    ctx.store.set_product_stock(product, 10).await;
    let report = ctx.service().sync_cart(&me).await.unwrap();
    assert_eq!(report.checked_items, 0);
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::Invalid);
}

#[tokio::test]
async fn test_price_change_is_applied_once() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    let item = ctx.service().add_item(&me, product, None, 2).await.unwrap();

    ctx.store.set_product_price(product, Money::from_cents(1250)).await;
    let first = ctx.service().sync_cart(&me).await.unwrap();

    assert_eq!(first.updated_items, 1);
    assert_eq!(first.price_changes.len(), 1);
    assert_eq!(first.price_changes[0].item_id, item.id);
    assert_eq!(first.price_changes[0].old_price, Money::from_cents(1000));
    assert_eq!(first.price_changes[0].new_price, Money::from_cents(1250));

    let line = &ctx.items(&me).await[0];
    assert_eq!(line.price, Money::from_cents(1250));
    assert_eq!(line.status, ItemStatus::Normal);
    assert_eq!(
        ctx.cart(&me).await.unwrap().total_amount,
        Money::from_cents(2500)
    );

    let second = ctx.service().sync_cart(&me).await.unwrap();
    assert_eq!(second.updated_items, 0);
    assert!(second.price_changes.is_empty());
    assert!(!second.has_adjustments());
    assert_eq!(ctx.items(&me).await[0].version, line.version);
}

#[tokio::test]
async fn test_stock_recovery_restores_line() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, product, None, 4).await.unwrap();

    ctx.store.set_product_stock(product, 1).await;
    ctx.service().sync_cart(&me).await.unwrap();
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::OutOfStock);

    ctx.store.set_product_stock(product, 4).await;
    let report = ctx.service().sync_cart(&me).await.unwrap();
    assert!(report.stock_issues.is_empty());
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::Normal);
}

#[tokio::test]
async fn test_removed_variant_invalidates_line() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let sku = ctx.sku(11, product, 1100, 10).await;
    let me = user(1);
    let item = ctx.service().add_item(&me, product, Some(sku), 1).await.unwrap();

    ctx.store.remove_sku(sku).await;
    let report = ctx.service().sync_cart(&me).await.unwrap();

    assert_eq!(report.invalidated, vec![item.id]);
    assert_eq!(ctx.items(&me).await[0].status, ItemStatus::Invalid);
    assert_eq!(ctx.cart(&me).await.unwrap().total_amount, Money::ZERO);
}

#[tokio::test]
async fn test_inactive_product_invalidates_line() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, product, None, 1).await.unwrap();

    ctx.store.set_product_status(product, CatalogStatus::Inactive).await;
    let report = ctx.service().sync_cart(&me).await.unwrap();
    assert_eq!(report.invalidated.len(), 1);
    assert_eq!(ctx.service().item_count(&me).await.unwrap(), 1);

    let view = ctx.service().get_cart(&me, false).await.unwrap();
    assert!(view.items.is_empty());
    assert_eq!(view.summary.invalid_items.len(), 1);
}

#[tokio::test]
async fn test_sync_invalidates_cached_view() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, product, None, 1).await.unwrap();

    ctx.service().get_cart(&me, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    ctx.store.set_product_price(product, Money::from_cents(900)).await;
    // The cached view still carries the old snapshot until a sync
    let cached = ctx.service().get_cart(&me, false).await.unwrap();
    assert_eq!(cached.items[0].price, Money::from_cents(1000));

    ctx.service().sync_cart(&me).await.unwrap();
    let fresh = ctx.service().get_cart(&me, false).await.unwrap();
    assert_eq!(fresh.items[0].price, Money::from_cents(900));
}

#[tokio::test]
async fn test_sweep_reconciles_every_active_cart() {
    let ctx = TestContext::new();
    let changed = ctx.product(1, 1000, 10).await;
    let steady = ctx.product(2, 2000, 10).await;
    let (a, b, c) = (user(1), user(2), user(3));
    ctx.service().add_item(&a, changed, None, 1).await.unwrap();
    ctx.service().add_item(&b, steady, None, 1).await.unwrap();
    ctx.service().add_item(&c, changed, None, 2).await.unwrap();

    ctx.store.set_product_price(changed, Money::from_cents(1100)).await;
    let report = ctx.service().sweep().await.unwrap();

    assert_eq!(report.carts_checked, 3);
    assert_eq!(report.carts_updated, 2);
    assert_eq!(report.items_updated, 2);
    assert_eq!(report.carts_skipped, 0);
    assert_eq!(report.carts_failed, 0);
    assert_eq!(
        ctx.cart(&c).await.unwrap().total_amount,
        Money::from_cents(2200)
    );

    // A background sweep does not count as a checkout sync
    assert!(ctx.cart(&a).await.unwrap().synced_at.is_none());

    let again = ctx.service().sweep().await.unwrap();
    assert_eq!(again.carts_checked, 3);
    assert_eq!(again.carts_updated, 0);
}

#[tokio::test]
async fn test_sweep_skips_locked_carts() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let (busy, idle) = (user(1), user(2));
    ctx.service().add_item(&busy, product, None, 1).await.unwrap();
    ctx.service().add_item(&idle, product, None, 1).await.unwrap();
    ctx.store.set_product_price(product, Money::from_cents(1500)).await;

    let manager = KvLockManager::new(std::sync::Arc::new(ctx.kv.clone()));
    let key = lock_key(&busy.resolve().unwrap());
    let token = manager
        .acquire(&key, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let report = ctx.service().sweep().await.unwrap();
    assert_eq!(report.carts_skipped, 1);
    assert_eq!(report.carts_checked, 1);
    assert_eq!(ctx.items(&busy).await[0].price, Money::from_cents(1000));
    assert_eq!(ctx.items(&idle).await[0].price, Money::from_cents(1500));

    assert!(manager.release(&key, &token).await.unwrap());
    let report = ctx.service().sweep().await.unwrap();
    assert_eq!(report.carts_skipped, 0);
    assert_eq!(ctx.items(&busy).await[0].price, Money::from_cents(1500));
    assert_eq!(ctx.kv.count_prefix("lock:cart:").await.unwrap(), 0);
}

#[tokio::test]
async fn test_scheduled_sweeper_runs_until_stopped() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, product, None, 1).await.unwrap();

    let sweeper = ctx
        .service()
        .sync_engine()
        .spawn_sweeper(Duration::from_millis(20));
    ctx.store.set_product_price(product, Money::from_cents(800)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    sweeper.stop().await;

    assert_eq!(ctx.items(&me).await[0].price, Money::from_cents(800));
}
