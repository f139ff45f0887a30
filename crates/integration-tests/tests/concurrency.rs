//! Concurrent access: cart locks, optimistic retries, stock reservation.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use cart_core::{Money, ProductId, UserId};
use cart_engine::CartError;
use cart_engine::catalog::{Catalog, StockLine};
use cart_engine::db::{CartRepository, MemoryStore};
use cart_engine::lock::{KvLockManager, LockManager, LockPolicy, lock_key};
use cart_engine::models::{CartOwner, NewCartItem};
use cart_engine::occ::{Column, FieldUpdates, OptimisticController, RetryPolicy, RowRef};
use cart_integration_tests::{ProbeStore, TestContext, guest, product_info, test_settings, user};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_owner_mutations_never_interleave() {
    let memory = MemoryStore::new();
    let probe = ProbeStore::new(memory.clone(), Duration::from_millis(2));
    let engine = probe.engine(test_settings());
    memory.put_product(product_info(1, 1000, 100)).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = engine.service().clone();
            tokio::spawn(async move {
                service
                    .add_item(&user(1), ProductId::new(1), None, 1)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(probe.peak(), 1);
    assert!(probe.writes() >= 16);

    let cart = memory
        .find_active_cart(&CartOwner::User(UserId::new(1)))
        .await
        .unwrap()
        .unwrap();
    let items = memory.list_items(cart.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 8);
    assert_eq!(cart.total_qty, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_owners_are_not_serialized() {
    let memory = MemoryStore::new();
    let probe = ProbeStore::new(memory.clone(), Duration::from_millis(25));
    let engine = probe.engine(test_settings());
    memory.put_product(product_info(1, 1000, 100)).await;

    let tasks: Vec<_> = (1..=4)
        .map(|id| {
            let service = engine.service().clone();
            tokio::spawn(async move {
                service
                    .add_item(&user(id), ProductId::new(1), None, 1)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(probe.peak() >= 2, "peak was {}", probe.peak());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_mutation_still_invalidates_cached_view() {
    let memory = MemoryStore::new();
    let probe = ProbeStore::new(memory.clone(), Duration::from_millis(60));
    let engine = probe.engine(test_settings());
    memory.put_product(product_info(1, 1000, 100)).await;
    let service = engine.service();
    let me = user(1);

    service.add_item(&me, ProductId::new(1), None, 1).await.unwrap();
    service.get_cart(&me, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.get_cart(&me, false).await.unwrap().items[0].quantity, 1);

    // The line write commits, the aggregate write is still in flight
    let cancelled = tokio::time::timeout(
        Duration::from_millis(90),
        service.add_item(&me, ProductId::new(1), None, 1),
    )
    .await;
    assert!(cancelled.is_err());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let view = service.get_cart(&me, false).await.unwrap();
    assert_eq!(view.items[0].quantity, 2);

    // The lock was released too
    service.add_item(&me, ProductId::new(1), None, 1).await.unwrap();
    let cart = memory
        .find_active_cart(&CartOwner::User(UserId::new(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.total_qty, 3);
}

#[tokio::test]
async fn test_concurrent_first_adds_share_one_cart() {
    let ctx = TestContext::new();
    let a = ctx.product(1, 1000, 10).await;
    let b = ctx.product(2, 1000, 10).await;
    let visitor = guest("racer");

    let (first, second) = tokio::join!(
        ctx.service().add_item(&visitor, a, None, 1),
        ctx.service().add_item(&visitor, b, None, 1),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.cart_id, second.cart_id);
    assert_eq!(ctx.items(&visitor).await.len(), 2);
    assert_eq!(ctx.cart(&visitor).await.unwrap().item_count, 2);
}

#[tokio::test]
async fn test_held_lock_reports_busy() {
    let mut settings = test_settings();
    settings.lock = LockPolicy {
        ttl: Duration::from_secs(10),
        attempts: 2,
        retry_delay: Duration::from_millis(1),
    };
    let ctx = TestContext::with_settings(settings);
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);

    let manager = KvLockManager::new(Arc::new(ctx.kv.clone()));
    let key = lock_key(&me.resolve().unwrap());
    let token = manager
        .acquire(&key, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let err = ctx.service().add_item(&me, product, None, 1).await.unwrap_err();
    assert!(matches!(err, CartError::LockBusy(_)));
    assert!(err.is_retryable());
    assert!(ctx.cart(&me).await.is_none());

    // Reads are never blocked by the lock
    assert!(ctx.service().get_cart(&me, false).await.is_ok());

    manager.release(&key, &token).await.unwrap();
    ctx.service().add_item(&me, product, None, 1).await.unwrap();
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 10).await;
    let me = user(1);

    let manager = KvLockManager::new(Arc::new(ctx.kv.clone()));
    let key = lock_key(&me.resolve().unwrap());
    let stale = manager
        .acquire(&key, Duration::from_millis(30))
        .await
        .unwrap()
        .unwrap();

    // The holder "crashed"; the lock lapses by itself
    ctx.service().add_item(&me, product, None, 1).await.unwrap();

    // The crashed holder cannot release someone else's lock
    assert!(!manager.release(&key, &stale).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_optimistic_increments_all_land() {
    let memory = MemoryStore::new();
    let cart = memory
        .create_cart(&CartOwner::User(UserId::new(1)))
        .await
        .unwrap();
    let item = memory
        .insert_item(NewCartItem {
            cart_id: cart.id,
            product_id: ProductId::new(1),
            sku_id: None,
            quantity: 1,
            price: Money::from_cents(100),
            weight: Decimal::ONE,
            name: "counter".to_owned(),
            image: None,
            sku_attributes: Default::default(),
        })
        .await
        .unwrap();

    let occ = OptimisticController::new(
        Arc::new(memory.clone()),
        RetryPolicy {
            max_retries: 20,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
        },
    );

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let occ = occ.clone();
            tokio::spawn(async move {
                occ.update_with(RowRef::item(item.id), |snapshot| {
                    let quantity = snapshot.count(Column::Quantity).unwrap_or(0);
                    Ok(FieldUpdates::new().set(Column::Quantity, quantity + 1))
                })
                .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap().is_applied());
    }

    let stored = memory.get_item(cart.id, item.id).await.unwrap().unwrap();
    assert_eq!(stored.quantity, 11);
    assert_eq!(stored.version, item.version + 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_oversell() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 1000, 5).await;
    let line = StockLine {
        product_id: product,
        sku_id: None,
        quantity: 1,
    };

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let service = ctx.service().clone();
            tokio::spawn(async move { service.reserve_stock(&[line]).await })
        })
        .collect();

    let mut reserved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => reserved += 1,
            Err(err) => assert!(
                matches!(err, CartError::InsufficientStock { requested: 1, available: 0 }),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(reserved, 5);
    let stock = ctx.store.get_product(product).await.unwrap().unwrap().stock;
    assert_eq!(stock, 0);
}

#[tokio::test]
async fn test_reservation_is_all_or_nothing_and_releasable() {
    let ctx = TestContext::new();
    let plenty = ctx.product(1, 1000, 10).await;
    let scarce = ctx.product(2, 1000, 1).await;
    let lines = [
        StockLine {
            product_id: plenty,
            sku_id: None,
            quantity: 3,
        },
        StockLine {
            product_id: scarce,
            sku_id: None,
            quantity: 2,
        },
    ];

    let err = ctx.service().reserve_stock(&lines).await.unwrap_err();
    assert!(matches!(err, CartError::InsufficientStock { .. }));
    assert_eq!(ctx.store.get_product(plenty).await.unwrap().unwrap().stock, 10);

    ctx.service().reserve_stock(&lines[..1]).await.unwrap();
    assert_eq!(ctx.store.get_product(plenty).await.unwrap().unwrap().stock, 7);
    ctx.service().release_stock(&lines[..1]).await.unwrap();
    assert_eq!(ctx.store.get_product(plenty).await.unwrap().unwrap().stock, 10);
}
