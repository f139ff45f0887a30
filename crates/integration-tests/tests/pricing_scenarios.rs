//! Cart pricing through the service.

#![allow(clippy::unwrap_used)]

use cart_core::{MemberTier, Money};
use cart_engine::CartError;
use cart_engine::pricing::{Coupon, CouponKind, PricingOptions};
use cart_integration_tests::{TestContext, user};

/// Two lines worth 130.00: 2 x 50.00 and 1 x 30.00.
async fn scenario_cart(ctx: &TestContext) -> cart_engine::Identity {
    let a = ctx.product(1, 5000, 10).await;
    let b = ctx.product(2, 3000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, a, None, 2).await.unwrap();
    ctx.service().add_item(&me, b, None, 1).await.unwrap();
    me
}

fn fixed_coupon(code: &str, amount_cents: i64, min_cents: i64) -> Coupon {
    Coupon {
        code: code.to_owned(),
        kind: CouponKind::Fixed {
            amount: Money::from_cents(amount_cents),
        },
        min_amount: Money::from_cents(min_cents),
    }
}

#[tokio::test]
async fn test_threshold_promotion_with_free_shipping() {
    let ctx = TestContext::new();
    let me = scenario_cart(&ctx).await;

    let priced = ctx
        .service()
        .calculate(&me, &PricingOptions::default())
        .await
        .unwrap();

    assert_eq!(priced.selected_amount, Money::from_cents(13_000));
    assert_eq!(priced.promotion_discount, Money::from_cents(1000));
    assert!(priced.shipping_waived);
    assert_eq!(priced.shipping_fee, Money::ZERO);
    assert_eq!(priced.final_amount, Money::from_cents(12_000));
    assert_eq!(priced.points_earned, 130);

    let again = ctx
        .service()
        .calculate(&me, &PricingOptions::default())
        .await
        .unwrap();
    assert_eq!(priced, again);
}

#[tokio::test]
async fn test_small_order_pays_weight_based_shipping() {
    let ctx = TestContext::new();
    let product = ctx.product(1, 2000, 10).await;
    let me = user(1);
    ctx.service().add_item(&me, product, None, 3).await.unwrap();

    // 1.5 kg: first kilogram plus one additional band
    let priced = ctx
        .service()
        .calculate(&me, &PricingOptions::default())
        .await
        .unwrap();
    assert!(!priced.shipping_waived);
    assert_eq!(priced.shipping_fee, Money::from_cents(1200));
    assert_eq!(priced.final_amount, Money::from_cents(7200));

    let remote = PricingOptions {
        region: Some("remote".to_owned()),
        ..PricingOptions::default()
    };
    let priced = ctx.service().calculate(&me, &remote).await.unwrap();
    assert_eq!(priced.shipping_fee, Money::from_cents(2400));
    assert_eq!(priced.final_amount, Money::from_cents(8400));
}

#[tokio::test]
async fn test_membership_coupon_and_points_combine() {
    let ctx = TestContext::new();
    let me = scenario_cart(&ctx).await;

    let options = PricingOptions {
        tier: MemberTier::Gold,
        region: None,
        coupon: Some(fixed_coupon("SAVE15", 1500, 10_000)),
        redeem_points: 1000,
    };
    let priced = ctx.service().calculate(&me, &options).await.unwrap();

    assert_eq!(priced.member_discount, Money::from_cents(650));
    assert_eq!(priced.promotion_discount, Money::from_cents(1000));
    assert_eq!(priced.coupon_code.as_deref(), Some("SAVE15"));
    assert_eq!(priced.coupon_discount, Money::from_cents(1500));
    assert_eq!(priced.points_discount, Money::from_cents(1000));
    assert_eq!(priced.discount_amount, Money::from_cents(4150));
    assert_eq!(priced.final_amount, Money::from_cents(8850));
}

#[tokio::test]
async fn test_coupon_below_minimum_is_ignored() {
    let ctx = TestContext::new();
    let me = scenario_cart(&ctx).await;

    let options = PricingOptions {
        coupon: Some(fixed_coupon("BIGSPENDER", 5000, 50_000)),
        ..PricingOptions::default()
    };
    let priced = ctx.service().calculate(&me, &options).await.unwrap();
    assert!(priced.coupon_code.is_none());
    assert_eq!(priced.coupon_discount, Money::ZERO);
    assert_eq!(priced.final_amount, Money::from_cents(12_000));
}

#[tokio::test]
async fn test_invalid_pricing_inputs_are_rejected() {
    let ctx = TestContext::new();
    let me = scenario_cart(&ctx).await;

    let malformed = PricingOptions {
        coupon: Some(fixed_coupon("", 500, 0)),
        ..PricingOptions::default()
    };
    let err = ctx.service().calculate(&me, &malformed).await.unwrap_err();
    assert!(matches!(err, CartError::Validation(_)));

    // Points are capped at half of the selected amount
    let greedy = PricingOptions {
        redeem_points: 10_000,
        ..PricingOptions::default()
    };
    let err = ctx.service().calculate(&me, &greedy).await.unwrap_err();
    assert!(matches!(err, CartError::Validation(_)));
}

#[tokio::test]
async fn test_checkout_quote_matches_calculation() {
    let ctx = TestContext::new();
    let me = scenario_cart(&ctx).await;
    ctx.service().sync_cart(&me).await.unwrap();

    let options = PricingOptions {
        tier: MemberTier::Silver,
        ..PricingOptions::default()
    };
    let quote = ctx.service().prepare_checkout(&me, &options).await.unwrap();
    let priced = ctx.service().calculate(&me, &options).await.unwrap();

    assert_eq!(quote.pricing, priced);
    assert_eq!(quote.items.len(), 2);
    assert_eq!(quote.pricing.member_discount, Money::from_cents(260));
}

#[tokio::test]
async fn test_empty_cart_prices_to_zero() {
    let ctx = TestContext::new();
    let priced = ctx
        .service()
        .calculate(&user(9), &PricingOptions::default())
        .await
        .unwrap();
    assert_eq!(priced.item_count, 0);
    assert_eq!(priced.shipping_fee, Money::ZERO);
    assert_eq!(priced.final_amount, Money::ZERO);
}
