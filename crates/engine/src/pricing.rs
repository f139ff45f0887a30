//! Pricing and promotion engine.
//!
//! [`calculate`] is a pure function of the cart lines, the caller's options
//! and a [`PricingRules`] set. Stages run in a fixed order:
//!
//! 1. aggregates over `normal` lines (amounts, quantities, weights)
//! 2. membership discount, a tier percentage of the selected amount
//! 3. the single best threshold promotion (promotions never stack)
//! 4. shipping by total `normal` weight, region factor, cap, free threshold
//! 5. tax
//! 6. loyalty points earned
//! 7. coupon, on top of the promotion
//!
//! followed by optional points redemption. Every amount is rounded to
//! currency precision, half away from zero.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use cart_core::{CartItemId, ItemStatus, MemberTier, Money, ProductId, SkuId};

use crate::error::PricingError;
use crate::models::{CartItem, CartTotals};

// =============================================================================
// Rules
// =============================================================================

/// "Spend at least `threshold`, save `discount`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdPromotion {
    pub threshold: Money,
    pub discount: Money,
}

/// Weight-banded shipping tariff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingTariff {
    /// Weight (kg) covered by the first band.
    pub first_weight: Decimal,
    pub first_fee: Money,
    /// Size (kg) of each additional band; partial bands are charged in full.
    pub additional_weight: Decimal,
    pub additional_fee: Money,
    /// Upper bound on the fee after the region factor.
    pub max_fee: Money,
    /// Selected amount (before discounts) at which shipping is free.
    pub free_threshold: Money,
    /// Multipliers per destination region; unknown regions use 1.
    pub region_factors: BTreeMap<String, Decimal>,
}

impl Default for ShippingTariff {
    fn default() -> Self {
        Self {
            first_weight: Decimal::ONE,
            first_fee: Money::from_cents(800),
            additional_weight: Decimal::ONE,
            additional_fee: Money::from_cents(400),
            max_fee: Money::from_cents(5000),
            free_threshold: Money::from_cents(9900),
            region_factors: BTreeMap::from([
                ("remote".to_owned(), Decimal::new(20, 1)),
                ("islands".to_owned(), Decimal::new(15, 1)),
            ]),
        }
    }
}

impl ShippingTariff {
    fn fee(&self, weight: Decimal, region: Option<&str>) -> Money {
        if weight <= Decimal::ZERO {
            return Money::ZERO;
        }

        let mut fee = self.first_fee;
        if weight > self.first_weight && self.additional_weight > Decimal::ZERO {
            let bands = ((weight - self.first_weight) / self.additional_weight)
                .ceil()
                .to_u32()
                .unwrap_or(u32::MAX);
            fee += self.additional_fee * bands;
        }

        let factor = region
            .and_then(|r| self.region_factors.get(r))
            .copied()
            .unwrap_or(Decimal::ONE);
        fee.scale(factor).min(self.max_fee)
    }
}

/// Loyalty points earning and redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsRules {
    /// Points earned per currency unit of selected amount.
    pub earn_per_unit: Decimal,
    /// Currency value of one redeemed point.
    pub point_value: Money,
    /// Largest share of the selected amount payable with points.
    pub max_redeem_ratio: Decimal,
}

impl Default for PointsRules {
    fn default() -> Self {
        Self {
            earn_per_unit: Decimal::ONE,
            point_value: Money::from_cents(1),
            max_redeem_ratio: Decimal::new(5, 1),
        }
    }
}

/// Every parameter the engine prices with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRules {
    /// Fraction of the selected amount taken off per tier.
    pub member_discounts: BTreeMap<MemberTier, Decimal>,
    pub promotions: Vec<ThresholdPromotion>,
    pub shipping: ShippingTariff,
    /// Applied to the discounted goods amount. Zero disables tax.
    pub tax_rate: Decimal,
    pub points: PointsRules,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            member_discounts: BTreeMap::from([
                (MemberTier::Regular, Decimal::ZERO),
                (MemberTier::Silver, Decimal::new(2, 2)),
                (MemberTier::Gold, Decimal::new(5, 2)),
                (MemberTier::Platinum, Decimal::new(10, 2)),
            ]),
            promotions: vec![
                ThresholdPromotion {
                    threshold: Money::from_cents(10_000),
                    discount: Money::from_cents(1000),
                },
                ThresholdPromotion {
                    threshold: Money::from_cents(20_000),
                    discount: Money::from_cents(2500),
                },
                ThresholdPromotion {
                    threshold: Money::from_cents(50_000),
                    discount: Money::from_cents(8000),
                },
            ],
            shipping: ShippingTariff::default(),
            tax_rate: Decimal::ZERO,
            points: PointsRules::default(),
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// How a coupon discounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponKind {
    /// Fixed amount off.
    Fixed { amount: Money },
    /// Fraction of the selected amount off, optionally capped.
    Percent { rate: Decimal, cap: Option<Money> },
}

/// A coupon presented at pricing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
    /// Selected amount required before the coupon applies.
    pub min_amount: Money,
}

impl Coupon {
    /// Check the coupon definition itself.
    ///
    /// # Errors
    ///
    /// `MalformedCoupon` for an empty code or a non-positive or
    /// out-of-range discount.
    pub fn validate(&self) -> Result<(), PricingError> {
        let malformed = |reason: &str| PricingError::MalformedCoupon {
            code: self.code.clone(),
            reason: reason.to_owned(),
        };

        if self.code.trim().is_empty() {
            return Err(malformed("empty code"));
        }
        if self.min_amount < Money::ZERO {
            return Err(malformed("negative minimum amount"));
        }
        match self.kind {
            CouponKind::Fixed { amount } if amount <= Money::ZERO => {
                Err(malformed("fixed discount must be positive"))
            }
            CouponKind::Percent { rate, .. } if rate <= Decimal::ZERO || rate > Decimal::ONE => {
                Err(malformed("rate must be in (0, 1]"))
            }
            CouponKind::Percent { cap: Some(cap), .. } if cap <= Money::ZERO => {
                Err(malformed("cap must be positive"))
            }
            _ => Ok(()),
        }
    }

    fn discount(&self, selected_amount: Money) -> Money {
        match self.kind {
            CouponKind::Fixed { amount } => amount,
            CouponKind::Percent { rate, cap } => {
                let off = selected_amount.scale(rate);
                cap.map_or(off, |cap| off.min(cap))
            }
        }
    }
}

/// Caller-supplied pricing context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingOptions {
    pub tier: MemberTier,
    /// Destination region code.
    pub region: Option<String>,
    pub coupon: Option<Coupon>,
    /// Loyalty points to spend on this order.
    pub redeem_points: u64,
}

// =============================================================================
// Calculation
// =============================================================================

/// Output of [`calculate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    /// Lines in `normal` status.
    pub item_count: u32,
    pub total_qty: u32,
    pub selected_count: u32,
    pub selected_qty: u32,
    pub total_amount: Money,
    pub selected_amount: Money,
    pub total_weight: Decimal,
    pub selected_weight: Decimal,

    pub member_discount: Money,
    pub promotion: Option<ThresholdPromotion>,
    pub promotion_discount: Money,
    /// Code of the coupon that applied; `None` if absent or below its minimum.
    pub coupon_code: Option<String>,
    pub coupon_discount: Money,
    pub points_redeemed: u64,
    pub points_discount: Money,
    /// Sum of every discount above.
    pub discount_amount: Money,

    pub shipping_fee: Money,
    pub shipping_waived: bool,
    pub tax: Money,
    pub points_earned: u64,
    pub final_amount: Money,
}

/// Price a cart.
///
/// Only lines that are both selected and `normal` are charged.
///
/// # Errors
///
/// `MalformedCoupon` for an invalid coupon definition, `PointsExceedLimit`
/// when the redemption exceeds what the cart allows.
pub fn calculate(
    items: &[CartItem],
    options: &PricingOptions,
    rules: &PricingRules,
) -> Result<PriceBreakdown, PricingError> {
    // Stage 1: aggregates
    let mut item_count = 0_u32;
    let mut total_qty = 0_u32;
    let mut selected_count = 0_u32;
    let mut selected_qty = 0_u32;
    let mut total_amount = Money::ZERO;
    let mut selected_amount = Money::ZERO;
    let mut total_weight = Decimal::ZERO;
    let mut selected_weight = Decimal::ZERO;

    for item in items.iter().filter(|i| i.status == ItemStatus::Normal) {
        let line_weight = item.weight * Decimal::from(item.quantity);
        item_count += 1;
        total_qty += item.quantity;
        total_amount += item.line_total();
        total_weight += line_weight;
        if item.selected {
            selected_count += 1;
            selected_qty += item.quantity;
            selected_amount += item.line_total();
            selected_weight += line_weight;
        }
    }
    let total_amount = total_amount.rounded();
    let selected_amount = selected_amount.rounded();

    // Stage 2: membership
    let member_rate = rules
        .member_discounts
        .get(&options.tier)
        .copied()
        .unwrap_or(Decimal::ZERO);
    let member_discount = selected_amount.scale(member_rate);

    // Stage 3: best single promotion
    let promotion = rules
        .promotions
        .iter()
        .filter(|p| selected_amount >= p.threshold)
        .max_by_key(|p| p.discount)
        .copied();
    let promotion_discount = promotion.map_or(Money::ZERO, |p| p.discount);

    // Stage 4: shipping on the weight of every `normal` line, waived on the
    // pre-discount amount. Nothing selected means nothing ships.
    let shipping_waived =
        selected_count > 0 && selected_amount >= rules.shipping.free_threshold;
    let shipping_fee = if shipping_waived || selected_count == 0 {
        Money::ZERO
    } else {
        rules
            .shipping
            .fee(total_weight, options.region.as_deref())
    };

    // Stage 5: tax
    let taxable = selected_amount.saturating_sub(member_discount + promotion_discount);
    let tax = taxable.scale(rules.tax_rate);

    // Stage 6: points earned
    let points_earned = (selected_amount.amount() * rules.points.earn_per_unit)
        .floor()
        .to_u64()
        .unwrap_or(0);

    // Stage 7: coupon
    let (coupon_code, coupon_discount) = match &options.coupon {
        Some(coupon) => {
            coupon.validate()?;
            if selected_count > 0 && selected_amount >= coupon.min_amount {
                (Some(coupon.code.clone()), coupon.discount(selected_amount))
            } else {
                (None, Money::ZERO)
            }
        }
        None => (None, Money::ZERO),
    };

    // Points redemption
    let points_discount = redeem(options.redeem_points, selected_amount, &rules.points)?;

    let discount_amount = member_discount + promotion_discount + coupon_discount + points_discount;
    let final_amount = (selected_amount + shipping_fee + tax).saturating_sub(discount_amount);

    Ok(PriceBreakdown {
        item_count,
        total_qty,
        selected_count,
        selected_qty,
        total_amount,
        selected_amount,
        total_weight,
        selected_weight,
        member_discount,
        promotion,
        promotion_discount,
        coupon_code,
        coupon_discount,
        points_redeemed: options.redeem_points,
        points_discount,
        discount_amount,
        shipping_fee,
        shipping_waived,
        tax,
        points_earned,
        final_amount,
    })
}

fn redeem(points: u64, selected_amount: Money, rules: &PointsRules) -> Result<Money, PricingError> {
    if points == 0 {
        return Ok(Money::ZERO);
    }
    let value = rules.point_value.scale(Decimal::from(points));
    let max_value = selected_amount.scale(rules.max_redeem_ratio);
    if value > max_value {
        return Err(PricingError::PointsExceedLimit {
            requested: points,
            max_value,
        });
    }
    Ok(value)
}

// =============================================================================
// Summary payload
// =============================================================================

/// A line that is not priced, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableItem {
    pub item_id: CartItemId,
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub name: String,
    pub status: ItemStatus,
}

/// Cart summary returned alongside every cart read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummary {
    /// Lines in the cart, any status.
    pub item_count: u32,
    /// Units in the cart, any status.
    pub total_qty: u32,
    pub selected_count: u32,
    pub selected_qty: u32,
    /// Value of `normal` lines.
    pub total_amount: Money,
    pub selected_amount: Money,
    pub discount_amount: Money,
    pub shipping_fee: Money,
    pub final_amount: Money,
    pub invalid_items: Vec<UnavailableItem>,
}

impl CartSummary {
    /// Summarise a cart's lines under the given pricing.
    ///
    /// # Errors
    ///
    /// As [`calculate`].
    pub fn build(
        items: &[CartItem],
        options: &PricingOptions,
        rules: &PricingRules,
    ) -> Result<Self, PricingError> {
        let totals = CartTotals::fold(items);
        let priced = calculate(items, options, rules)?;

        Ok(Self {
            item_count: totals.item_count,
            total_qty: totals.total_qty,
            selected_count: priced.selected_count,
            selected_qty: priced.selected_qty,
            total_amount: priced.total_amount,
            selected_amount: priced.selected_amount,
            discount_amount: priced.discount_amount,
            shipping_fee: priced.shipping_fee,
            final_amount: priced.final_amount,
            invalid_items: items
                .iter()
                .filter(|i| i.status != ItemStatus::Normal)
                .map(|i| UnavailableItem {
                    item_id: i.id,
                    product_id: i.product_id,
                    sku_id: i.sku_id,
                    name: i.name.clone(),
                    status: i.status,
                })
                .collect(),
        })
    }
}
