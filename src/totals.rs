//! Pure totals computation for a work order draft.
//!
//! Re-run on every line-item mutation by both shells, so it must be cheap,
//! deterministic and free of I/O. Amounts are integral VND; the only
//! rounding point is the percent-discount conversion (round half up).

use serde::{Deserialize, Serialize};

use crate::types::{AdditionalService, PartUsage};

/// How the operator entered the discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountMode {
    /// Absolute amount, clamped to `[0, subtotal]`.
    Amount,
    /// Percentage of the subtotal, clamped to `[0, 100]`.
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountInput {
    pub mode: DiscountMode,
    pub value: i64,
}

impl Default for DiscountInput {
    fn default() -> Self {
        DiscountInput {
            mode: DiscountMode::Amount,
            value: 0,
        }
    }
}

impl DiscountInput {
    pub fn amount(value: i64) -> Self {
        DiscountInput {
            mode: DiscountMode::Amount,
            value,
        }
    }

    pub fn percent(value: i64) -> Self {
        DiscountInput {
            mode: DiscountMode::Percent,
            value,
        }
    }
}

/// Derived financial figures for a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub parts_total: i64,
    pub services_total: i64,
    pub subtotal: i64,
    pub discount_amount: i64,
    pub total: i64,
}

/// Compute subtotal, discount and total for the given line items.
///
/// Service lines may carry negative prices (ad-hoc credits); the final
/// total is floored at zero regardless.
pub fn compute_totals(
    labor_cost: i64,
    parts: &[PartUsage],
    services: &[AdditionalService],
    discount: DiscountInput,
) -> Totals {
    let parts_total: i64 = parts.iter().map(|p| p.unit_price * p.quantity).sum();
    let services_total: i64 = services.iter().map(|s| s.unit_price * s.quantity).sum();
    let subtotal = labor_cost + parts_total + services_total;

    let discount_amount = match discount.mode {
        DiscountMode::Amount => discount.value.clamp(0, subtotal.max(0)),
        DiscountMode::Percent => {
            let percent = discount.value.clamp(0, 100);
            round_half_up_percent(subtotal.max(0), percent)
        }
    };

    Totals {
        parts_total,
        services_total,
        subtotal,
        discount_amount,
        total: (subtotal - discount_amount).max(0),
    }
}

/// `round(base × percent / 100)`, half up, safe from i64 overflow.
fn round_half_up_percent(base: i64, percent: i64) -> i64 {
    ((base as i128 * percent as i128 + 50) / 100) as i64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn part(qty: i64, price: i64) -> PartUsage {
        PartUsage {
            part_id: format!("P-{price}"),
            part_name: "part".into(),
            sku: String::new(),
            quantity: qty,
            unit_price: price,
            unit_cost: 0,
        }
    }

    fn service(qty: i64, price: i64, cost: i64) -> AdditionalService {
        AdditionalService {
            id: format!("S-{price}"),
            description: "service".into(),
            quantity: qty,
            unit_price: price,
            unit_cost: cost,
        }
    }

    #[test]
    fn test_labor_plus_parts_totals() {
        // laborCost=100000, parts=[{qty:2, price:50000}], discount=0
        let totals = compute_totals(
            100_000,
            &[part(2, 50_000)],
            &[],
            DiscountInput::default(),
        );
        assert_eq!(totals.parts_total, 100_000);
        assert_eq!(totals.subtotal, 200_000);
        assert_eq!(totals.total, 200_000);
    }

    #[test]
    fn test_negative_service_price_floors_total_at_zero() {
        let totals = compute_totals(10_000, &[], &[service(1, -50_000, 0)], DiscountInput::default());
        assert_eq!(totals.services_total, -50_000);
        assert_eq!(totals.subtotal, -40_000);
        assert_eq!(totals.total, 0, "total never goes negative");
    }

    #[test]
    fn test_amount_discount_clamped_to_subtotal() {
        let totals = compute_totals(80_000, &[], &[], DiscountInput::amount(200_000));
        assert_eq!(totals.discount_amount, 80_000);
        assert_eq!(totals.total, 0);

        let totals = compute_totals(80_000, &[], &[], DiscountInput::amount(-5_000));
        assert_eq!(totals.discount_amount, 0);
    }

    #[test]
    fn test_percent_discount_rounds_half_up() {
        // 15% of 333 = 49.95 → 50
        let totals = compute_totals(333, &[], &[], DiscountInput::percent(15));
        assert_eq!(totals.discount_amount, 50);

        // 10% of 125 = 12.5 → 13 (half up)
        let totals = compute_totals(125, &[], &[], DiscountInput::percent(10));
        assert_eq!(totals.discount_amount, 13);
    }

    #[test]
    fn test_percent_discount_clamped() {
        let totals = compute_totals(100_000, &[], &[], DiscountInput::percent(150));
        assert_eq!(totals.discount_amount, 100_000);
        assert_eq!(totals.total, 0);

        let totals = compute_totals(100_000, &[], &[], DiscountInput::percent(-10));
        assert_eq!(totals.discount_amount, 0);
    }

    #[test]
    fn test_mixed_lines() {
        let totals = compute_totals(
            50_000,
            &[part(1, 120_000), part(3, 10_000)],
            &[service(2, 40_000, 25_000), service(1, -20_000, 0)],
            DiscountInput::percent(10),
        );
        assert_eq!(totals.parts_total, 150_000);
        assert_eq!(totals.services_total, 60_000);
        assert_eq!(totals.subtotal, 260_000);
        assert_eq!(totals.discount_amount, 26_000);
        assert_eq!(totals.total, 234_000);
    }
}
