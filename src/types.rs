//! Core records exchanged between the shells and the settlement engine.
//!
//! Everything crossing the boundary is an explicit serde type validated at
//! the orchestrator's entry point — ad-hoc JSON objects are never trusted
//! downstream. Wire names are camelCase so the desktop and mobile shells
//! exchange identical shapes; snake_case aliases accept rows coming back
//! from storage exports.

use serde::{Deserialize, Serialize};

use crate::status::OrderStatus;
use crate::totals::DiscountInput;

// ---------------------------------------------------------------------------
// Payment enums
// ---------------------------------------------------------------------------

/// Settlement state of an order's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
        }
    }

    /// Parse a stored value. Unknown values map to `Unpaid` rather than
    /// failing the whole row read.
    pub fn parse(s: &str) -> PaymentStatus {
        match s {
            "paid" => PaymentStatus::Paid,
            "partial" => PaymentStatus::Partial,
            _ => PaymentStatus::Unpaid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Bank,
    Card,
    Ewallet,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Bank => "bank",
            PaymentMethod::Card => "card",
            PaymentMethod::Ewallet => "ewallet",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentMethod> {
        match s {
            "cash" => Some(PaymentMethod::Cash),
            "bank" => Some(PaymentMethod::Bank),
            "card" => Some(PaymentMethod::Card),
            "ewallet" => Some(PaymentMethod::Ewallet),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

/// One part pulled from stock for a repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUsage {
    #[serde(alias = "part_id")]
    pub part_id: String,
    #[serde(default, alias = "part_name")]
    pub part_name: String,
    #[serde(default)]
    pub sku: String,
    pub quantity: i64,
    /// Sale price per unit. Legacy drafts used `price`.
    #[serde(alias = "price", alias = "unit_price")]
    pub unit_price: i64,
    /// Acquisition cost per unit, for margin tracking.
    #[serde(default, alias = "costPrice", alias = "unit_cost")]
    pub unit_cost: i64,
}

/// An ad-hoc service line: outsourced work, ordered goods, or (with a
/// negative `unit_price`) a credit handed back to the customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalService {
    pub id: String,
    pub description: String,
    pub quantity: i64,
    #[serde(alias = "price", alias = "unit_price")]
    pub unit_price: i64,
    /// What the shop pays an outside workshop for this line. Drives the
    /// mirrored expense ledger entry.
    #[serde(default, alias = "costPrice", alias = "unit_cost")]
    pub unit_cost: i64,
}

// ---------------------------------------------------------------------------
// Orchestrator input
// ---------------------------------------------------------------------------

/// The draft a shell submits for settlement. Validated up-front by the
/// orchestrator; derived fields (totals, payment status) are always
/// recomputed server-side and never taken from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderInput {
    #[serde(default, alias = "customer_name")]
    pub customer_name: String,
    #[serde(default, alias = "customer_phone")]
    pub customer_phone: String,
    #[serde(default, alias = "vehicle_model")]
    pub vehicle_model: String,
    #[serde(default, alias = "license_plate")]
    pub license_plate: String,
    #[serde(default, alias = "current_km")]
    pub current_km: Option<i64>,
    #[serde(default, alias = "issue_description")]
    pub issue_description: String,
    #[serde(default, alias = "technician_name")]
    pub technician_name: String,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default, alias = "labor_cost")]
    pub labor_cost: i64,
    #[serde(default)]
    pub discount: DiscountInput,
    #[serde(default, alias = "parts_used")]
    pub parts_used: Vec<PartUsage>,
    #[serde(default, alias = "additional_services")]
    pub additional_services: Vec<AdditionalService>,
    #[serde(default, alias = "payment_method")]
    pub payment_method: Option<PaymentMethod>,
    /// Requested deposit. Write-once through the normal path.
    #[serde(default, alias = "deposit_amount")]
    pub deposit_amount: i64,
    /// Requested cumulative balance payment (never a delta).
    #[serde(default, alias = "additional_payment")]
    pub additional_payment: i64,
    /// Opt-in optimistic concurrency: when set, the update is rejected if
    /// the stored row version differs. When absent, last write wins.
    #[serde(default, alias = "expected_row_version")]
    pub expected_row_version: Option<i64>,
}

// ---------------------------------------------------------------------------
// Full order record
// ---------------------------------------------------------------------------

/// A persisted work order as read back from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub id: String,
    pub branch_id: String,
    pub customer_id: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub vehicle_model: String,
    pub license_plate: String,
    pub current_km: Option<i64>,
    pub issue_description: String,
    pub technician_name: String,
    pub status: OrderStatus,
    pub labor_cost: i64,
    pub discount: i64,
    pub parts_used: Vec<PartUsage>,
    pub additional_services: Vec<AdditionalService>,
    pub total: i64,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub deposit_amount: i64,
    pub deposit_transaction_id: Option<String>,
    pub additional_payment: i64,
    pub payment_transaction_id: Option<String>,
    pub total_paid: i64,
    pub remaining_amount: i64,
    pub inventory_deducted: bool,
    pub refunded: bool,
    pub row_version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkOrder {
    /// Pricing becomes immutable once the order is refunded, or fully paid
    /// at the terminal returned stage. Service cost fields stay editable.
    pub fn pricing_locked(&self) -> bool {
        self.refunded
            || (self.payment_status == PaymentStatus::Paid && self.status == OrderStatus::Returned)
    }
}

/// Serialize line items for the JSON text column on the order row.
pub(crate) fn lines_to_json<T: Serialize>(lines: &[T]) -> String {
    serde_json::to_string(lines).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a JSON text column back into line items, skipping nothing: a
/// malformed column yields an empty list rather than failing the row read.
pub(crate) fn lines_from_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Fingerprint of the price-bearing fields, used to enforce the pricing
/// lock on settled/refunded orders. Service `unit_cost` is excluded because
/// it remains editable after settlement.
pub(crate) fn pricing_fingerprint(
    labor_cost: i64,
    discount: i64,
    parts: &[PartUsage],
    services: &[AdditionalService],
) -> String {
    let services_no_cost: Vec<AdditionalService> = services
        .iter()
        .map(|s| AdditionalService {
            unit_cost: 0,
            ..s.clone()
        })
        .collect();
    format!(
        "{labor_cost}|{discount}|{}|{}",
        lines_to_json(parts),
        lines_to_json(&services_no_cost)
    )
}

// ===========================================================================
// Tests
// ===========================================================================
