//! Payment allocation: splitting an order's total between deposit and
//! balance payment, and deriving the authoritative payment status.
//!
//! Pure and synchronous — runs on every keystroke in the settlement panel.
//! Validation failures come back as data, never panics.
//!
//! **Rules:**
//! - Deposit is write-once through this path: a persisted nonzero deposit
//!   refuses further edits (only the orchestrator's backfill path may).
//! - An out-of-bounds deposit is a hard validation failure so the operator
//!   can correct the entry.
//! - An out-of-bounds *additional* payment is silently clamped instead —
//!   "pay in full" buttons may round imprecisely, so overpayment requests
//!   are truncated rather than rejected.
//! - Additional payment is cumulative and only meaningful at `returned`;
//!   at any other stage a new request is forced to zero, but previously
//!   recorded cumulative payment is never erased.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::status::OrderStatus;
use crate::types::PaymentStatus;

/// The authoritative paid/remaining figures for a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub deposit: i64,
    /// Cumulative balance payment after clamping.
    pub additional_payment: i64,
    pub total_paid: i64,
    pub remaining_amount: i64,
    pub payment_status: PaymentStatus,
}

/// Allocate a requested deposit and cumulative additional payment against
/// an order total.
///
/// `prior_*` are the values already persisted on the order (zero for a new
/// order). `status` is the order's *current* lifecycle stage.
pub fn allocate(
    total: i64,
    prior_deposit: i64,
    requested_deposit: i64,
    prior_additional: i64,
    requested_additional: i64,
    status: OrderStatus,
) -> Result<Allocation, ValidationError> {
    if requested_deposit < 0 {
        return Err(ValidationError::NegativeDeposit);
    }
    if requested_additional < 0 {
        return Err(ValidationError::NegativeAdditionalPayment);
    }

    // Deposit edits are frozen once a nonzero deposit is on record.
    if prior_deposit > 0 && requested_deposit != prior_deposit {
        return Err(ValidationError::DepositLocked);
    }

    if total <= 0 && requested_deposit > 0 {
        return Err(ValidationError::DepositWithoutCharge {
            deposit: requested_deposit,
        });
    }
    if total > 0 && requested_deposit > total {
        return Err(ValidationError::DepositExceedsTotal {
            deposit: requested_deposit,
            total,
        });
    }

    let deposit = requested_deposit;

    // Balance payments are only tracked once the vehicle is handed back.
    let requested = if status.allows_additional_payment() {
        requested_additional
    } else {
        0
    };

    // Cumulative, monotonic, and clamped to what is actually owed.
    let cap = (total - deposit).max(0);
    let additional_payment = requested.max(prior_additional).clamp(0, cap);

    let total_paid = deposit + additional_payment;
    let remaining_amount = (total - total_paid).max(0);

    Ok(Allocation {
        deposit,
        additional_payment,
        total_paid,
        remaining_amount,
        payment_status: derive_payment_status(total, total_paid),
    })
}

/// `paid` requires a positive total — a zero-total order is never
/// auto-marked paid just because nothing was owed.
pub fn derive_payment_status(total: i64, total_paid: i64) -> PaymentStatus {
    if total > 0 && total_paid >= total {
        PaymentStatus::Paid
    } else if total_paid > 0 {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Unpaid
    }
}

// ===========================================================================
// Tests
// ===========================================================================
