//! Error taxonomy for the settlement engine.
//!
//! Three tiers, matching how the engine propagates failures:
//!
//! - [`ValidationError`] — user-correctable input problems. The pure layers
//!   (totals, allocator) return these as data; they never panic.
//! - [`SettlementError`] — hard failures raised by the orchestrator, the
//!   only layer permitted to perform effects.
//! - [`SettlementWarning`] — dependent-service failures (inventory, debt,
//!   ledger adjustment) reported *after* a successful commit. The financial
//!   write is the source of truth and is never rolled back for these.

use serde::Serialize;
use thiserror::Error;

/// User-correctable validation failures. Surfaced immediately, before any
/// write is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("customer name is required")]
    MissingCustomerName,

    #[error("customer phone is required")]
    MissingCustomerPhone,

    #[error("customer phone must be 10-11 digits")]
    InvalidPhone,

    #[error("deposit {deposit} exceeds order total {total}")]
    DepositExceedsTotal { deposit: i64, total: i64 },

    /// The order has no charge yet (total is zero) so there is nothing to
    /// take a deposit against.
    #[error("cannot record a deposit of {deposit} on an order with no charge")]
    DepositWithoutCharge { deposit: i64 },

    /// A nonzero deposit is already on record. Only the backfill path may
    /// change it.
    #[error("deposit is already recorded and cannot be edited")]
    DepositLocked,

    #[error("deposit cannot be negative")]
    NegativeDeposit,

    #[error("additional payment cannot be negative")]
    NegativeAdditionalPayment,

    #[error("payment method is required when recording a payment")]
    MissingPaymentMethod,

    #[error("total must be greater than zero when the vehicle is returned")]
    ZeroTotalAtReturn,

    /// The order is settled (paid + returned) or refunded; part and price
    /// lines are immutable. Service cost fields remain editable.
    #[error("pricing and part lines are locked on a settled order")]
    PricingLocked,
}

/// Hard errors raised by the transaction orchestrator.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A commit for this order is already in flight in this process.
    /// Shells absorb this silently — the guard exists precisely to soak up
    /// redundant clicks.
    #[error("a commit is already in flight for order {0}")]
    CommitInFlight(String),

    /// The caller opted into optimistic concurrency and lost the race.
    #[error("order {order_id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        order_id: String,
        expected: i64,
        found: i64,
    },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        SettlementError::Storage(e.to_string())
    }
}

/// Non-fatal issues attached to an otherwise successful commit outcome.
#[derive(Debug, Clone, Serialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SettlementWarning {
    /// Stock bookkeeping failed after the payment committed. The order is
    /// flagged for the manual deduction path.
    #[error("inventory deduction failed: {0}")]
    InventoryDeduction(String),

    #[error("debt creation failed: {0}")]
    DebtCreation(String),

    #[error("ledger adjustment failed: {0}")]
    LedgerAdjustment(String),
}
