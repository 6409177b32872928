//! Motoshop POS - work order settlement engine.
//!
//! The shared core behind the desktop and mobile shells: both link this
//! crate so they enforce identical financial rules. It owns the math and
//! the state transitions that must agree everywhere: totals, payment
//! allocation between deposit and balance, the repair lifecycle, the
//! exactly-once inventory deduction, automatic debt creation on unpaid
//! return, and the crash-recovery draft cache. Everything presentational
//! (lookup UI, printing, barcode scanning, autocomplete) lives in the
//! shells.
//!
//! Entry points:
//! - [`orders::create_settled`] / [`orders::update_settled`] commit a
//!   draft as one consistent unit.
//! - [`totals::compute_totals`] / [`allocate::allocate`] are the pure
//!   per-keystroke layers.
//! - [`inventory::deduct_manual`] is the operator override for missed
//!   stock deductions.
//! - [`drafts`] is the TTL-bound draft recovery store.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod allocate;
pub mod customers;
pub mod db;
pub mod debts;
pub mod drafts;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod orders;
pub mod status;
pub mod totals;
pub mod types;

pub use allocate::{allocate as allocate_payment, Allocation};
pub use db::DbState;
pub use error::{SettlementError, SettlementWarning, ValidationError};
pub use orders::{CreateOutcome, UpdateOutcome};
pub use status::OrderStatus;
pub use totals::{compute_totals, DiscountInput, DiscountMode, Totals};
pub use types::{
    AdditionalService, PartUsage, PaymentMethod, PaymentStatus, WorkOrder, WorkOrderInput,
};

/// Install the tracing subscriber for an embedding shell.
///
/// Respects `RUST_LOG`; defaults to info with engine debug. Safe to call
/// once per process — the shells call it during startup before opening the
/// database.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,motoshop_pos=debug"));

    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}
