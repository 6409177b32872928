//! Repair lifecycle stages and the financial rules keyed off them.
//!
//! The stages form an ordered sequence but transitions are deliberately
//! unrestricted — the front desk may jump an order straight to `returned`
//! or pull it back for rework. Financial rules always key off the *current*
//! state, never the transition path.

use serde::{Deserialize, Serialize};

/// Repair stages in shop-floor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Received,
    InProgress,
    Completed,
    /// Terminal stage: the vehicle is handed back. Balance payments are
    /// only meaningful here, and unpaid remainder becomes a debt.
    Returned,
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Received
    }
}

/// All stages in display order.
pub const ALL_STATUSES: [OrderStatus; 4] = [
    OrderStatus::Received,
    OrderStatus::InProgress,
    OrderStatus::Completed,
    OrderStatus::Returned,
];

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Received => "received",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::Returned => "returned",
        }
    }

    /// Parse a stored value. Unknown values map to `Received` so a row
    /// written by a newer schema still loads.
    pub fn parse(s: &str) -> OrderStatus {
        match s {
            "in_progress" => OrderStatus::InProgress,
            "completed" => OrderStatus::Completed,
            "returned" => OrderStatus::Returned,
            _ => OrderStatus::Received,
        }
    }

    /// Position in the repair sequence, for progress display and sorting.
    pub fn stage_index(&self) -> usize {
        match self {
            OrderStatus::Received => 0,
            OrderStatus::InProgress => 1,
            OrderStatus::Completed => 2,
            OrderStatus::Returned => 3,
        }
    }

    /// Balance payments against the remainder are only tracked once the
    /// vehicle is actually handed back. Mid-repair "extra payments" are not.
    pub fn allows_additional_payment(&self) -> bool {
        *self == OrderStatus::Returned
    }

    /// Handing the vehicle back requires a priced order; a zero-total order
    /// at any earlier stage is fine (pure information intake).
    pub fn requires_positive_total(&self) -> bool {
        *self == OrderStatus::Returned
    }

    /// A debt record is generated when the vehicle leaves with an unpaid
    /// remainder. Zero-total orders never create debt.
    pub fn triggers_debt(&self, total: i64, remaining: i64) -> bool {
        *self == OrderStatus::Returned && total > 0 && remaining > 0
    }
}
