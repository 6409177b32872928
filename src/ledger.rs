//! Income/expense ledger for settlement cash flows.
//!
//! Every payment taken against a work order mirrors into `cash_transactions`
//! so the finance reports see deposits, balance payments, outsourced-work
//! costs and ad-hoc cash-outs without reading order rows. Income rows carry
//! positive amounts, expense rows negative — the sign convention the
//! reporting layer already relies on.
//!
//! **Rules:**
//! - Deposit / balance-payment entries record the *delta* actually taken in
//!   this commit, never cumulative values.
//! - Outsourced service costs aggregate into a single `outsourcing` expense
//!   per order, adjusted in place when costs change and deleted (credited
//!   back) when they drop to zero.
//! - A service line with a negative price and zero cost is a pure cash
//!   outflow: it feeds the `refund` expense and is excluded from the
//!   outsourcing sum so no line is double-counted.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::types::AdditionalService;

pub const CATEGORY_SERVICE_DEPOSIT: &str = "service_deposit";
pub const CATEGORY_SERVICE_INCOME: &str = "service_income";
pub const CATEGORY_OUTSOURCING: &str = "outsourcing";
pub const CATEGORY_REFUND: &str = "refund";

// ---------------------------------------------------------------------------
// Entry creation
// ---------------------------------------------------------------------------

/// Record an income entry. Returns the new ledger-entry id.
pub fn record_income(
    conn: &Connection,
    amount: i64,
    category: &str,
    payment_method: Option<&str>,
    reference: &str,
    description: &str,
    branch_id: &str,
) -> Result<String, String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO cash_transactions (id, tx_type, category, amount, payment_method, reference, description, branch_id)
         VALUES (?1, 'income', ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, category, amount, payment_method, reference, description, branch_id],
    )
    .map_err(|e| format!("insert income: {e}"))?;

    info!(entry_id = %id, category, amount, reference, "Ledger income recorded");
    Ok(id)
}

/// Record an expense entry. `amount` is the positive magnitude; the row is
/// stored negative. Returns the new ledger-entry id.
pub fn record_expense(
    conn: &Connection,
    amount: i64,
    category: &str,
    payment_method: Option<&str>,
    reference: &str,
    description: &str,
    branch_id: &str,
) -> Result<String, String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO cash_transactions (id, tx_type, category, amount, payment_method, reference, description, branch_id)
         VALUES (?1, 'expense', ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, category, -amount, payment_method, reference, description, branch_id],
    )
    .map_err(|e| format!("insert expense: {e}"))?;

    info!(entry_id = %id, category, amount, reference, "Ledger expense recorded");
    Ok(id)
}

/// Find an existing entry for `(reference, category)`. At most one such
/// entry exists per order by construction.
pub fn find_by_reference(
    conn: &Connection,
    reference: &str,
    category: &str,
) -> Result<Option<(String, i64)>, String> {
    conn.query_row(
        "SELECT id, amount FROM cash_transactions WHERE reference = ?1 AND category = ?2",
        params![reference, category],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| format!("find ledger entry: {e}"))
}

// ---------------------------------------------------------------------------
// Service-line expense sums
// ---------------------------------------------------------------------------

/// Total outsourced cost across service lines: `Σ unit_cost × quantity`.
pub fn outsourcing_cost_total(services: &[AdditionalService]) -> i64 {
    services.iter().map(|s| s.unit_cost * s.quantity).sum()
}

/// Total pure cash outflow from negative-price lines. Only lines with a
/// negative price AND zero cost count — a costed line already flows through
/// the outsourcing sum.
pub fn negative_sales_total(services: &[AdditionalService]) -> i64 {
    services
        .iter()
        .filter(|s| s.unit_price < 0 && s.unit_cost == 0)
        .map(|s| (s.unit_price * s.quantity).abs())
        .sum()
}

// ---------------------------------------------------------------------------
// Expense sync (insert / delta-adjust / remove)
// ---------------------------------------------------------------------------

/// Bring the single `(order, category)` expense entry in line with the
/// desired magnitude: insert when missing, adjust in place when it drifted,
/// delete (crediting the amount back) when the magnitude drops to zero.
pub fn sync_expense_entry(
    conn: &Connection,
    order_id: &str,
    category: &str,
    desired_magnitude: i64,
    description: &str,
    branch_id: &str,
) -> Result<(), String> {
    let existing = find_by_reference(conn, order_id, category)?;
    let desired_amount = -desired_magnitude;

    match existing {
        None if desired_magnitude > 0 => {
            record_expense(
                conn,
                desired_magnitude,
                category,
                Some("cash"),
                order_id,
                description,
                branch_id,
            )?;
        }
        Some((id, amount)) if desired_magnitude == 0 => {
            conn.execute("DELETE FROM cash_transactions WHERE id = ?1", params![id])
                .map_err(|e| format!("delete ledger entry: {e}"))?;
            info!(entry_id = %id, category, credited = amount.abs(), "Ledger expense removed");
        }
        Some((id, amount)) if amount != desired_amount => {
            conn.execute(
                "UPDATE cash_transactions SET amount = ?1, description = ?2 WHERE id = ?3",
                params![desired_amount, description, id],
            )
            .map_err(|e| format!("adjust ledger entry: {e}"))?;
            info!(
                entry_id = %id,
                category,
                delta = desired_amount - amount,
                "Ledger expense adjusted"
            );
        }
        _ => {} // already in line, or nothing to record
    }

    Ok(())
}

/// Short display reference for an order id: the segment after the prefix.
pub fn short_order_ref(order_id: &str) -> &str {
    order_id.rsplit('-').next().unwrap_or(order_id)
}

// ===========================================================================
// Tests
// ===========================================================================
