//! Inventory deduction gate.
//!
//! Stock leaves the shelf exactly once per work order, at the moment the
//! order first becomes fully paid. The `inventory_deducted` flag on the
//! order row is the idempotency latch: once set it never reverts while the
//! order stays paid, and every path through here checks it first.
//!
//! Deduction is decoupled from the financial commit — a failure here never
//! rolls back an already-committed payment. The orchestrator surfaces it as
//! a warning and the operator can re-trigger via [`deduct_manual`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::DbState;
use crate::types::{lines_from_json, PartUsage, PaymentStatus};

/// Result of a deduction attempt. `deducted` reports the final state of the
/// latch, so re-invoking on an already-deducted order returns `true`
/// without touching stock again.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductOutcome {
    pub deducted: bool,
}

/// Automatic gate, called by the orchestrator after a commit.
///
/// Fires only when this commit moved the order *into* paid (`entered_paid`),
/// the latch is unset, and there is at least one part line. An order that
/// was already paid before the commit does not re-fire.
pub(crate) fn maybe_deduct_on_payment(
    conn: &Connection,
    order_id: &str,
    entered_paid: bool,
) -> Result<DeductOutcome, String> {
    if !entered_paid {
        let deducted = read_latch(conn, order_id)?;
        return Ok(DeductOutcome { deducted });
    }
    deduct_if_unset(conn, order_id)
}

/// Operator-triggered override for orders whose automatic deduction was
/// missed (e.g. data migrated from before the gate existed). Same
/// idempotency check as the automatic path.
pub fn deduct_manual(db: &DbState, order_id: &str) -> Result<DeductOutcome, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    deduct_if_unset(&conn, order_id)
}

fn read_latch(conn: &Connection, order_id: &str) -> Result<bool, String> {
    conn.query_row(
        "SELECT inventory_deducted FROM work_orders WHERE id = ?1",
        params![order_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(|e| format!("read deduction flag: {e}"))?
    .map(|v| v != 0)
    .ok_or_else(|| format!("Order not found: {order_id}"))
}

/// Decrement stock for each part line and set the latch, all in one
/// transaction. No-op (reporting existing state) when the latch is already
/// set, the order is not paid, or there are no part lines.
fn deduct_if_unset(conn: &Connection, order_id: &str) -> Result<DeductOutcome, String> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT inventory_deducted, payment_status, parts_used
             FROM work_orders WHERE id = ?1",
            params![order_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| format!("read order: {e}"))?;

    let (deducted, payment_status, parts_json) =
        row.ok_or_else(|| format!("Order not found: {order_id}"))?;

    if deducted != 0 {
        return Ok(DeductOutcome { deducted: true });
    }
    if PaymentStatus::parse(&payment_status) != PaymentStatus::Paid {
        return Ok(DeductOutcome { deducted: false });
    }
    let parts: Vec<PartUsage> = lines_from_json(&parts_json);
    if parts.is_empty() {
        return Ok(DeductOutcome { deducted: false });
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        for part in &parts {
            let affected = conn
                .execute(
                    "UPDATE parts SET stock = stock - ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![part.quantity, part.part_id],
                )
                .map_err(|e| format!("decrement stock for {}: {e}", part.part_id))?;
            if affected == 0 {
                warn!(part_id = %part.part_id, order_id, "part not in local stock, skipping decrement");
                continue;
            }

            let stock: i64 = conn
                .query_row(
                    "SELECT stock FROM parts WHERE id = ?1",
                    params![part.part_id],
                    |row| row.get(0),
                )
                .map_err(|e| format!("read stock: {e}"))?;
            if stock < 0 {
                warn!(part_id = %part.part_id, stock, "stock went negative after deduction");
            }
        }

        conn.execute(
            "UPDATE work_orders SET inventory_deducted = 1, updated_at = datetime('now')
             WHERE id = ?1",
            params![order_id],
        )
        .map_err(|e| format!("set deduction flag: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(order_id, lines = parts.len(), "Inventory deducted");
    Ok(DeductOutcome { deducted: true })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::types::lines_to_json;
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn seed(conn: &Connection, order_id: &str, payment_status: &str, parts: &[PartUsage]) {
        conn.execute(
            "INSERT INTO parts (id, name, stock) VALUES ('P-1', 'Brake pads', 10)",
            [],
        )
        .ok();
        conn.execute(
            "INSERT INTO work_orders (id, customer_name, customer_phone, payment_status, parts_used)
             VALUES (?1, 'A', '0901234567', ?2, ?3)",
            params![order_id, payment_status, lines_to_json(parts)],
        )
        .unwrap();
    }

    fn part_line(qty: i64) -> PartUsage {
        PartUsage {
            part_id: "P-1".into(),
            part_name: "Brake pads".into(),
            sku: String::new(),
            quantity: qty,
            unit_price: 50_000,
            unit_cost: 30_000,
        }
    }

    fn stock(conn: &Connection) -> i64 {
        conn.query_row("SELECT stock FROM parts WHERE id = 'P-1'", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_deduction_is_idempotent() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        seed(&conn, "SC-1", "paid", &[part_line(2)]);

        let first = maybe_deduct_on_payment(&conn, "SC-1", true).unwrap();
        assert!(first.deducted);
        assert_eq!(stock(&conn), 8);

        // second invocation reports deducted but does not decrement again
        let second = maybe_deduct_on_payment(&conn, "SC-1", true).unwrap();
        assert!(second.deducted);
        assert_eq!(stock(&conn), 8);
    }

    #[test]
    fn test_no_fire_without_paid_transition() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        seed(&conn, "SC-2", "paid", &[part_line(2)]);

        // order is already paid but this commit did not move it into paid
        let outcome = maybe_deduct_on_payment(&conn, "SC-2", false).unwrap();
        assert!(!outcome.deducted);
        assert_eq!(stock(&conn), 10);
    }

    #[test]
    fn test_no_fire_when_unpaid_or_partless() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        seed(&conn, "SC-3", "partial", &[part_line(2)]);
        let outcome = maybe_deduct_on_payment(&conn, "SC-3", true).unwrap();
        assert!(!outcome.deducted);
        assert_eq!(stock(&conn), 10);

        seed(&conn, "SC-4", "paid", &[]);
        let outcome = maybe_deduct_on_payment(&conn, "SC-4", true).unwrap();
        assert!(!outcome.deducted);
    }

    #[test]
    fn test_manual_override_same_idempotency() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            seed(&conn, "SC-5", "paid", &[part_line(3)]);
        }

        // Missed automatic deduction; operator triggers it.
        let outcome = deduct_manual(&db, "SC-5").unwrap();
        assert!(outcome.deducted);

        let again = deduct_manual(&db, "SC-5").unwrap();
        assert!(again.deducted);

        let conn = db.conn.lock().unwrap();
        assert_eq!(stock(&conn), 7, "stock decremented only once");
    }

    #[test]
    fn test_unknown_part_is_skipped_not_fatal() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let ghost = PartUsage {
            part_id: "P-404".into(),
            part_name: "Ghost".into(),
            sku: String::new(),
            quantity: 1,
            unit_price: 10_000,
            unit_cost: 0,
        };
        seed(&conn, "SC-6", "paid", &[part_line(1), ghost]);

        let outcome = maybe_deduct_on_payment(&conn, "SC-6", true).unwrap();
        assert!(outcome.deducted);
        assert_eq!(stock(&conn), 9);
    }

    #[test]
    fn test_missing_order_is_an_error() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let err = maybe_deduct_on_payment(&conn, "SC-404", true).unwrap_err();
        assert!(err.contains("not found"));
    }
}
