//! Customer debt records for vehicles returned with an unpaid balance.
//!
//! One debt row per work order, keyed by `work_order_id`, so re-saving the
//! same order updates the existing record instead of duplicating it.

use rusqlite::{params, Connection};
use tracing::info;
use uuid::Uuid;

use crate::ledger::short_order_ref;
use crate::types::WorkOrder;

/// Create or update the debt record for a returned-but-unpaid order.
/// Returns the debt id. Idempotent on the order reference.
pub fn create_or_update(
    conn: &Connection,
    order: &WorkOrder,
    total_amount: i64,
    paid_amount: i64,
    remaining_amount: i64,
) -> Result<String, String> {
    let customer_name = if order.customer_name.trim().is_empty() {
        "Walk-in customer"
    } else {
        order.customer_name.trim()
    };
    let description = build_description(order);
    let new_id = format!("DEBT-{}", Uuid::new_v4());

    conn.execute(
        "INSERT INTO customer_debts (
            id, work_order_id, customer_id, customer_name, customer_phone,
            license_plate, description, total_amount, paid_amount,
            remaining_amount, branch_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(work_order_id) DO UPDATE SET
            customer_name = excluded.customer_name,
            customer_phone = excluded.customer_phone,
            license_plate = excluded.license_plate,
            description = excluded.description,
            total_amount = excluded.total_amount,
            paid_amount = excluded.paid_amount,
            remaining_amount = excluded.remaining_amount,
            updated_at = datetime('now')",
        params![
            new_id,
            order.id,
            order.customer_id,
            customer_name,
            order.customer_phone,
            order.license_plate,
            description,
            total_amount,
            paid_amount,
            remaining_amount,
            order.branch_id,
        ],
    )
    .map_err(|e| format!("upsert debt: {e}"))?;

    // The conflict path keeps the original id — read it back.
    let id: String = conn
        .query_row(
            "SELECT id FROM customer_debts WHERE work_order_id = ?1",
            params![order.id],
            |row| row.get(0),
        )
        .map_err(|e| format!("read debt id: {e}"))?;

    info!(debt_id = %id, order_id = %order.id, remaining = remaining_amount, "Debt recorded");
    Ok(id)
}

/// Itemized description so the debt screen can show what is owed for
/// without opening the work order.
fn build_description(order: &WorkOrder) -> String {
    let vehicle = if order.vehicle_model.is_empty() {
        "Vehicle"
    } else {
        order.vehicle_model.as_str()
    };
    let mut description = format!("{vehicle} (work order #{})", short_order_ref(&order.id));

    if !order.issue_description.is_empty() {
        description.push_str(&format!("\nIssue: {}", order.issue_description));
    }

    if !order.parts_used.is_empty() {
        description.push_str("\n\nParts replaced:");
        for part in &order.parts_used {
            description.push_str(&format!(
                "\n  - {} x {} - {}",
                part.quantity,
                part.part_name,
                part.unit_price * part.quantity
            ));
        }
    }

    if !order.additional_services.is_empty() {
        description.push_str("\n\nServices:");
        for service in &order.additional_services {
            description.push_str(&format!(
                "\n  - {} x {} - {}",
                service.quantity,
                service.description,
                service.unit_price * service.quantity
            ));
        }
    }

    if order.labor_cost > 0 {
        description.push_str(&format!("\n\nLabor: {}", order.labor_cost));
    }
    if order.discount > 0 {
        description.push_str(&format!("\nDiscount: -{}", order.discount));
    }
    if !order.technician_name.is_empty() {
        description.push_str(&format!("\nTechnician: {}", order.technician_name));
    }

    description
}

// ===========================================================================
// Tests
// ===========================================================================
