//! Minimal customer resolution for settlement.
//!
//! The catalog subsystem owns the real customer graph; the engine only
//! needs a stable id to hang orders and debts on. Phone number is the
//! natural key — walk-ins are created as placeholders, and a changed
//! vehicle model on the draft refreshes the stored one.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

/// The slice of a customer record the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRef {
    pub id: String,
    pub name: String,
    pub vehicle_model: String,
    pub license_plate: String,
}

/// Look a customer up by phone number.
pub fn find_by_phone(conn: &Connection, phone: &str) -> Result<Option<CustomerRef>, String> {
    conn.query_row(
        "SELECT id, name, vehicle_model, license_plate FROM customers WHERE phone = ?1",
        params![phone],
        |row| {
            Ok(CustomerRef {
                id: row.get(0)?,
                name: row.get(1)?,
                vehicle_model: row.get(2)?,
                license_plate: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| format!("find customer: {e}"))
}

/// Resolve the customer for a settlement, creating a placeholder when the
/// phone is unknown. An existing customer gets their vehicle fields
/// refreshed when the draft carries a different, non-empty model.
pub fn resolve_or_create(
    conn: &Connection,
    name: &str,
    phone: &str,
    vehicle_model: &str,
    license_plate: &str,
) -> Result<String, String> {
    if let Some(existing) = find_by_phone(conn, phone)? {
        if !vehicle_model.is_empty() && existing.vehicle_model != vehicle_model {
            conn.execute(
                "UPDATE customers SET vehicle_model = ?1, license_plate = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![vehicle_model, license_plate, existing.id],
            )
            .map_err(|e| format!("refresh customer vehicle: {e}"))?;
        }
        return Ok(existing.id);
    }

    let id = format!("CUST-{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO customers (id, name, phone, vehicle_model, license_plate)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, name, phone, vehicle_model, license_plate],
    )
    .map_err(|e| format!("create customer: {e}"))?;

    info!(customer_id = %id, phone, "Placeholder customer created");
    Ok(id)
}

// ===========================================================================
// Tests
// ===========================================================================
