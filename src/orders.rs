//! Transaction orchestrator: commits a work-order draft as one consistent
//! unit, creating or updating.
//!
//! This is the only layer that performs effects and the only layer that
//! raises hard errors. The pipeline per commit:
//!
//! 1. validate the typed input (fail fast, nothing written),
//! 2. recompute totals and allocate payments server-side,
//! 3. write the order row plus deposit/balance income ledger entries in one
//!    `BEGIN IMMEDIATE` transaction,
//! 4. run the decoupled follow-ups — expense-entry sync, inventory
//!    deduction, debt upsert — reporting their failures as warnings on the
//!    successful outcome, never rolling the committed payment back.
//!
//! A process-wide per-order guard rejects a second commit while one is in
//! flight; the permit is released on `Drop` so an error path cannot leave
//! an order permanently locked.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::allocate::allocate;
use crate::customers;
use crate::db::{self, DbState};
use crate::debts;
use crate::error::{SettlementError, SettlementWarning, ValidationError};
use crate::inventory;
use crate::ledger::{
    self, short_order_ref, CATEGORY_OUTSOURCING, CATEGORY_REFUND, CATEGORY_SERVICE_DEPOSIT,
    CATEGORY_SERVICE_INCOME,
};
use crate::status::OrderStatus;
use crate::totals::compute_totals;
use crate::types::{
    lines_from_json, lines_to_json, pricing_fingerprint, PaymentMethod, PaymentStatus, WorkOrder,
    WorkOrderInput,
};

/// Default order-id prefix when the shop has not configured one.
const DEFAULT_ORDER_PREFIX: &str = "SC";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub order_id: String,
    pub deposit_transaction_id: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub inventory_deducted: bool,
    pub debt_id: Option<String>,
    pub warnings: Vec<SettlementWarning>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    /// Set only when this commit took a new deposit (ledger delta entry).
    pub deposit_transaction_id: Option<String>,
    /// Set only when this commit took a new balance payment.
    pub payment_transaction_id: Option<String>,
    pub inventory_deducted: bool,
    pub debt_id: Option<String>,
    pub row_version: i64,
    pub warnings: Vec<SettlementWarning>,
}

// ---------------------------------------------------------------------------
// In-flight commit guard
// ---------------------------------------------------------------------------

static IN_FLIGHT: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Permit for committing one order. Dropping it releases the slot, which is
/// the finally-equivalent the double-submit protection relies on.
struct CommitPermit {
    order_id: String,
}

impl CommitPermit {
    fn acquire(order_id: &str) -> Result<CommitPermit, SettlementError> {
        let set = IN_FLIGHT.get_or_init(|| Mutex::new(HashSet::new()));
        let mut keys = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(order_id.to_string()) {
            return Err(SettlementError::CommitInFlight(order_id.to_string()));
        }
        Ok(CommitPermit {
            order_id: order_id.to_string(),
        })
    }
}

impl Drop for CommitPermit {
    fn drop(&mut self) {
        if let Some(set) = IN_FLIGHT.get() {
            let mut keys = set.lock().unwrap_or_else(PoisonError::into_inner);
            keys.remove(&self.order_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Commit a new work order with its payment allocation.
pub fn create_settled(
    db: &DbState,
    input: &WorkOrderInput,
) -> Result<CreateOutcome, SettlementError> {
    let customer_name = input.customer_name.trim();
    let customer_phone = input.customer_phone.trim();
    validate_customer(customer_name, customer_phone)?;

    let totals = compute_totals(
        input.labor_cost,
        &input.parts_used,
        &input.additional_services,
        input.discount,
    );

    let alloc = allocate(
        totals.total,
        0,
        input.deposit_amount,
        0,
        input.additional_payment,
        input.status,
    )?;
    validate_settlement(input, alloc.deposit, alloc.additional_payment, totals.total)?;

    let conn = db
        .conn
        .lock()
        .map_err(|e| SettlementError::Storage(e.to_string()))?;

    let order_id = generate_order_id(&conn)?;
    let _permit = CommitPermit::acquire(&order_id)?;
    let branch_id =
        db::get_setting(&conn, "shop", "branch_id").unwrap_or_else(|| "main".to_string());
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| SettlementError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<(Option<String>, Option<String>), SettlementError> {
        let customer_id = customers::resolve_or_create(
            &conn,
            customer_name,
            customer_phone,
            input.vehicle_model.trim(),
            input.license_plate.trim(),
        )
        .map_err(SettlementError::Storage)?;

        let deposit_tx_id = if alloc.deposit > 0 {
            Some(
                ledger::record_income(
                    &conn,
                    alloc.deposit,
                    CATEGORY_SERVICE_DEPOSIT,
                    input.payment_method.map(|m| m.as_str()),
                    &order_id,
                    &format!(
                        "Deposit for work order #{} - {}",
                        short_order_ref(&order_id),
                        customer_name
                    ),
                    &branch_id,
                )
                .map_err(SettlementError::Storage)?,
            )
        } else {
            None
        };

        let payment_tx_id = if alloc.additional_payment > 0 {
            Some(
                ledger::record_income(
                    &conn,
                    alloc.additional_payment,
                    CATEGORY_SERVICE_INCOME,
                    input.payment_method.map(|m| m.as_str()),
                    &order_id,
                    &format!(
                        "Balance payment for work order #{} - {}",
                        short_order_ref(&order_id),
                        customer_name
                    ),
                    &branch_id,
                )
                .map_err(SettlementError::Storage)?,
            )
        } else {
            None
        };

        conn.execute(
            "INSERT INTO work_orders (
                id, branch_id, customer_id, customer_name, customer_phone,
                vehicle_model, license_plate, current_km, issue_description,
                technician_name, status, labor_cost, discount, parts_used,
                additional_services, total, payment_status, payment_method,
                deposit_amount, deposit_transaction_id, additional_payment,
                payment_transaction_id, total_paid, remaining_amount,
                inventory_deducted, refunded, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                      0, 0, ?25, ?25)",
            params![
                order_id,
                branch_id,
                customer_id,
                customer_name,
                customer_phone,
                input.vehicle_model.trim(),
                input.license_plate.trim(),
                input.current_km,
                input.issue_description.trim(),
                input.technician_name.trim(),
                input.status.as_str(),
                input.labor_cost,
                totals.discount_amount,
                lines_to_json(&input.parts_used),
                lines_to_json(&input.additional_services),
                totals.total,
                alloc.payment_status.as_str(),
                input.payment_method.map(|m| m.as_str()),
                alloc.deposit,
                deposit_tx_id,
                alloc.additional_payment,
                payment_tx_id,
                alloc.total_paid,
                alloc.remaining_amount,
                now,
            ],
        )
        .map_err(|e| SettlementError::Storage(format!("insert order: {e}")))?;

        Ok((deposit_tx_id, payment_tx_id))
    })();

    let (deposit_tx_id, payment_tx_id) = match result {
        Ok(ids) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| SettlementError::Storage(format!("commit: {e}")))?;
            ids
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    let entered_paid = alloc.payment_status == PaymentStatus::Paid;
    let (inventory_deducted, debt_id, warnings) =
        settle_side_effects(&conn, &order_id, &branch_id, entered_paid);

    info!(
        order_id = %order_id,
        total = totals.total,
        paid = alloc.total_paid,
        status = input.status.as_str(),
        payment_status = alloc.payment_status.as_str(),
        "Work order created"
    );

    Ok(CreateOutcome {
        order_id,
        deposit_transaction_id: deposit_tx_id,
        payment_transaction_id: payment_tx_id,
        inventory_deducted,
        debt_id,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Commit changes to an existing work order. Ledger entries are emitted for
/// the deposit/balance-payment *differences* only, never absolute values.
pub fn update_settled(
    db: &DbState,
    order_id: &str,
    input: &WorkOrderInput,
) -> Result<UpdateOutcome, SettlementError> {
    let customer_name = input.customer_name.trim();
    let customer_phone = input.customer_phone.trim();
    validate_customer(customer_name, customer_phone)?;

    // Guard first: the double-submit check must run before any other work
    // so a redundant click is rejected synchronously.
    let _permit = CommitPermit::acquire(order_id)?;

    let conn = db
        .conn
        .lock()
        .map_err(|e| SettlementError::Storage(e.to_string()))?;

    let existing = read_order(&conn, order_id)
        .map_err(SettlementError::Storage)?
        .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;

    if let Some(expected) = input.expected_row_version {
        if existing.row_version != expected {
            return Err(SettlementError::VersionConflict {
                order_id: order_id.to_string(),
                expected,
                found: existing.row_version,
            });
        }
    }

    let totals = compute_totals(
        input.labor_cost,
        &input.parts_used,
        &input.additional_services,
        input.discount,
    );

    // Settled or refunded orders lock every price-bearing field; only
    // service cost entries (margin tracking) stay editable.
    if existing.pricing_locked() {
        let before = pricing_fingerprint(
            existing.labor_cost,
            existing.discount,
            &existing.parts_used,
            &existing.additional_services,
        );
        let after = pricing_fingerprint(
            input.labor_cost,
            totals.discount_amount,
            &input.parts_used,
            &input.additional_services,
        );
        if before != after {
            return Err(ValidationError::PricingLocked.into());
        }
    }

    let alloc = allocate(
        totals.total,
        existing.deposit_amount,
        input.deposit_amount,
        existing.additional_payment,
        input.additional_payment,
        input.status,
    )?;

    let deposit_delta = alloc.deposit - existing.deposit_amount;
    let additional_delta = alloc.additional_payment - existing.additional_payment;
    validate_settlement(input, deposit_delta, additional_delta, totals.total)?;

    let branch_id = existing.branch_id.clone();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| SettlementError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<(Option<String>, Option<String>), SettlementError> {
        let customer_id = customers::resolve_or_create(
            &conn,
            customer_name,
            customer_phone,
            input.vehicle_model.trim(),
            input.license_plate.trim(),
        )
        .map_err(SettlementError::Storage)?;

        let deposit_tx_id = if deposit_delta > 0 {
            Some(
                ledger::record_income(
                    &conn,
                    deposit_delta,
                    CATEGORY_SERVICE_DEPOSIT,
                    input.payment_method.map(|m| m.as_str()),
                    order_id,
                    &format!(
                        "Deposit for work order #{} - {}",
                        short_order_ref(order_id),
                        customer_name
                    ),
                    &branch_id,
                )
                .map_err(SettlementError::Storage)?,
            )
        } else {
            None
        };

        let payment_tx_id = if additional_delta > 0 {
            Some(
                ledger::record_income(
                    &conn,
                    additional_delta,
                    CATEGORY_SERVICE_INCOME,
                    input.payment_method.map(|m| m.as_str()),
                    order_id,
                    &format!(
                        "Balance payment for work order #{} - {}",
                        short_order_ref(order_id),
                        customer_name
                    ),
                    &branch_id,
                )
                .map_err(SettlementError::Storage)?,
            )
        } else {
            None
        };

        conn.execute(
            "UPDATE work_orders SET
                customer_id = ?1, customer_name = ?2, customer_phone = ?3,
                vehicle_model = ?4, license_plate = ?5, current_km = ?6,
                issue_description = ?7, technician_name = ?8, status = ?9,
                labor_cost = ?10, discount = ?11, parts_used = ?12,
                additional_services = ?13, total = ?14, payment_status = ?15,
                payment_method = COALESCE(?16, payment_method),
                deposit_amount = ?17,
                deposit_transaction_id = COALESCE(?18, deposit_transaction_id),
                additional_payment = ?19,
                payment_transaction_id = COALESCE(?20, payment_transaction_id),
                total_paid = ?21, remaining_amount = ?22,
                row_version = row_version + 1, updated_at = ?23
             WHERE id = ?24",
            params![
                customer_id,
                customer_name,
                customer_phone,
                input.vehicle_model.trim(),
                input.license_plate.trim(),
                input.current_km,
                input.issue_description.trim(),
                input.technician_name.trim(),
                input.status.as_str(),
                input.labor_cost,
                totals.discount_amount,
                lines_to_json(&input.parts_used),
                lines_to_json(&input.additional_services),
                totals.total,
                alloc.payment_status.as_str(),
                input.payment_method.map(|m| m.as_str()),
                alloc.deposit,
                deposit_tx_id,
                alloc.additional_payment,
                payment_tx_id,
                alloc.total_paid,
                alloc.remaining_amount,
                now,
                order_id,
            ],
        )
        .map_err(|e| SettlementError::Storage(format!("update order: {e}")))?;

        Ok((deposit_tx_id, payment_tx_id))
    })();

    let (deposit_tx_id, payment_tx_id) = match result {
        Ok(ids) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| SettlementError::Storage(format!("commit: {e}")))?;
            ids
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    let entered_paid = existing.payment_status != PaymentStatus::Paid
        && alloc.payment_status == PaymentStatus::Paid;
    let (inventory_deducted, debt_id, warnings) =
        settle_side_effects(&conn, order_id, &branch_id, entered_paid);

    info!(
        order_id = %order_id,
        total = totals.total,
        paid = alloc.total_paid,
        payment_status = alloc.payment_status.as_str(),
        "Work order updated"
    );

    Ok(UpdateOutcome {
        deposit_transaction_id: deposit_tx_id,
        payment_transaction_id: payment_tx_id,
        inventory_deducted,
        debt_id,
        row_version: existing.row_version + 1,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Decoupled follow-ups
// ---------------------------------------------------------------------------

/// Expense-entry sync, inventory deduction and debt upsert. All three run
/// after the financial commit and report failures as warnings — the
/// committed order/payment is never rolled back for them.
fn settle_side_effects(
    conn: &Connection,
    order_id: &str,
    branch_id: &str,
    entered_paid: bool,
) -> (bool, Option<String>, Vec<SettlementWarning>) {
    let mut warnings = Vec::new();

    let order = match read_order(conn, order_id) {
        Ok(Some(order)) => order,
        Ok(None) | Err(_) => {
            // The commit just succeeded, so this is unreachable in practice.
            warnings.push(SettlementWarning::LedgerAdjustment(format!(
                "order {order_id} unreadable after commit"
            )));
            return (false, None, warnings);
        }
    };

    // Outsourced-cost expense and negative-price cash-out, delta-adjusted.
    let service_names: Vec<&str> = order
        .additional_services
        .iter()
        .map(|s| s.description.as_str())
        .collect();
    let outsourcing = ledger::outsourcing_cost_total(&order.additional_services);
    if let Err(e) = ledger::sync_expense_entry(
        conn,
        order_id,
        CATEGORY_OUTSOURCING,
        outsourcing,
        &format!(
            "Outsourced work - order #{} - {}",
            short_order_ref(order_id),
            service_names.join(", ")
        ),
        branch_id,
    ) {
        warn!(order_id, error = %e, "outsourcing expense sync failed");
        warnings.push(SettlementWarning::LedgerAdjustment(e));
    }

    let negative_sales = ledger::negative_sales_total(&order.additional_services);
    if let Err(e) = ledger::sync_expense_entry(
        conn,
        order_id,
        CATEGORY_REFUND,
        negative_sales,
        &format!(
            "Cash out (negative price) - order #{}",
            short_order_ref(order_id)
        ),
        branch_id,
    ) {
        warn!(order_id, error = %e, "negative-sale expense sync failed");
        warnings.push(SettlementWarning::LedgerAdjustment(e));
    }

    // Inventory deduction, exactly once per order.
    let inventory_deducted = match inventory::maybe_deduct_on_payment(conn, order_id, entered_paid)
    {
        Ok(outcome) => outcome.deducted,
        Err(e) => {
            warn!(order_id, error = %e, "inventory deduction failed after commit");
            warnings.push(SettlementWarning::InventoryDeduction(e));
            order.inventory_deducted
        }
    };

    // Debt when the vehicle leaves with an unpaid remainder.
    let mut debt_id = None;
    if order
        .status
        .triggers_debt(order.total, order.remaining_amount)
    {
        match debts::create_or_update(
            conn,
            &order,
            order.total,
            order.total_paid,
            order.remaining_amount,
        ) {
            Ok(id) => debt_id = Some(id),
            Err(e) => {
                warn!(order_id, error = %e, "debt creation failed after commit");
                warnings.push(SettlementWarning::DebtCreation(e));
            }
        }
    }

    (inventory_deducted, debt_id, warnings)
}

// ---------------------------------------------------------------------------
// Refund flag and deposit backfill
// ---------------------------------------------------------------------------

/// Mark an order refunded. Set by the refund workflow; from then on the
/// engine rejects all price/part-line mutations.
pub fn mark_refunded(db: &DbState, order_id: &str) -> Result<(), SettlementError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SettlementError::Storage(e.to_string()))?;
    let affected = conn.execute(
        "UPDATE work_orders SET refunded = 1, row_version = row_version + 1,
            updated_at = datetime('now')
         WHERE id = ?1",
        params![order_id],
    )?;
    if affected == 0 {
        return Err(SettlementError::OrderNotFound(order_id.to_string()));
    }
    info!(order_id, "Order marked refunded");
    Ok(())
}

/// Migration/backfill path for correcting a deposit recorded before the
/// write-once rule existed. Bypasses the allocator's deposit freeze but
/// still enforces bounds, emits the ledger delta, and re-derives the
/// payment figures.
pub fn backfill_deposit(
    db: &DbState,
    order_id: &str,
    new_deposit: i64,
) -> Result<Option<String>, SettlementError> {
    if new_deposit < 0 {
        return Err(ValidationError::NegativeDeposit.into());
    }

    let _permit = CommitPermit::acquire(order_id)?;

    let conn = db
        .conn
        .lock()
        .map_err(|e| SettlementError::Storage(e.to_string()))?;

    let existing = read_order(&conn, order_id)
        .map_err(SettlementError::Storage)?
        .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;

    if existing.total > 0 && new_deposit > existing.total {
        return Err(ValidationError::DepositExceedsTotal {
            deposit: new_deposit,
            total: existing.total,
        }
        .into());
    }
    if existing.total <= 0 && new_deposit > 0 {
        return Err(ValidationError::DepositWithoutCharge {
            deposit: new_deposit,
        }
        .into());
    }

    let delta = new_deposit - existing.deposit_amount;
    if delta == 0 {
        return Ok(None);
    }

    let total_paid = (new_deposit + existing.additional_payment).min(existing.total.max(0));
    let remaining = (existing.total - total_paid).max(0);
    let payment_status = crate::allocate::derive_payment_status(existing.total, total_paid);

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| SettlementError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<Option<String>, SettlementError> {
        let tx_id = if delta > 0 {
            ledger::record_income(
                &conn,
                delta,
                CATEGORY_SERVICE_DEPOSIT,
                existing.payment_method.map(|m| m.as_str()),
                order_id,
                &format!("Deposit backfill #{}", short_order_ref(order_id)),
                &existing.branch_id,
            )
            .map_err(SettlementError::Storage)?
        } else {
            ledger::record_expense(
                &conn,
                -delta,
                CATEGORY_SERVICE_DEPOSIT,
                existing.payment_method.map(|m| m.as_str()),
                order_id,
                &format!("Deposit correction #{}", short_order_ref(order_id)),
                &existing.branch_id,
            )
            .map_err(SettlementError::Storage)?
        };

        conn.execute(
            "UPDATE work_orders SET
                deposit_amount = ?1, total_paid = ?2, remaining_amount = ?3,
                payment_status = ?4, row_version = row_version + 1,
                updated_at = datetime('now')
             WHERE id = ?5",
            params![
                new_deposit,
                total_paid,
                remaining,
                payment_status.as_str(),
                order_id
            ],
        )
        .map_err(|e| SettlementError::Storage(format!("update order: {e}")))?;

        Ok(Some(tx_id))
    })();

    match result {
        Ok(tx_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| SettlementError::Storage(format!("commit: {e}")))?;
            let entered_paid = existing.payment_status != PaymentStatus::Paid
                && payment_status == PaymentStatus::Paid;
            if entered_paid {
                if let Err(e) = inventory::maybe_deduct_on_payment(&conn, order_id, true) {
                    warn!(order_id, error = %e, "inventory deduction failed after backfill");
                }
            }
            info!(order_id, delta, "Deposit backfilled");
            Ok(tx_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetch an order by id.
pub fn get_order(db: &DbState, order_id: &str) -> Result<Option<WorkOrder>, SettlementError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SettlementError::Storage(e.to_string()))?;
    read_order(&conn, order_id).map_err(SettlementError::Storage)
}

fn read_order(conn: &Connection, order_id: &str) -> Result<Option<WorkOrder>, String> {
    conn.query_row(
        "SELECT id, branch_id, customer_id, customer_name, customer_phone,
                vehicle_model, license_plate, current_km, issue_description,
                technician_name, status, labor_cost, discount, parts_used,
                additional_services, total, payment_status, payment_method,
                deposit_amount, deposit_transaction_id, additional_payment,
                payment_transaction_id, total_paid, remaining_amount,
                inventory_deducted, refunded, row_version, created_at, updated_at
         FROM work_orders WHERE id = ?1",
        params![order_id],
        |row| {
            Ok(WorkOrder {
                id: row.get(0)?,
                branch_id: row.get(1)?,
                customer_id: row.get(2)?,
                customer_name: row.get(3)?,
                customer_phone: row.get(4)?,
                vehicle_model: row.get(5)?,
                license_plate: row.get(6)?,
                current_km: row.get(7)?,
                issue_description: row.get(8)?,
                technician_name: row.get(9)?,
                status: OrderStatus::parse(&row.get::<_, String>(10)?),
                labor_cost: row.get(11)?,
                discount: row.get(12)?,
                parts_used: lines_from_json(&row.get::<_, String>(13)?),
                additional_services: lines_from_json(&row.get::<_, String>(14)?),
                total: row.get(15)?,
                payment_status: PaymentStatus::parse(&row.get::<_, String>(16)?),
                payment_method: row
                    .get::<_, Option<String>>(17)?
                    .as_deref()
                    .and_then(PaymentMethod::parse),
                deposit_amount: row.get(18)?,
                deposit_transaction_id: row.get(19)?,
                additional_payment: row.get(20)?,
                payment_transaction_id: row.get(21)?,
                total_paid: row.get(22)?,
                remaining_amount: row.get(23)?,
                inventory_deducted: row.get::<_, i64>(24)? != 0,
                refunded: row.get::<_, i64>(25)? != 0,
                row_version: row.get(26)?,
                created_at: row.get(27)?,
                updated_at: row.get(28)?,
            })
        },
    )
    .optional()
    .map_err(|e| format!("read order: {e}"))
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_customer(name: &str, phone: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::MissingCustomerName);
    }
    if phone.is_empty() {
        return Err(ValidationError::MissingCustomerPhone);
    }
    if !is_valid_phone(phone) {
        return Err(ValidationError::InvalidPhone);
    }
    Ok(())
}

/// Checks that follow payment allocation: a method must accompany any new
/// money taken this commit, and handing the vehicle back requires a priced
/// order.
fn validate_settlement(
    input: &WorkOrderInput,
    deposit_delta: i64,
    additional_delta: i64,
    total: i64,
) -> Result<(), ValidationError> {
    if (deposit_delta > 0 || additional_delta > 0) && input.payment_method.is_none() {
        return Err(ValidationError::MissingPaymentMethod);
    }
    if total <= 0 && input.status.requires_positive_total() {
        return Err(ValidationError::ZeroTotalAtReturn);
    }
    Ok(())
}

/// Vietnamese mobile/landline numbers: exactly 10 or 11 digits.
fn is_valid_phone(phone: &str) -> bool {
    (10..=11).contains(&phone.len()) && phone.bytes().all(|b| b.is_ascii_digit())
}

/// Client-side order id: shop prefix + epoch millis, probed for uniqueness
/// so two terminals creating in the same millisecond cannot collide.
fn generate_order_id(conn: &Connection) -> Result<String, SettlementError> {
    let prefix = db::get_setting(conn, "shop", "work_order_prefix")
        .unwrap_or_else(|| DEFAULT_ORDER_PREFIX.to_string());
    let mut millis = Utc::now().timestamp_millis();
    loop {
        let candidate = format!("{prefix}-{millis}");
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM work_orders WHERE id = ?1",
                params![candidate],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(candidate);
        }
        millis += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::totals::DiscountInput;
    use crate::types::{AdditionalService, PartUsage};
    use rusqlite::Connection;
    use serial_test::serial;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn.execute(
            "INSERT INTO parts (id, name, stock, retail_price, cost_price)
             VALUES ('P-1', 'Brake pads', 10, 50000, 30000)",
            [],
        )
        .unwrap();
        DbState {
            conn: StdMutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn base_input() -> WorkOrderInput {
        WorkOrderInput {
            customer_name: "Nguyen Van A".into(),
            customer_phone: "0901234567".into(),
            vehicle_model: "Honda Wave Alpha".into(),
            license_plate: "59-X1 123.45".into(),
            current_km: Some(42_000),
            issue_description: "Brake squeal".into(),
            technician_name: "Minh".into(),
            status: OrderStatus::Received,
            labor_cost: 100_000,
            discount: DiscountInput::default(),
            parts_used: vec![PartUsage {
                part_id: "P-1".into(),
                part_name: "Brake pads".into(),
                sku: "BP-01".into(),
                quantity: 2,
                unit_price: 50_000,
                unit_cost: 30_000,
            }],
            additional_services: vec![],
            payment_method: None,
            deposit_amount: 0,
            additional_payment: 0,
            expected_row_version: None,
        }
    }

    fn ledger_sum(db: &DbState, order_id: &str, category: &str) -> (i64, i64) {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM cash_transactions
             WHERE reference = ?1 AND category = ?2",
            params![order_id, category],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap()
    }

    #[test]
    #[serial]
    fn test_create_with_deposit_yields_partial() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 80_000;
        input.payment_method = Some(PaymentMethod::Cash);

        let outcome = create_settled(&db, &input).expect("create");
        assert!(outcome.deposit_transaction_id.is_some());
        assert!(outcome.payment_transaction_id.is_none());
        assert!(!outcome.inventory_deducted);
        assert!(outcome.warnings.is_empty());

        let order = get_order(&db, &outcome.order_id).unwrap().unwrap();
        assert_eq!(order.total, 200_000);
        assert_eq!(order.deposit_amount, 80_000);
        assert_eq!(order.total_paid, 80_000);
        assert_eq!(order.remaining_amount, 120_000);
        assert_eq!(order.payment_status, PaymentStatus::Partial);

        let (entries, sum) = ledger_sum(&db, &order.id, CATEGORY_SERVICE_DEPOSIT);
        assert_eq!(entries, 1);
        assert_eq!(sum, 80_000);
    }

    #[test]
    #[serial]
    fn test_return_clamps_balance_payment_and_deducts() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 80_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create");

        // hand the bike back, operator keys an imprecise "pay in full"
        input.status = OrderStatus::Returned;
        input.additional_payment = 150_000;
        let outcome = update_settled(&db, &created.order_id, &input).expect("update");

        let order = get_order(&db, &created.order_id).unwrap().unwrap();
        assert_eq!(order.additional_payment, 120_000, "clamped to total - deposit");
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(order.remaining_amount, 0);

        // clamped delta, not the requested figure, hits the ledger
        let (entries, sum) = ledger_sum(&db, &order.id, CATEGORY_SERVICE_INCOME);
        assert_eq!(entries, 1);
        assert_eq!(sum, 120_000);

        // paid + part lines -> stock deducted exactly once
        assert!(outcome.inventory_deducted);
        let conn = db.conn.lock().unwrap();
        let stock: i64 = conn
            .query_row("SELECT stock FROM parts WHERE id = 'P-1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stock, 8);
        drop(conn);

        // fully paid -> no debt
        assert!(outcome.debt_id.is_none());
        let conn = db.conn.lock().unwrap();
        let debts: i64 = conn
            .query_row("SELECT COUNT(*) FROM customer_debts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(debts, 0);
    }

    #[test]
    #[serial]
    fn test_deposit_rejected_when_order_has_no_charge() {
        let db = test_db();
        let mut input = base_input();
        input.labor_cost = 0;
        input.parts_used.clear();
        input.deposit_amount = 50_000;
        input.payment_method = Some(PaymentMethod::Cash);

        let err = create_settled(&db, &input).unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Validation(ValidationError::DepositWithoutCharge { deposit: 50_000 })
        ));

        // fail fast: nothing was written
        let conn = db.conn.lock().unwrap();
        let orders: i64 = conn
            .query_row("SELECT COUNT(*) FROM work_orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orders, 0);
    }

    #[test]
    #[serial]
    fn test_unpaid_return_creates_debt_once() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 125_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create");

        input.status = OrderStatus::Returned;
        let outcome = update_settled(&db, &created.order_id, &input).expect("update");
        let debt_id = outcome.debt_id.expect("debt created");

        let conn = db.conn.lock().unwrap();
        let (count, remaining): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(remaining_amount) FROM customer_debts WHERE work_order_id = ?1",
                params![created.order_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(remaining, 75_000);
        drop(conn);

        // re-saving without further payment must not duplicate the debt
        let outcome2 = update_settled(&db, &created.order_id, &input).expect("re-save");
        assert_eq!(outcome2.debt_id.as_deref(), Some(debt_id.as_str()));
        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM customer_debts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    #[serial]
    fn test_negative_line_creates_single_cash_out() {
        let db = test_db();
        let mut input = base_input();
        input.additional_services = vec![AdditionalService {
            id: "S-1".into(),
            description: "Goodwill credit".into(),
            quantity: 1,
            unit_price: -20_000,
            unit_cost: 0,
        }];

        let created = create_settled(&db, &input).expect("create");

        let (refund_entries, refund_sum) = ledger_sum(&db, &created.order_id, CATEGORY_REFUND);
        assert_eq!(refund_entries, 1);
        assert_eq!(refund_sum, -20_000);

        // not double-counted into the outsourcing expense
        let (outsourcing_entries, _) = ledger_sum(&db, &created.order_id, CATEGORY_OUTSOURCING);
        assert_eq!(outsourcing_entries, 0);
    }

    #[test]
    #[serial]
    fn test_validation_order_and_fail_fast() {
        let db = test_db();

        let mut input = base_input();
        input.customer_name = "  ".into();
        assert!(matches!(
            create_settled(&db, &input).unwrap_err(),
            SettlementError::Validation(ValidationError::MissingCustomerName)
        ));

        let mut input = base_input();
        input.customer_phone = "12345".into();
        assert!(matches!(
            create_settled(&db, &input).unwrap_err(),
            SettlementError::Validation(ValidationError::InvalidPhone)
        ));

        // deposit without method fails before the write
        let mut input = base_input();
        input.deposit_amount = 80_000;
        assert!(matches!(
            create_settled(&db, &input).unwrap_err(),
            SettlementError::Validation(ValidationError::MissingPaymentMethod)
        ));

        // returning an unpriced order
        let mut input = base_input();
        input.labor_cost = 0;
        input.parts_used.clear();
        input.status = OrderStatus::Returned;
        assert!(matches!(
            create_settled(&db, &input).unwrap_err(),
            SettlementError::Validation(ValidationError::ZeroTotalAtReturn)
        ));

        let conn = db.conn.lock().unwrap();
        let orders: i64 = conn
            .query_row("SELECT COUNT(*) FROM work_orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orders, 0, "no partial writes on validation failure");
    }

    #[test]
    #[serial]
    fn test_deposit_frozen_on_update() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 80_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create");

        input.deposit_amount = 100_000;
        assert!(matches!(
            update_settled(&db, &created.order_id, &input).unwrap_err(),
            SettlementError::Validation(ValidationError::DepositLocked)
        ));

        // the backfill path may change it, emitting the delta
        let tx = backfill_deposit(&db, &created.order_id, 100_000)
            .expect("backfill")
            .expect("ledger delta");
        assert!(!tx.is_empty());
        let order = get_order(&db, &created.order_id).unwrap().unwrap();
        assert_eq!(order.deposit_amount, 100_000);

        let (entries, sum) = ledger_sum(&db, &created.order_id, CATEGORY_SERVICE_DEPOSIT);
        assert_eq!(entries, 2, "original entry plus backfill delta");
        assert_eq!(sum, 100_000);
    }

    #[test]
    #[serial]
    fn test_update_emits_payment_deltas_only() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 50_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create");

        input.status = OrderStatus::Returned;
        input.additional_payment = 100_000;
        update_settled(&db, &created.order_id, &input).expect("first payment");

        input.additional_payment = 150_000;
        update_settled(&db, &created.order_id, &input).expect("second payment");

        let (entries, sum) = ledger_sum(&db, &created.order_id, CATEGORY_SERVICE_INCOME);
        assert_eq!(entries, 2, "one delta entry per commit");
        assert_eq!(sum, 150_000, "deltas add up to the cumulative value");

        let order = get_order(&db, &created.order_id).unwrap().unwrap();
        assert_eq!(order.additional_payment, 150_000);
        assert_eq!(order.payment_status, PaymentStatus::Paid);
    }

    #[test]
    #[serial]
    fn test_additional_payment_ignored_before_return() {
        let db = test_db();
        let mut input = base_input();
        input.additional_payment = 150_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create");

        let order = get_order(&db, &created.order_id).unwrap().unwrap();
        assert_eq!(order.additional_payment, 0);
        assert_eq!(order.payment_status, PaymentStatus::Unpaid);
        let (entries, _) = ledger_sum(&db, &created.order_id, CATEGORY_SERVICE_INCOME);
        assert_eq!(entries, 0);
    }

    #[test]
    #[serial]
    fn test_create_fully_prepaid_deducts_inventory() {
        let db = test_db();
        let mut input = base_input();
        input.deposit_amount = 200_000;
        input.payment_method = Some(PaymentMethod::Bank);

        let outcome = create_settled(&db, &input).expect("create");
        assert!(outcome.inventory_deducted);

        let conn = db.conn.lock().unwrap();
        let stock: i64 = conn
            .query_row("SELECT stock FROM parts WHERE id = 'P-1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stock, 8);
    }

    #[test]
    #[serial]
    fn test_pricing_locked_after_settlement() {
        let db = test_db();
        let mut input = base_input();
        input.additional_services = vec![AdditionalService {
            id: "S-1".into(),
            description: "Chrome plating".into(),
            quantity: 1,
            unit_price: 50_000,
            unit_cost: 30_000,
        }];
        input.status = OrderStatus::Returned;
        input.deposit_amount = 250_000;
        input.payment_method = Some(PaymentMethod::Cash);
        let created = create_settled(&db, &input).expect("create settled order");

        // price edits rejected
        let mut edit = input.clone();
        edit.labor_cost = 120_000;
        assert!(matches!(
            update_settled(&db, &created.order_id, &edit).unwrap_err(),
            SettlementError::Validation(ValidationError::PricingLocked)
        ));

        // cost-only edit allowed, expense entry delta-adjusted in place
        let mut cost_edit = input.clone();
        cost_edit.additional_services[0].unit_cost = 40_000;
        update_settled(&db, &created.order_id, &cost_edit).expect("cost edit allowed");
        let (entries, sum) = ledger_sum(&db, &created.order_id, CATEGORY_OUTSOURCING);
        assert_eq!(entries, 1);
        assert_eq!(sum, -40_000);

        // clearing the cost removes the entry
        let mut clear_edit = input.clone();
        clear_edit.additional_services[0].unit_cost = 0;
        update_settled(&db, &created.order_id, &clear_edit).expect("cost cleared");
        let (entries, _) = ledger_sum(&db, &created.order_id, CATEGORY_OUTSOURCING);
        assert_eq!(entries, 0);
    }

    #[test]
    #[serial]
    fn test_refunded_order_rejects_price_edits() {
        let db = test_db();
        let input = base_input();
        let created = create_settled(&db, &input).expect("create");
        mark_refunded(&db, &created.order_id).expect("mark refunded");

        let mut edit = input.clone();
        edit.labor_cost = 999_000;
        assert!(matches!(
            update_settled(&db, &created.order_id, &edit).unwrap_err(),
            SettlementError::Validation(ValidationError::PricingLocked)
        ));
    }

    #[test]
    #[serial]
    fn test_version_conflict_detection() {
        let db = test_db();
        let input = base_input();
        let created = create_settled(&db, &input).expect("create");

        let mut edit = input.clone();
        edit.expected_row_version = Some(1);
        let outcome = update_settled(&db, &created.order_id, &edit).expect("first update");
        assert_eq!(outcome.row_version, 2);

        // stale expectation loses the race
        let err = update_settled(&db, &created.order_id, &edit).unwrap_err();
        assert!(matches!(
            err,
            SettlementError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));

        // without the token, last write wins
        edit.expected_row_version = None;
        update_settled(&db, &created.order_id, &edit).expect("last-write-wins update");
    }

    #[test]
    #[serial]
    fn test_double_submit_guard() {
        let db = test_db();
        let input = base_input();
        let created = create_settled(&db, &input).expect("create");

        let _held = CommitPermit::acquire(&created.order_id).expect("hold the slot");
        let err = update_settled(&db, &created.order_id, &input).unwrap_err();
        assert!(matches!(err, SettlementError::CommitInFlight(_)));
        drop(_held);

        // slot released -> commit goes through
        update_settled(&db, &created.order_id, &input).expect("after release");
    }

    #[test]
    #[serial]
    fn test_guard_released_on_failure() {
        let db = test_db();
        let input = base_input();
        let created = create_settled(&db, &input).expect("create");

        // a failing commit must not leave the order locked
        let mut bad = input.clone();
        bad.deposit_amount = 999_999_999;
        assert!(update_settled(&db, &created.order_id, &bad).is_err());

        update_settled(&db, &created.order_id, &input).expect("guard was released");
    }

    #[test]
    #[serial]
    fn test_update_missing_order() {
        let db = test_db();
        let err = update_settled(&db, "SC-404", &base_input()).unwrap_err();
        assert!(matches!(err, SettlementError::OrderNotFound(_)));
    }

    #[test]
    #[serial]
    fn test_order_id_prefix_configurable() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            db::set_setting(&conn, "shop", "work_order_prefix", "MS").unwrap();
        }
        let created = create_settled(&db, &base_input()).expect("create");
        assert!(created.order_id.starts_with("MS-"));
    }

    #[test]
    #[serial]
    fn test_create_resolves_customer_placeholder() {
        let db = test_db();
        let created = create_settled(&db, &base_input()).expect("create");

        let order = get_order(&db, &created.order_id).unwrap().unwrap();
        let customer_id = order.customer_id.expect("placeholder attached");

        // a second order for the same phone reuses the customer
        let created2 = create_settled(&db, &base_input()).expect("create again");
        let order2 = get_order(&db, &created2.order_id).unwrap().unwrap();
        assert_eq!(order2.customer_id.as_deref(), Some(customer_id.as_str()));
    }
}
