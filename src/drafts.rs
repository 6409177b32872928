//! Draft recovery store: versioned, TTL-bound snapshots of in-progress
//! order edits, keyed per branch/user/order/surface.
//!
//! A draft exists to survive interruptions *before* the orchestrator
//! commits — it is cleared only after a confirmed commit, so a failed save
//! never loses the operator's work. Loading is deliberately paranoid:
//! version mismatch, expiry, or a corrupt payload silently discards the
//! record, and restoration is field-by-field with each field individually
//! type-checked so a half-corrupt payload restores the valid subset.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::status::OrderStatus;
use crate::totals::{DiscountMode, DiscountInput};
use crate::types::{AdditionalService, PartUsage, PaymentMethod, WorkOrderInput};

/// Bump when the draft payload shape changes; older drafts are discarded.
pub const DRAFT_VERSION: i64 = 1;

/// Drafts older than this are expired on load.
pub const DRAFT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Writes larger than this are dropped (quota guard for the backing store).
const MAX_DRAFT_BYTES: usize = 256 * 1024;

/// Debounce window for autosave.
const AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Which editing surface owns the draft. Desktop and mobile edit
/// independently and must not clobber each other's recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftSurface {
    Desktop,
    Mobile,
}

impl DraftSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftSurface::Desktop => "desktop",
            DraftSurface::Mobile => "mobile",
        }
    }
}

/// The order slot a draft belongs to: an existing order or a not-yet-created
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftOrderRef {
    New,
    Existing(String),
}

impl DraftOrderRef {
    fn as_key_part(&self) -> &str {
        match self {
            DraftOrderRef::New => "new",
            DraftOrderRef::Existing(id) => id.as_str(),
        }
    }
}

/// Structured draft key. Canonicalized into a single cache string, but
/// callers construct it from typed parts — never by ad-hoc concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftKey {
    pub branch_id: String,
    pub user_id: String,
    pub order: DraftOrderRef,
    pub surface: DraftSurface,
}

impl DraftKey {
    pub fn cache_key(&self) -> String {
        format!(
            "workorder_draft_v{DRAFT_VERSION}:{}:{}:{}:{}",
            self.branch_id,
            self.user_id,
            self.order.as_key_part(),
            self.surface.as_str()
        )
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The restorable field set. Every field is optional: only fields the
/// surface declared restorable are stored, and only fields that survive the
/// per-field type check are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_km: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technician_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labor_cost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_mode: Option<DiscountMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts_used: Option<Vec<PartUsage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_services: Option<Vec<AdditionalService>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_payment: Option<i64>,
}

impl DraftPayload {
    /// Restore stored fields onto a fresh input. Absent fields leave the
    /// input untouched.
    pub fn apply_to(&self, input: &mut WorkOrderInput) {
        if let Some(v) = &self.customer_name {
            input.customer_name = v.clone();
        }
        if let Some(v) = &self.customer_phone {
            input.customer_phone = v.clone();
        }
        if let Some(v) = &self.vehicle_model {
            input.vehicle_model = v.clone();
        }
        if let Some(v) = &self.license_plate {
            input.license_plate = v.clone();
        }
        if let Some(v) = self.current_km {
            input.current_km = Some(v);
        }
        if let Some(v) = &self.issue_description {
            input.issue_description = v.clone();
        }
        if let Some(v) = &self.technician_name {
            input.technician_name = v.clone();
        }
        if let Some(v) = self.status {
            input.status = v;
        }
        if let Some(v) = self.labor_cost {
            input.labor_cost = v;
        }
        if let Some(mode) = self.discount_mode {
            input.discount = DiscountInput {
                mode,
                value: self.discount_value.unwrap_or(input.discount.value),
            };
        } else if let Some(value) = self.discount_value {
            input.discount.value = value;
        }
        if let Some(v) = &self.parts_used {
            input.parts_used = v.clone();
        }
        if let Some(v) = &self.additional_services {
            input.additional_services = v.clone();
        }
        if let Some(v) = self.payment_method {
            input.payment_method = Some(v);
        }
        if let Some(v) = self.deposit_amount {
            input.deposit_amount = v;
        }
        if let Some(v) = self.additional_payment {
            input.additional_payment = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Persist a draft immediately. Oversize payloads and storage failures are
/// swallowed with a warning — losing a draft must never break editing.
pub fn save_draft(db: &DbState, key: &DraftKey, payload: &DraftPayload) {
    let json = match serde_json::to_string(payload) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "draft serialize failed, skipping save");
            return;
        }
    };
    if json.len() > MAX_DRAFT_BYTES {
        warn!(bytes = json.len(), "draft exceeds size cap, skipping save");
        return;
    }

    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "draft store lock poisoned, skipping save");
            return;
        }
    };
    let now_ms = Utc::now().timestamp_millis();
    if let Err(e) = conn.execute(
        "INSERT INTO draft_cache (cache_key, version, payload, byte_size, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(cache_key) DO UPDATE SET
            version = excluded.version,
            payload = excluded.payload,
            byte_size = excluded.byte_size,
            updated_at_ms = excluded.updated_at_ms",
        params![key.cache_key(), DRAFT_VERSION, json, json.len() as i64, now_ms],
    ) {
        warn!(error = %e, "draft save failed");
    }
}

/// Load a draft, or `None` (deleting the record) when it is expired,
/// version-mismatched, or unparseable.
pub fn load_draft(db: &DbState, key: &DraftKey) -> Option<DraftPayload> {
    load_draft_at(db, key, Utc::now().timestamp_millis())
}

/// TTL check against an explicit clock, for tests.
fn load_draft_at(db: &DbState, key: &DraftKey, now_ms: i64) -> Option<DraftPayload> {
    let cache_key = key.cache_key();
    let conn = db.conn.lock().ok()?;

    let row: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT version, payload, updated_at_ms FROM draft_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .ok()?;

    let (version, payload, updated_at_ms) = row?;

    if version != DRAFT_VERSION || now_ms - updated_at_ms > DRAFT_TTL_MS {
        debug!(%cache_key, version, "discarding stale or version-mismatched draft");
        let _ = conn.execute(
            "DELETE FROM draft_cache WHERE cache_key = ?1",
            params![cache_key],
        );
        return None;
    }

    let map = match serde_json::from_str::<Value>(&payload) {
        Ok(Value::Object(map)) => map,
        _ => {
            debug!(%cache_key, "discarding unparseable draft payload");
            let _ = conn.execute(
                "DELETE FROM draft_cache WHERE cache_key = ?1",
                params![cache_key],
            );
            return None;
        }
    };

    // Field-by-field restore: each field is type-checked independently so
    // one corrupt value does not poison the rest.
    Some(DraftPayload {
        customer_name: field(&map, "customerName"),
        customer_phone: field(&map, "customerPhone"),
        vehicle_model: field(&map, "vehicleModel"),
        license_plate: field(&map, "licensePlate"),
        current_km: field(&map, "currentKm"),
        issue_description: field(&map, "issueDescription"),
        technician_name: field(&map, "technicianName"),
        status: field(&map, "status"),
        labor_cost: field(&map, "laborCost"),
        discount_mode: field(&map, "discountMode"),
        discount_value: field(&map, "discountValue"),
        parts_used: field(&map, "partsUsed"),
        additional_services: field(&map, "additionalServices"),
        payment_method: field(&map, "paymentMethod"),
        deposit_amount: field(&map, "depositAmount"),
        additional_payment: field(&map, "additionalPayment"),
    })
}

/// Remove a draft. Called only after the orchestrator confirms a commit.
pub fn clear_draft(db: &DbState, key: &DraftKey) {
    if let Ok(conn) = db.conn.lock() {
        let _ = conn.execute(
            "DELETE FROM draft_cache WHERE cache_key = ?1",
            params![key.cache_key()],
        );
    }
}

fn field<T: DeserializeOwned>(map: &serde_json::Map<String, Value>, key: &str) -> Option<T> {
    map.get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

// ---------------------------------------------------------------------------
// Debounced autosave
// ---------------------------------------------------------------------------

/// Debounces draft writes so rapid-fire edits do not thrash the store. Each
/// `schedule` cancels the previously pending write; only the last one
/// survives the debounce window.
pub struct DraftAutosaver {
    db: Arc<DbState>,
    pending: Mutex<Option<CancellationToken>>,
}

impl DraftAutosaver {
    pub fn new(db: Arc<DbState>) -> Self {
        DraftAutosaver {
            db,
            pending: Mutex::new(None),
        }
    }

    /// Schedule a write for ~500 ms from now, replacing any pending one.
    pub fn schedule(&self, key: DraftKey, payload: DraftPayload) {
        let token = CancellationToken::new();
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(prev) = pending.replace(token.clone()) {
                prev.cancel();
            }
        }

        let db = Arc::clone(&self.db);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(AUTOSAVE_DEBOUNCE) => {
                    save_draft(&db, &key, &payload);
                }
            }
        });
    }

    /// Cancel any pending write and delete the stored draft. Called after a
    /// confirmed commit so a trailing debounce cannot resurrect the draft.
    pub fn clear(&self, key: &DraftKey) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(prev) = pending.take() {
                prev.cancel();
            }
        }
        clear_draft(&self.db, key);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
