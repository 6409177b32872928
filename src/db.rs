//! Local SQLite database layer for the Motoshop settlement engine.
//!
//! Uses rusqlite with WAL mode, mirroring the configuration both shells
//! shipped with. Provides schema migrations, settings helpers, and the
//! shared connection state the engine modules operate on. SQLite's
//! row-level atomicity is what lets the orchestrator write an order and its
//! ledger entries as one unit without a compensation layer.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/motoshop.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("motoshop.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: core settlement tables.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- customers (minimal placeholder aggregate; the full customer
        -- graph is owned by the catalog subsystem)
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL UNIQUE,
            vehicle_model TEXT DEFAULT '',
            license_plate TEXT DEFAULT '',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- parts (local stock the deduction gate decrements)
        CREATE TABLE IF NOT EXISTS parts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT DEFAULT '',
            category TEXT DEFAULT '',
            stock INTEGER NOT NULL DEFAULT 0,
            retail_price INTEGER NOT NULL DEFAULT 0,
            cost_price INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- work_orders
        CREATE TABLE IF NOT EXISTS work_orders (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL DEFAULT 'main',
            customer_id TEXT,
            customer_name TEXT NOT NULL,
            customer_phone TEXT NOT NULL,
            vehicle_model TEXT DEFAULT '',
            license_plate TEXT DEFAULT '',
            current_km INTEGER,
            issue_description TEXT DEFAULT '',
            technician_name TEXT DEFAULT '',
            status TEXT NOT NULL DEFAULT 'received',
            labor_cost INTEGER NOT NULL DEFAULT 0,
            discount INTEGER NOT NULL DEFAULT 0,
            parts_used TEXT NOT NULL DEFAULT '[]',
            additional_services TEXT NOT NULL DEFAULT '[]',
            total INTEGER NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'unpaid',
            payment_method TEXT,
            deposit_amount INTEGER NOT NULL DEFAULT 0,
            deposit_transaction_id TEXT,
            additional_payment INTEGER NOT NULL DEFAULT 0,
            payment_transaction_id TEXT,
            total_paid INTEGER NOT NULL DEFAULT 0,
            remaining_amount INTEGER NOT NULL DEFAULT 0,
            inventory_deducted INTEGER NOT NULL DEFAULT 0,
            refunded INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- cash_transactions (income/expense ledger)
        CREATE TABLE IF NOT EXISTS cash_transactions (
            id TEXT PRIMARY KEY,
            tx_type TEXT NOT NULL CHECK (tx_type IN ('income', 'expense')),
            category TEXT NOT NULL,
            amount INTEGER NOT NULL,
            payment_method TEXT,
            reference TEXT,
            description TEXT DEFAULT '',
            branch_id TEXT NOT NULL DEFAULT 'main',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- customer_debts (unpaid remainder after vehicle return)
        CREATE TABLE IF NOT EXISTS customer_debts (
            id TEXT PRIMARY KEY,
            work_order_id TEXT NOT NULL UNIQUE,
            customer_id TEXT,
            customer_name TEXT NOT NULL,
            customer_phone TEXT,
            license_plate TEXT,
            description TEXT DEFAULT '',
            total_amount INTEGER NOT NULL DEFAULT 0,
            paid_amount INTEGER NOT NULL DEFAULT 0,
            remaining_amount INTEGER NOT NULL DEFAULT 0,
            branch_id TEXT NOT NULL DEFAULT 'main',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_work_orders_status ON work_orders(status);
        CREATE INDEX IF NOT EXISTS idx_work_orders_phone ON work_orders(customer_phone);
        CREATE INDEX IF NOT EXISTS idx_work_orders_created_at ON work_orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_cash_tx_reference ON cash_transactions(reference);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: draft recovery cache.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS draft_cache (
            cache_key TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            byte_size INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: optimistic-concurrency counter on orders, and a composite
/// index for expense adjustment lookups.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE work_orders ADD COLUMN row_version INTEGER NOT NULL DEFAULT 1;
        CREATE INDEX IF NOT EXISTS idx_cash_tx_ref_category ON cash_transactions(reference, category);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting value, or `None` if unset.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
