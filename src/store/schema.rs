//! Schema manager
//!
//! Creates the three tables (error records, daily statistics, and the
//! generic key/value system-config table) plus their supporting indexes.
//! All DDL is `IF NOT EXISTS`-guarded so running it against an existing
//! database file is a no-op. Called once at engine construction; failure
//! here is fatal and propagates.

use crate::store::error::EngineResult;
use rusqlite::Connection;

/// Create tables and indexes if they do not already exist
pub fn initialize(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS error_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            error_id TEXT NOT NULL UNIQUE,
            error_type TEXT NOT NULL,
            error_message TEXT NOT NULL,
            severity TEXT NOT NULL,
            category TEXT NOT NULL,
            module TEXT,
            function TEXT,
            line_number INTEGER,
            stack_trace TEXT,
            context TEXT,
            user_context TEXT,
            system_context TEXT,
            created_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at TEXT,
            resolution_method TEXT,
            resolution_time REAL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            tags TEXT,
            metadata TEXT,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS daily_statistics (
            date TEXT PRIMARY KEY,
            total_errors INTEGER NOT NULL DEFAULT 0,
            errors_by_severity TEXT,
            errors_by_category TEXT,
            errors_by_module TEXT,
            resolved_errors INTEGER NOT NULL DEFAULT 0,
            unresolved_errors INTEGER NOT NULL DEFAULT 0,
            avg_resolution_time REAL NOT NULL DEFAULT 0,
            error_rate_per_hour REAL NOT NULL DEFAULT 0,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS system_config (
            config_key TEXT PRIMARY KEY,
            config_value TEXT,
            config_type TEXT,
            description TEXT,
            updated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_error_records_created_at
            ON error_records(created_at);
        CREATE INDEX IF NOT EXISTS idx_error_records_severity
            ON error_records(severity);
        CREATE INDEX IF NOT EXISTS idx_error_records_category
            ON error_records(category);
        CREATE INDEX IF NOT EXISTS idx_error_records_module
            ON error_records(module);
        CREATE INDEX IF NOT EXISTS idx_error_records_resolved
            ON error_records(resolved);
        CREATE INDEX IF NOT EXISTS idx_daily_statistics_date
            ON daily_statistics(date);
        ",
    )?;

    Ok(())
}
