//! Record store
//!
//! CRUD over `error_records` plus dynamic filtered/paginated queries and
//! the retention delete. Every successful mutation recomputes the affected
//! date's rollup on the same pooled connection; a rollup failure after a
//! committed write is logged and swallowed, never surfaced to the caller.

use crate::store::error::{EngineError, EngineResult};
use crate::store::pool::ConnectionPool;
use crate::store::stats;
use crate::store::types::{ErrorCategory, ErrorRecord, QueryFilter, Severity};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// CRUD and query surface over persisted error records
#[derive(Clone)]
pub struct RecordStore {
    pool: Arc<ConnectionPool>,
}

impl RecordStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Upsert a record by its `error_id`
    ///
    /// A second save with the same `error_id` replaces the prior row.
    /// `created_at` is stamped at first persistence when absent; the
    /// writing thread and update time are recorded in the row metadata.
    /// Returns the store-assigned row id.
    pub fn save(&self, record: &ErrorRecord) -> EngineResult<i64> {
        let conn = self.pool.acquire()?;
        let now = Utc::now();
        let created_at = record.created_at.unwrap_or(now);

        let mut metadata = record.metadata.clone();
        metadata.insert(
            "writer_thread".to_string(),
            serde_json::Value::String(format!("{:?}", std::thread::current().id())),
        );

        conn.prepare_cached(
            "INSERT OR REPLACE INTO error_records
                (error_id, error_type, error_message, severity, category,
                 module, function, line_number, stack_trace,
                 context, user_context, system_context,
                 created_at, resolved, resolved_at, resolution_method,
                 resolution_time, retry_count, max_retries, tags, metadata,
                 updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
        )?
        .execute(params![
            record.error_id,
            record.error_type,
            record.error_message,
            record.severity.as_str(),
            record.category.as_str(),
            record.module,
            record.function,
            record.line_number,
            record.stack_trace,
            serde_json::to_string(&record.context)?,
            serde_json::to_string(&record.user_context)?,
            serde_json::to_string(&record.system_context)?,
            created_at,
            record.resolved,
            record.resolved_at,
            record.resolution_method,
            record.resolution_time,
            record.retry_count,
            record.max_retries,
            serde_json::to_string(&record.tags)?,
            serde_json::to_string(&metadata)?,
            now,
        ])?;
        let id = conn.last_insert_rowid();

        // The write has committed; a rollup failure must not undo that.
        self.refresh_rollup(&conn, created_at.date_naive());
        Ok(id)
    }

    /// Fetch one record by `error_id`
    pub fn get(&self, error_id: &str) -> EngineResult<Option<ErrorRecord>> {
        let conn = self.pool.acquire()?;
        let raw = conn
            .prepare_cached(&format!(
                "SELECT {} FROM error_records WHERE error_id = ?1",
                SELECT_COLUMNS
            ))?
            .query_row(params![error_id], RawRecord::from_row)
            .optional()?;

        raw.map(RawRecord::into_record).transpose()
    }

    /// Update an existing record, matched by `id` when present, else
    /// `error_id`; returns false when no row matched
    pub fn update(&self, record: &ErrorRecord) -> EngineResult<bool> {
        let conn = self.pool.acquire()?;
        let now = Utc::now();

        let (where_sql, key): (&str, Box<dyn ToSql>) = match record.id {
            Some(id) => ("id = ?20", Box::new(id)),
            None => ("error_id = ?20", Box::new(record.error_id.clone())),
        };

        let changed = conn
            .prepare_cached(&format!(
                "UPDATE error_records SET
                    error_type = ?1, error_message = ?2, severity = ?3,
                    category = ?4, module = ?5, function = ?6,
                    line_number = ?7, stack_trace = ?8, context = ?9,
                    user_context = ?10, system_context = ?11,
                    created_at = COALESCE(?12, created_at), resolved = ?13,
                    resolved_at = ?14, resolution_method = ?15,
                    resolution_time = ?16, retry_count = ?17,
                    max_retries = ?18, updated_at = ?19
                 WHERE {}",
                where_sql
            ))?
            .execute(params![
                record.error_type,
                record.error_message,
                record.severity.as_str(),
                record.category.as_str(),
                record.module,
                record.function,
                record.line_number,
                record.stack_trace,
                serde_json::to_string(&record.context)?,
                serde_json::to_string(&record.user_context)?,
                serde_json::to_string(&record.system_context)?,
                record.created_at,
                record.resolved,
                record.resolved_at,
                record.resolution_method,
                record.resolution_time,
                record.retry_count,
                record.max_retries,
                now,
                key,
            ])?;

        if changed == 0 {
            return Ok(false);
        }

        if let Some(date) = self.row_date(&conn, &record.error_id, record.id)? {
            self.refresh_rollup(&conn, date);
        }
        Ok(true)
    }

    /// Delete one record by `error_id`; returns false when absent
    pub fn delete(&self, error_id: &str) -> EngineResult<bool> {
        let conn = self.pool.acquire()?;
        let date = self.row_date(&conn, error_id, None)?;

        let deleted = conn.execute(
            "DELETE FROM error_records WHERE error_id = ?1",
            params![error_id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }

        if let Some(date) = date {
            self.refresh_rollup(&conn, date);
        }
        Ok(true)
    }

    /// Query records matching a filter, most recent first
    ///
    /// Filters compose with AND; every value is bound as a parameter.
    pub fn query(&self, filter: &QueryFilter) -> EngineResult<Vec<ErrorRecord>> {
        let conn = self.pool.acquire()?;
        let (sql, owned) = compile_query(filter);
        let bind: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bind.as_slice(), RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Delete all records older than `now - days`, pruning statistics rows
    /// past the same cutoff; returns the deleted record count
    pub fn cleanup_older_than(&self, days: u32) -> EngineResult<usize> {
        let conn = self.pool.acquire()?;
        let cutoff = Utc::now() - Duration::days(i64::from(days));

        let deleted = conn.execute(
            "DELETE FROM error_records WHERE created_at < ?1",
            params![cutoff],
        )?;
        let pruned = stats::prune_before(&conn, cutoff.date_naive())?;

        if deleted > 0 || pruned > 0 {
            tracing::info!(deleted, pruned, %cutoff, "retention cleanup removed old rows");
        }
        Ok(deleted)
    }

    /// Row counts for the records and statistics tables
    pub fn counts(&self) -> EngineResult<(u64, u64)> {
        let conn = self.pool.acquire()?;
        let records: i64 =
            conn.query_row("SELECT COUNT(*) FROM error_records", [], |row| row.get(0))?;
        let stats_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM daily_statistics", [], |row| {
                row.get(0)
            })?;
        Ok((records as u64, stats_rows as u64))
    }

    fn refresh_rollup(&self, conn: &Connection, date: NaiveDate) {
        if let Err(e) = stats::recompute_day(conn, date) {
            tracing::warn!(%date, error = %e, "daily rollup recompute failed after write");
        }
    }

    fn row_date(
        &self,
        conn: &Connection,
        error_id: &str,
        id: Option<i64>,
    ) -> EngineResult<Option<NaiveDate>> {
        let created_at: Option<DateTime<Utc>> = match id {
            Some(id) => conn
                .query_row(
                    "SELECT created_at FROM error_records WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT created_at FROM error_records WHERE error_id = ?1",
                    params![error_id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(created_at.map(|at| at.date_naive()))
    }
}

const SELECT_COLUMNS: &str = "id, error_id, error_type, error_message, severity, category, \
     module, function, line_number, stack_trace, context, user_context, \
     system_context, created_at, resolved, resolved_at, resolution_method, \
     resolution_time, retry_count, max_retries, tags, metadata";

/// Compile a filter into parameterized SQL; returns (sql, owned params)
fn compile_query(filter: &QueryFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut owned: Vec<Box<dyn ToSql>> = Vec::new();

    if !filter.severities.is_empty() {
        let marks = vec!["?"; filter.severities.len()].join(", ");
        clauses.push(format!("severity IN ({})", marks));
        for severity in &filter.severities {
            owned.push(Box::new(severity.as_str()));
        }
    }
    if !filter.categories.is_empty() {
        let marks = vec!["?"; filter.categories.len()].join(", ");
        clauses.push(format!("category IN ({})", marks));
        for category in &filter.categories {
            owned.push(Box::new(category.as_str()));
        }
    }
    if let Some(module) = &filter.module {
        clauses.push("module = ?".to_string());
        owned.push(Box::new(module.clone()));
    }
    if let Some(resolved) = filter.resolved {
        clauses.push("resolved = ?".to_string());
        owned.push(Box::new(resolved));
    }
    if let Some(from) = filter.from {
        clauses.push("created_at >= ?".to_string());
        owned.push(Box::new(from));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at <= ?".to_string());
        owned.push(Box::new(until));
    }
    if let Some(needle) = &filter.error_type_contains {
        clauses.push("error_type LIKE '%' || ? || '%'".to_string());
        owned.push(Box::new(needle.clone()));
    }
    if let Some(needle) = &filter.message_contains {
        clauses.push("error_message LIKE '%' || ? || '%'".to_string());
        owned.push(Box::new(needle.clone()));
    }

    let mut sql = format!("SELECT {} FROM error_records", SELECT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC");

    if filter.limit.is_some() || filter.offset.is_some() {
        // SQLite requires LIMIT before OFFSET; -1 means unlimited
        sql.push_str(" LIMIT ?");
        owned.push(Box::new(
            filter.limit.map(i64::from).unwrap_or(-1),
        ));
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ?");
            owned.push(Box::new(i64::from(offset)));
        }
    }

    (sql, owned)
}

/// Raw row image with JSON columns still encoded
struct RawRecord {
    id: i64,
    error_id: String,
    error_type: String,
    error_message: String,
    severity: String,
    category: String,
    module: Option<String>,
    function: Option<String>,
    line_number: Option<i64>,
    stack_trace: Option<String>,
    context: Option<String>,
    user_context: Option<String>,
    system_context: Option<String>,
    created_at: DateTime<Utc>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    resolution_method: Option<String>,
    resolution_time: Option<f64>,
    retry_count: i64,
    max_retries: i64,
    tags: Option<String>,
    metadata: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            error_id: row.get(1)?,
            error_type: row.get(2)?,
            error_message: row.get(3)?,
            severity: row.get(4)?,
            category: row.get(5)?,
            module: row.get(6)?,
            function: row.get(7)?,
            line_number: row.get(8)?,
            stack_trace: row.get(9)?,
            context: row.get(10)?,
            user_context: row.get(11)?,
            system_context: row.get(12)?,
            created_at: row.get(13)?,
            resolved: row.get(14)?,
            resolved_at: row.get(15)?,
            resolution_method: row.get(16)?,
            resolution_time: row.get(17)?,
            retry_count: row.get(18)?,
            max_retries: row.get(19)?,
            tags: row.get(20)?,
            metadata: row.get(21)?,
        })
    }

    fn into_record(self) -> EngineResult<ErrorRecord> {
        let severity = Severity::from_str(&self.severity)
            .map_err(EngineError::Serialization)?;

        Ok(ErrorRecord {
            id: Some(self.id),
            error_id: self.error_id,
            error_type: self.error_type,
            error_message: self.error_message,
            severity,
            category: ErrorCategory::parse_lossy(&self.category),
            module: self.module,
            function: self.function,
            line_number: self.line_number,
            stack_trace: self.stack_trace,
            context: decode_json(self.context)?,
            user_context: decode_json(self.user_context)?,
            system_context: decode_json(self.system_context)?,
            created_at: Some(self.created_at),
            resolved: self.resolved,
            resolved_at: self.resolved_at,
            resolution_method: self.resolution_method,
            resolution_time: self.resolution_time,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            tags: decode_json(self.tags)?,
            metadata: decode_json(self.metadata)?,
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned + Default>(
    raw: Option<String>,
) -> EngineResult<T> {
    match raw {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(&raw).map_err(|e| EngineError::Serialization(e.to_string()))
        }
        _ => Ok(T::default()),
    }
}
