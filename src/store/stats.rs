//! Statistics aggregator
//!
//! On-write daily rollups plus on-demand range aggregation. The functions
//! here operate on a borrowed connection so the write path can recompute a
//! rollup on the same pooled connection, inside the writer's thread, before
//! the save call returns.

use crate::store::error::{EngineError, EngineResult};
use crate::store::types::{DailyStatistics, StatisticsReport};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::HashMap;

/// Modules tracked per daily rollup, keeping only the top contributors
const MODULE_HISTOGRAM_CAP: usize = 20;

/// UTC day boundaries for a calendar date: [midnight, next midnight)
fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    (start, start + Duration::days(1))
}

/// Recompute and upsert the rollup for one calendar date
///
/// Scans every record whose `created_at` falls on `date` and derives
/// totals, per-severity/category histograms, the top-20 module histogram,
/// average resolution time over resolved records carrying a
/// `resolution_time`, and `error_rate_per_hour = total / 24`.
pub fn recompute_day(conn: &Connection, date: NaiveDate) -> EngineResult<DailyStatistics> {
    let (start, end) = day_bounds(date);

    let mut stmt = conn.prepare_cached(
        "SELECT severity, category, module, resolved, resolution_time
         FROM error_records
         WHERE created_at >= ?1 AND created_at < ?2",
    )?;

    let mut stats = DailyStatistics::empty(date);
    let mut by_module: HashMap<String, i64> = HashMap::new();
    let mut resolution_sum = 0.0;
    let mut resolution_count = 0i64;

    let rows = stmt.query_map(params![start, end], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, Option<f64>>(4)?,
        ))
    })?;

    for row in rows {
        let (severity, category, module, resolved, resolution_time) = row?;
        stats.total_errors += 1;
        *stats.errors_by_severity.entry(severity).or_insert(0) += 1;
        *stats.errors_by_category.entry(category).or_insert(0) += 1;
        if let Some(module) = module {
            *by_module.entry(module).or_insert(0) += 1;
        }
        if resolved {
            stats.resolved_errors += 1;
            if let Some(secs) = resolution_time {
                resolution_sum += secs;
                resolution_count += 1;
            }
        } else {
            stats.unresolved_errors += 1;
        }
    }

    stats.errors_by_module = cap_histogram(by_module, MODULE_HISTOGRAM_CAP);
    if resolution_count > 0 {
        stats.avg_resolution_time = resolution_sum / resolution_count as f64;
    }
    stats.error_rate_per_hour = stats.total_errors as f64 / 24.0;

    upsert_day(conn, &stats)?;
    Ok(stats)
}

/// Fetch the cached rollup for a date, computing it on a cache miss
///
/// The computed result is persisted as a side effect.
pub fn day(conn: &Connection, date: NaiveDate) -> EngineResult<DailyStatistics> {
    let cached = conn
        .prepare_cached(
            "SELECT total_errors, errors_by_severity, errors_by_category,
                    errors_by_module, resolved_errors, unresolved_errors,
                    avg_resolution_time, error_rate_per_hour
             FROM daily_statistics WHERE date = ?1",
        )?
        .query_row(params![date], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
            ))
        })
        .optional()?;

    match cached {
        Some((
            total_errors,
            by_severity,
            by_category,
            by_module,
            resolved_errors,
            unresolved_errors,
            avg_resolution_time,
            error_rate_per_hour,
        )) => Ok(DailyStatistics {
            date,
            total_errors,
            errors_by_severity: decode_map(by_severity)?,
            errors_by_category: decode_map(by_category)?,
            errors_by_module: decode_map(by_module)?,
            resolved_errors,
            unresolved_errors,
            avg_resolution_time,
            error_rate_per_hour,
        }),
        None => recompute_day(conn, date),
    }
}

/// Aggregate over a date range with direct SQL aggregates (no scan)
///
/// Both bounds are inclusive. With no bounds at all, the error rate is
/// estimated from the trailing 30 days of raw record counts instead of the
/// range width.
pub fn range(
    conn: &Connection,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> EngineResult<StatisticsReport> {
    let lower = start_date.map(|d| day_bounds(d).0);
    let upper = end_date.map(|d| day_bounds(d).1);

    let mut where_sql = String::new();
    let mut owned: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(lower) = lower {
        where_sql.push_str(" WHERE created_at >= ?1");
        owned.push(Box::new(lower));
    }
    if let Some(upper) = upper {
        where_sql.push_str(if owned.is_empty() {
            " WHERE created_at < ?1"
        } else {
            " AND created_at < ?2"
        });
        owned.push(Box::new(upper));
    }
    let bind: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();

    let (total_errors, resolved_errors): (i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(resolved), 0) FROM error_records{}",
            where_sql
        ),
        bind.as_slice(),
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let avg_resolution_time: f64 = conn.query_row(
        &format!(
            "SELECT COALESCE(AVG(resolution_time), 0) FROM error_records{}{} resolved = 1
                 AND resolution_time IS NOT NULL",
            where_sql,
            if where_sql.is_empty() { " WHERE" } else { " AND" }
        ),
        bind.as_slice(),
        |row| row.get(0),
    )?;

    let errors_by_severity = grouped_counts(conn, "severity", &where_sql, &bind)?;
    let errors_by_category = grouped_counts(conn, "category", &where_sql, &bind)?;
    let errors_by_module = grouped_counts(conn, "module", &where_sql, &bind)?;

    let error_rate_per_hour = match (start_date, end_date) {
        (Some(start), Some(end)) => {
            let days = (end - start).num_days().max(0) + 1;
            total_errors as f64 / (days * 24) as f64
        }
        _ => trailing_rate(conn)?,
    };

    Ok(StatisticsReport {
        start_date,
        end_date,
        total_errors,
        resolved_errors,
        unresolved_errors: total_errors - resolved_errors,
        avg_resolution_time,
        errors_by_severity,
        errors_by_category,
        errors_by_module,
        error_rate_per_hour,
    })
}

/// Delete rollup rows older than `cutoff`; returns pruned row count
pub fn prune_before(conn: &Connection, cutoff: NaiveDate) -> EngineResult<usize> {
    let pruned = conn.execute(
        "DELETE FROM daily_statistics WHERE date < ?1",
        params![cutoff],
    )?;
    Ok(pruned)
}

fn grouped_counts(
    conn: &Connection,
    column: &str,
    where_sql: &str,
    bind: &[&dyn ToSql],
) -> EngineResult<HashMap<String, i64>> {
    // `column` is one of three literal names above, never caller input
    let mut stmt = conn.prepare(&format!(
        "SELECT {col}, COUNT(*) FROM error_records{filter}{and} {col} IS NOT NULL
         GROUP BY {col}",
        col = column,
        filter = where_sql,
        and = if where_sql.is_empty() { " WHERE" } else { " AND" },
    ))?;

    let rows = stmt.query_map(bind, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = HashMap::new();
    for row in rows {
        let (key, count) = row?;
        counts.insert(key, count);
    }
    Ok(counts)
}

/// Hourly error rate over the trailing 30 days of raw records
fn trailing_rate(conn: &Connection) -> EngineResult<f64> {
    let since = Utc::now() - Duration::days(30);
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM error_records WHERE created_at >= ?1",
        params![since],
        |row| row.get(0),
    )?;
    Ok(count as f64 / (30.0 * 24.0))
}

fn upsert_day(conn: &Connection, stats: &DailyStatistics) -> EngineResult<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO daily_statistics
            (date, total_errors, errors_by_severity, errors_by_category,
             errors_by_module, resolved_errors, unresolved_errors,
             avg_resolution_time, error_rate_per_hour, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        stats.date,
        stats.total_errors,
        serde_json::to_string(&stats.errors_by_severity)?,
        serde_json::to_string(&stats.errors_by_category)?,
        serde_json::to_string(&stats.errors_by_module)?,
        stats.resolved_errors,
        stats.unresolved_errors,
        stats.avg_resolution_time,
        stats.error_rate_per_hour,
        Utc::now(),
    ])?;
    Ok(())
}

fn cap_histogram(counts: HashMap<String, i64>, cap: usize) -> HashMap<String, i64> {
    if counts.len() <= cap {
        return counts;
    }
    let mut entries: Vec<(String, i64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(cap);
    entries.into_iter().collect()
}

fn decode_map(raw: Option<String>) -> EngineResult<HashMap<String, i64>> {
    match raw {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(&raw).map_err(|e| EngineError::Serialization(e.to_string()))
        }
        _ => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::initialize(&conn).unwrap();
        conn
    }

    fn insert_raw(
        conn: &Connection,
        error_id: &str,
        severity: &str,
        category: &str,
        module: Option<&str>,
        created_at: DateTime<Utc>,
        resolved: bool,
        resolution_time: Option<f64>,
    ) {
        conn.execute(
            "INSERT INTO error_records
                (error_id, error_type, error_message, severity, category,
                 module, created_at, resolved, resolution_time)
             VALUES (?1, 'TestError', 'boom', ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                error_id,
                severity,
                category,
                module,
                created_at,
                resolved,
                resolution_time
            ],
        )
        .unwrap();
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
    }

    #[test]
    fn test_recompute_day_counts() {
        let conn = test_conn();
        let day = date("2026-03-01");

        insert_raw(&conn, "E1", "LOW", "VALIDATION", Some("ingest"), at(day, 1), false, None);
        insert_raw(&conn, "E2", "LOW", "NETWORK", Some("ingest"), at(day, 5), true, Some(10.0));
        insert_raw(&conn, "E3", "HIGH", "NETWORK", Some("sync"), at(day, 9), true, Some(30.0));
        // Next day, must not be counted
        insert_raw(&conn, "E4", "LOW", "NETWORK", None, at(day + Duration::days(1), 0), false, None);

        let stats = recompute_day(&conn, day).unwrap();

        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.resolved_errors, 2);
        assert_eq!(stats.unresolved_errors, 1);
        assert_eq!(stats.errors_by_severity.get("LOW"), Some(&2));
        assert_eq!(stats.errors_by_severity.get("HIGH"), Some(&1));
        assert_eq!(stats.errors_by_category.get("NETWORK"), Some(&2));
        assert_eq!(stats.errors_by_module.get("ingest"), Some(&2));
        assert!((stats.avg_resolution_time - 20.0).abs() < 1e-9);
        assert!((stats.error_rate_per_hour - 3.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_sum_invariants() {
        let conn = test_conn();
        let day = date("2026-03-02");

        for i in 0..7 {
            let severity = if i % 2 == 0 { "MEDIUM" } else { "CRITICAL" };
            insert_raw(
                &conn,
                &format!("E{}", i),
                severity,
                "SYSTEM",
                Some("core"),
                at(day, i),
                i % 3 == 0,
                None,
            );
        }

        let stats = recompute_day(&conn, day).unwrap();
        assert_eq!(
            stats.errors_by_severity.values().sum::<i64>(),
            stats.total_errors
        );
        assert_eq!(
            stats.resolved_errors + stats.unresolved_errors,
            stats.total_errors
        );
    }

    #[test]
    fn test_module_histogram_cap() {
        let conn = test_conn();
        let day = date("2026-03-03");

        for i in 0..25 {
            insert_raw(
                &conn,
                &format!("E{}", i),
                "LOW",
                "SYSTEM",
                Some(&format!("module_{:02}", i)),
                at(day, 0),
                false,
                None,
            );
        }
        // A clear top contributor
        for i in 0..5 {
            insert_raw(
                &conn,
                &format!("T{}", i),
                "LOW",
                "SYSTEM",
                Some("hot_module"),
                at(day, 1),
                false,
                None,
            );
        }

        let stats = recompute_day(&conn, day).unwrap();
        assert_eq!(stats.errors_by_module.len(), MODULE_HISTOGRAM_CAP);
        assert_eq!(stats.errors_by_module.get("hot_module"), Some(&5));
        assert_eq!(stats.total_errors, 30);
    }

    #[test]
    fn test_day_cache_miss_computes_and_persists() {
        let conn = test_conn();
        let d = date("2026-03-04");
        insert_raw(&conn, "E1", "LOW", "UNKNOWN", None, at(d, 3), false, None);

        // No cached row yet
        let cached: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_statistics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(cached, 0);

        let stats = day(&conn, d).unwrap();
        assert_eq!(stats.total_errors, 1);

        // Side effect: row persisted, second call hits the cache
        let cached: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_statistics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(cached, 1);
        assert_eq!(day(&conn, d).unwrap(), stats);
    }

    #[test]
    fn test_range_aggregation() {
        let conn = test_conn();
        let d1 = date("2026-04-01");
        let d2 = date("2026-04-02");

        insert_raw(&conn, "E1", "LOW", "VALIDATION", Some("a"), at(d1, 1), true, Some(5.0));
        insert_raw(&conn, "E2", "HIGH", "NETWORK", Some("a"), at(d1, 2), false, None);
        insert_raw(&conn, "E3", "LOW", "NETWORK", Some("b"), at(d2, 3), true, Some(15.0));
        // Outside the range
        insert_raw(&conn, "E4", "LOW", "NETWORK", None, at(date("2026-04-05"), 0), false, None);

        let report = range(&conn, Some(d1), Some(d2)).unwrap();

        assert_eq!(report.total_errors, 3);
        assert_eq!(report.resolved_errors, 2);
        assert_eq!(report.unresolved_errors, 1);
        assert_eq!(report.errors_by_severity.get("LOW"), Some(&2));
        assert_eq!(report.errors_by_module.get("a"), Some(&2));
        assert!((report.avg_resolution_time - 10.0).abs() < 1e-9);
        // Two inclusive days
        assert!((report.error_rate_per_hour - 3.0 / 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_unbounded_range_uses_trailing_rate() {
        let conn = test_conn();
        let now = Utc::now();
        insert_raw(&conn, "E1", "LOW", "SYSTEM", None, now, false, None);
        // Old record outside the trailing window
        insert_raw(&conn, "E2", "LOW", "SYSTEM", None, now - Duration::days(90), false, None);

        let report = range(&conn, None, None).unwrap();
        assert_eq!(report.total_errors, 2);
        assert!((report.error_rate_per_hour - 1.0 / 720.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_before() {
        let conn = test_conn();
        let old = date("2026-01-01");
        let recent = date("2026-06-01");

        insert_raw(&conn, "E1", "LOW", "SYSTEM", None, at(old, 0), false, None);
        insert_raw(&conn, "E2", "LOW", "SYSTEM", None, at(recent, 0), false, None);
        recompute_day(&conn, old).unwrap();
        recompute_day(&conn, recent).unwrap();

        let pruned = prune_before(&conn, date("2026-02-01")).unwrap();
        assert_eq!(pruned, 1);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_statistics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
