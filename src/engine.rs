//! Engine facade
//!
//! `ErrorHistoryEngine` wires the pool, schema, record store, statistics,
//! retention scheduler and config watcher together behind one handle. The
//! public boundary follows a log-and-continue policy: operational failures
//! are logged through `tracing` and collapse into neutral return values
//! (`false`, `None`, empty vec, `0`), so an embedding application never
//! has to unwind because its error sink hiccupped. Callers that want the
//! underlying `Result`s can use [`crate::store::RecordStore`] directly.

use crate::config::{self, ConfigLoader, ConfigSource, EngineConfig};
use crate::scheduler::{RetentionScheduler, SchedulerStatus};
use crate::store::{
    schema, stats, ConnectionPool, DailyStatistics, EngineResult, ErrorRecord, PoolStats,
    QueryFilter, RecordStore, StatisticsReport,
};
use crate::watcher::{ConfigWatcher, WatchStrategy};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Construction-time wiring for [`ErrorHistoryEngine`]
///
/// Everything is injected here; the engine reads no globals and probes no
/// well-known paths on its own.
pub struct EngineOptions {
    /// Ordered configuration sources, first non-empty wins
    pub sources: Vec<ConfigSource>,
    /// Watcher poll interval for file-based sources
    pub poll_interval: Duration,
    /// `None` disables the hot-reload watcher entirely
    pub watch: Option<WatchStrategy>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            poll_interval: Duration::from_secs(30),
            watch: Some(WatchStrategy::PollAndEvents),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn watch(mut self, watch: Option<WatchStrategy>) -> Self {
        self.watch = watch;
        self
    }
}

/// Snapshot of the database file and pool for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub record_count: u64,
    pub statistics_rows: u64,
    pub pool: PoolStats,
}

/// Error-history persistence engine
pub struct ErrorHistoryEngine {
    config: Arc<RwLock<EngineConfig>>,
    pool: Arc<ConnectionPool>,
    store: RecordStore,
    scheduler: Arc<RetentionScheduler>,
    watcher: Mutex<Option<ConfigWatcher>>,
    shut_down: AtomicBool,
}

impl ErrorHistoryEngine {
    /// Resolve config, open the store, start background services
    ///
    /// Schema initialization failure is the one fatal path; everything
    /// after construction degrades instead of failing.
    pub fn new(options: EngineOptions) -> EngineResult<Self> {
        let loader = Arc::new(ConfigLoader::new(options.sources));
        let config = loader.resolve();
        tracing::info!(
            path = %config.database_path.display(),
            max_connections = config.max_connections,
            "starting error-history engine"
        );

        let pool = Arc::new(ConnectionPool::open(
            &config.database_path,
            config.max_connections,
            config.busy_timeout(),
        )?);
        {
            let conn = pool.acquire()?;
            schema::initialize(&conn)?;
        }
        loader.attach_store(pool.clone());

        let store = RecordStore::new(pool.clone());
        let scheduler = Arc::new(RetentionScheduler::new(store.clone(), &config));
        scheduler.start();

        let config = Arc::new(RwLock::new(config));

        let watcher = options.watch.map(|strategy| {
            let pool = pool.clone();
            let scheduler = scheduler.clone();
            let active = config.clone();
            ConfigWatcher::spawn(loader, options.poll_interval, strategy, move |fresh| {
                pool.set_max_connections(fresh.max_connections);
                scheduler.restart(&fresh);
                let mut active = active.write().unwrap_or_else(|e| e.into_inner());
                *active = fresh;
            })
        });

        Ok(Self {
            config,
            pool,
            store,
            scheduler,
            watcher: Mutex::new(watcher),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Currently active configuration
    pub fn config(&self) -> EngineConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn enabled(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
            && self.config.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    /// Persist one record; `false` means the write was dropped (and logged)
    pub fn save_error(&self, record: &ErrorRecord) -> bool {
        if !self.enabled() {
            tracing::debug!(error_id = %record.error_id, "engine disabled, record dropped");
            return false;
        }
        match self.store.save(record) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error_id = %record.error_id, error = %e, "failed to save record");
                false
            }
        }
    }

    pub fn get_error(&self, error_id: &str) -> Option<ErrorRecord> {
        match self.store.get(error_id) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error_id, error = %e, "failed to load record");
                None
            }
        }
    }

    /// Overwrite an existing record; `false` when missing or on failure
    pub fn update_error(&self, record: &ErrorRecord) -> bool {
        if !self.enabled() {
            return false;
        }
        match self.store.update(record) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(error_id = %record.error_id, error = %e, "failed to update record");
                false
            }
        }
    }

    pub fn delete_error(&self, error_id: &str) -> bool {
        match self.store.delete(error_id) {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(error_id, error = %e, "failed to delete record");
                false
            }
        }
    }

    /// Filtered query; failures log and return an empty list
    pub fn query_errors(&self, filter: &QueryFilter) -> Vec<ErrorRecord> {
        match self.store.query(filter) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "record query failed");
                Vec::new()
            }
        }
    }

    /// Aggregate statistics over an inclusive date range
    pub fn get_statistics(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Option<StatisticsReport> {
        let result = self
            .pool
            .acquire()
            .and_then(|conn| stats::range(&conn, start_date, end_date));
        match result {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "statistics aggregation failed");
                None
            }
        }
    }

    /// Cached daily rollup, recomputed on a cache miss
    pub fn get_daily_statistics(&self, date: NaiveDate) -> Option<DailyStatistics> {
        let result = self
            .pool
            .acquire()
            .and_then(|conn| stats::day(&conn, date));
        match result {
            Ok(day) => Some(day),
            Err(e) => {
                tracing::error!(%date, error = %e, "daily statistics lookup failed");
                None
            }
        }
    }

    /// Delete records older than `days`; returns how many were removed
    pub fn cleanup_older_than(&self, days: u32) -> usize {
        match self.store.cleanup_older_than(days) {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(days, error = %e, "cleanup failed");
                0
            }
        }
    }

    /// Run one retention pass immediately, independent of the schedule
    pub fn trigger_cleanup_now(&self) -> usize {
        match self.scheduler.trigger_now() {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(error = %e, "manual cleanup pass failed");
                0
            }
        }
    }

    /// Stop and restart the retention scheduler with the active config
    pub fn restart_scheduler(&self) {
        let config = self.config();
        self.scheduler.restart(&config);
    }

    pub fn get_cleanup_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Diagnostics: file size, row counts, pool occupancy
    pub fn get_database_info(&self) -> DatabaseInfo {
        let path = self.pool.path().to_path_buf();
        let file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let (record_count, statistics_rows) = self.store.counts().unwrap_or_else(|e| {
            tracing::error!(error = %e, "row count query failed");
            (0, 0)
        });
        DatabaseInfo {
            path,
            file_size_bytes,
            record_count,
            statistics_rows,
            pool: self.pool.stats(),
        }
    }

    /// Persist a new configuration and apply its runtime parameters
    pub fn save_config(&self, new_config: &EngineConfig) -> bool {
        let new_config = new_config.clone().sanitize();
        if let Err(e) = config::save_to_store(&self.pool, &new_config) {
            tracing::error!(error = %e, "failed to persist configuration");
            return false;
        }
        self.pool.set_max_connections(new_config.max_connections);
        self.scheduler.restart(&new_config);
        {
            let mut active = self.config.write().unwrap_or_else(|e| e.into_inner());
            *active = new_config;
        }
        true
    }

    /// Stop background services and release pooled connections; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down error-history engine");
        {
            let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(watcher) = watcher.take() {
                watcher.stop();
            }
        }
        self.scheduler.stop();
        self.pool.drain();
    }
}

impl Drop for ErrorHistoryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ErrorCategory, Severity};
    use tempfile::tempdir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn engine_at(dir: &std::path::Path) -> (ErrorHistoryEngine, PathBuf) {
        init_tracing();
        let config_path = dir.join("config.json");
        let db_path = dir.join("errors.db");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"error_history": {{"database_path": {:?}, "auto_cleanup": false}}}}"#,
                db_path
            ),
        )
        .unwrap();

        let engine = ErrorHistoryEngine::new(
            EngineOptions::new()
                .source(ConfigSource::NestedFile(config_path.clone()))
                .source(ConfigSource::SystemTable)
                .poll_interval(Duration::from_millis(50))
                .watch(None),
        )
        .unwrap();
        (engine, config_path)
    }

    #[test]
    fn test_end_to_end_scenario() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());

        let record = ErrorRecord::new("E1", "ValueError", "bad input")
            .severity(Severity::Low)
            .category(ErrorCategory::Validation);
        assert!(engine.save_error(&record));

        let hits = engine.query_errors(&QueryFilter::new().severity(Severity::Low));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].error_id, "E1");

        let report = engine.get_statistics(None, None).unwrap();
        assert_eq!(report.total_errors, 1);
        assert_eq!(report.errors_by_severity.get("LOW"), Some(&1));
        assert_eq!(report.unresolved_errors, 1);

        let today = chrono::Utc::now().date_naive();
        let day = engine.get_daily_statistics(today).unwrap();
        assert_eq!(day.total_errors, 1);
    }

    #[test]
    fn test_update_and_delete_through_facade() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());

        let mut record = ErrorRecord::new("E2", "IOError", "disk full");
        assert!(engine.save_error(&record));

        record.mark_resolved("retry", 1.5);
        assert!(engine.update_error(&record));
        let loaded = engine.get_error("E2").unwrap();
        assert!(loaded.resolved);
        assert_eq!(loaded.resolution_method.as_deref(), Some("retry"));

        assert!(engine.delete_error("E2"));
        assert!(engine.get_error("E2").is_none());
        assert!(!engine.delete_error("E2"));
    }

    #[test]
    fn test_missing_record_is_none_not_error() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());
        assert!(engine.get_error("nope").is_none());
        assert!(engine.query_errors(&QueryFilter::new()).is_empty());
    }

    #[test]
    fn test_database_info() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());
        engine.save_error(&ErrorRecord::new("E3", "T", "m"));

        let info = engine.get_database_info();
        assert_eq!(info.record_count, 1);
        assert!(info.file_size_bytes > 0);
        assert!(info.path.ends_with("errors.db"));
        assert_eq!(info.pool.max_connections, 5);
    }

    #[test]
    fn test_save_config_applies_runtime_parameters() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());

        let updated = EngineConfig {
            max_connections: 2,
            retention_days: 7,
            cleanup_schedule: "@every 1h".to_string(),
            auto_cleanup: true,
            ..engine.config()
        };
        assert!(engine.save_config(&updated));

        assert_eq!(engine.config().retention_days, 7);
        assert_eq!(engine.get_database_info().pool.max_connections, 2);
        let status = engine.get_cleanup_status();
        assert!(status.running);
        assert_eq!(status.mode, "interval");
    }

    #[test]
    fn test_trigger_cleanup_enforces_retention() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());

        let old = ErrorRecord::new("OLD", "T", "m")
            .created_at(chrono::Utc::now() - chrono::Duration::days(10));
        engine.save_error(&old);
        engine.save_error(&ErrorRecord::new("NEW", "T", "m"));

        let config = EngineConfig {
            retention_days: 1,
            ..engine.config()
        };
        assert!(engine.save_config(&config));
        assert_eq!(engine.trigger_cleanup_now(), 1);
        assert!(engine.get_error("OLD").is_none());
        assert!(engine.get_error("NEW").is_some());
    }

    #[test]
    fn test_shutdown_is_idempotent_and_disables_writes() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_at(dir.path());

        engine.shutdown();
        engine.shutdown();
        assert!(!engine.save_error(&ErrorRecord::new("E4", "T", "m")));
    }

    #[test]
    fn test_watcher_reload_applies_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let db_path = dir.path().join("errors.db");
        let write_config = |retention: u32| {
            std::fs::write(
                &config_path,
                format!(
                    r#"{{"error_history": {{"database_path": {:?},
                        "auto_cleanup": false, "retention_days": {}}}}}"#,
                    db_path, retention
                ),
            )
            .unwrap();
        };
        write_config(30);

        let engine = ErrorHistoryEngine::new(
            EngineOptions::new()
                .source(ConfigSource::NestedFile(config_path.clone()))
                .poll_interval(Duration::from_millis(50))
                .watch(Some(WatchStrategy::Poll)),
        )
        .unwrap();
        assert_eq!(engine.config().retention_days, 30);

        std::thread::sleep(Duration::from_millis(150));
        write_config(7);

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while engine.config().retention_days != 7 {
            assert!(
                std::time::Instant::now() < deadline,
                "watcher never applied the updated configuration"
            );
            std::thread::sleep(Duration::from_millis(25));
        }
        engine.shutdown();
    }
}
