//! # Faultline
//!
//! Embedded error-history engine over SQLite: captures structured error
//! records, keeps per-day statistics rollups, and ages old records out on
//! a configurable schedule.
//!
//! ## Features
//!
//! - Structured [`ErrorRecord`]s with severity, category, call-site and
//!   JSON context, upserted by stable `error_id`
//! - Per-thread connection pooling with health checks and WAL journaling
//! - Daily statistics maintained on write, plus ad-hoc range aggregation
//! - Retention scheduler with cron-lite (`m h * * *`) and interval
//!   (`@every N<unit>`) grammars
//! - Layered configuration (nested file, legacy file, injected provider,
//!   in-store table) with polling/event hot reload
//! - Log-and-continue engine facade: an error-history failure never
//!   propagates into the embedding application
//!
//! ## Quick start
//!
//! ```no_run
//! use faultline::engine::{EngineOptions, ErrorHistoryEngine};
//! use faultline::config::ConfigSource;
//! use faultline::store::{ErrorCategory, ErrorRecord, QueryFilter, Severity};
//!
//! # fn main() -> faultline::store::EngineResult<()> {
//! let engine = ErrorHistoryEngine::new(
//!     EngineOptions::new()
//!         .source(ConfigSource::NestedFile("config.json".into()))
//!         .source(ConfigSource::SystemTable),
//! )?;
//!
//! engine.save_error(
//!     &ErrorRecord::new("auth-401-a1b2", "AuthError", "token expired")
//!         .severity(Severity::Medium)
//!         .category(ErrorCategory::Authentication)
//!         .module("api.session"),
//! );
//!
//! let recent = engine.query_errors(&QueryFilter::new().severity(Severity::Medium));
//! println!("{} medium-severity errors", recent.len());
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod scheduler;
pub mod store;
pub mod watcher;

pub use config::{ConfigLoader, ConfigProvider, ConfigSource, EngineConfig};
pub use engine::{DatabaseInfo, EngineOptions, ErrorHistoryEngine};
pub use scheduler::{RetentionScheduler, Schedule, SchedulerStatus};
pub use store::{
    ConnectionPool, DailyStatistics, EngineError, EngineResult, ErrorCategory, ErrorRecord,
    QueryFilter, RecordStore, Severity, StatisticsReport,
};
pub use watcher::{ConfigWatcher, WatchStrategy};
