//! Persistence layer
//!
//! Everything that touches SQLite lives here:
//!
//! - `types`: entity model (records, rollups, query filters)
//! - `error`: crate-wide error taxonomy
//! - `pool`: per-thread connection cache over one database file
//! - `schema`: idempotent DDL for tables and indexes
//! - `records`: CRUD and dynamic filtered queries
//! - `stats`: on-write daily rollups and range aggregation

pub mod error;
pub mod pool;
pub mod records;
pub mod schema;
pub mod stats;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use records::RecordStore;
pub use types::{
    DailyStatistics, ErrorCategory, ErrorRecord, QueryFilter, Severity, StatisticsReport,
};
