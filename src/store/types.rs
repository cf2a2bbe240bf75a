//! Core data types for the error-history store
//!
//! This module defines the entities persisted by the engine:
//! - `ErrorRecord`: one captured error occurrence
//! - `DailyStatistics`: the per-date rollup derived from records
//! - `QueryFilter`: composable filter set for record queries
//! - `Severity` and `ErrorCategory`: classification enums

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Severity of a captured error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Get all severities for iteration
    pub fn all() -> &'static [Severity] {
        &[
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
    }

    /// The canonical string stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Category of a captured error
///
/// The set is fixed; strings read back from the store that do not match any
/// variant decode to `Unknown` rather than failing the whole row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Unknown,
    Authentication,
    Authorization,
    Validation,
    Database,
    Network,
    FileIo,
    ModuleImport,
    Rendering,
    Configuration,
    System,
    Logging,
}

impl ErrorCategory {
    /// Get all categories for iteration
    pub fn all() -> &'static [ErrorCategory] {
        &[
            ErrorCategory::Unknown,
            ErrorCategory::Authentication,
            ErrorCategory::Authorization,
            ErrorCategory::Validation,
            ErrorCategory::Database,
            ErrorCategory::Network,
            ErrorCategory::FileIo,
            ErrorCategory::ModuleImport,
            ErrorCategory::Rendering,
            ErrorCategory::Configuration,
            ErrorCategory::System,
            ErrorCategory::Logging,
        ]
    }

    /// The canonical string stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Unknown => "UNKNOWN",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Authorization => "AUTHORIZATION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Database => "DATABASE",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::FileIo => "FILE_IO",
            ErrorCategory::ModuleImport => "MODULE_IMPORT",
            ErrorCategory::Rendering => "RENDERING",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::Logging => "LOGGING",
        }
    }

    /// Parse a stored string, mapping anything unrecognized to `Unknown`
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "AUTHENTICATION" => ErrorCategory::Authentication,
            "AUTHORIZATION" => ErrorCategory::Authorization,
            "VALIDATION" => ErrorCategory::Validation,
            "DATABASE" => ErrorCategory::Database,
            "NETWORK" => ErrorCategory::Network,
            "FILE_IO" => ErrorCategory::FileIo,
            "MODULE_IMPORT" => ErrorCategory::ModuleImport,
            "RENDERING" => ErrorCategory::Rendering,
            "CONFIGURATION" => ErrorCategory::Configuration,
            "SYSTEM" => ErrorCategory::System,
            "LOGGING" => ErrorCategory::Logging,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured error occurrence
///
/// `error_id` is the caller-supplied business key: saving a second record
/// with the same `error_id` replaces the first (upsert, not append).
/// `resolved_at` and `resolution_method` are only meaningful while
/// `resolved` is true; the store does not enforce that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    /// Store-assigned surrogate key, None until persisted
    #[serde(default)]
    pub id: Option<i64>,
    /// Caller-supplied unique identifier
    pub error_id: String,
    /// Error class/type name
    pub error_type: String,
    /// Human-readable message
    pub error_message: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    /// Module the error originated in
    #[serde(default)]
    pub module: Option<String>,
    /// Function the error originated in
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line_number: Option<i64>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Free-form context captured at the error site
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub user_context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub system_context: HashMap<String, serde_json::Value>,
    /// Stamped at first persistence when absent
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_method: Option<String>,
    /// Time to resolution in seconds
    #[serde(default)]
    pub resolution_time: Option<f64>,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_max_retries() -> i64 {
    3
}

impl ErrorRecord {
    /// Create a new record with required fields
    pub fn new(
        error_id: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            error_id: error_id.into(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            severity: Severity::Medium,
            category: ErrorCategory::Unknown,
            module: None,
            function: None,
            line_number: None,
            stack_trace: None,
            context: HashMap::new(),
            user_context: HashMap::new(),
            system_context: HashMap::new(),
            created_at: None,
            resolved: false,
            resolved_at: None,
            resolution_method: None,
            resolution_time: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Builder: set severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Builder: set category
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// Builder: set originating module
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Builder: set originating function
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Builder: set source line
    pub fn line(mut self, line: i64) -> Self {
        self.line_number = Some(line);
        self
    }

    /// Builder: attach a stack trace
    pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Builder: set creation timestamp
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Builder: add a context entry
    pub fn context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Builder: add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Mark this record resolved
    pub fn mark_resolved(&mut self, method: impl Into<String>, seconds: f64) {
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        self.resolution_method = Some(method.into());
        self.resolution_time = Some(seconds);
    }
}

/// Per-date aggregated statistics, derived from that day's records
///
/// Invariants held for every row the aggregator writes:
/// `resolved_errors + unresolved_errors == total_errors` and
/// `sum(errors_by_severity.values()) == total_errors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyStatistics {
    pub date: NaiveDate,
    pub total_errors: i64,
    pub errors_by_severity: HashMap<String, i64>,
    pub errors_by_category: HashMap<String, i64>,
    /// Top contributing modules, capped to the 20 largest counts
    pub errors_by_module: HashMap<String, i64>,
    pub resolved_errors: i64,
    pub unresolved_errors: i64,
    /// Average resolution time in seconds over resolved records
    pub avg_resolution_time: f64,
    pub error_rate_per_hour: f64,
}

impl DailyStatistics {
    /// An empty rollup for a date with no records
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_errors: 0,
            errors_by_severity: HashMap::new(),
            errors_by_category: HashMap::new(),
            errors_by_module: HashMap::new(),
            resolved_errors: 0,
            unresolved_errors: 0,
            avg_resolution_time: 0.0,
            error_rate_per_hour: 0.0,
        }
    }
}

/// On-demand range aggregation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsReport {
    /// Start of the aggregated range, None for unbounded
    pub start_date: Option<NaiveDate>,
    /// End of the aggregated range, None for unbounded
    pub end_date: Option<NaiveDate>,
    pub total_errors: i64,
    pub resolved_errors: i64,
    pub unresolved_errors: i64,
    pub avg_resolution_time: f64,
    pub errors_by_severity: HashMap<String, i64>,
    pub errors_by_category: HashMap<String, i64>,
    pub errors_by_module: HashMap<String, i64>,
    pub error_rate_per_hour: f64,
}

/// Query filter for error records
///
/// Filters compose with AND semantics; empty/unset members match everything.
/// Default ordering of results is most-recent-first by `created_at`.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Match any of these severities (empty = all)
    pub severities: Vec<Severity>,
    /// Match any of these categories (empty = all)
    pub categories: Vec<ErrorCategory>,
    /// Exact module match
    pub module: Option<String>,
    /// Resolved flag match
    pub resolved: Option<bool>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub until: Option<DateTime<Utc>>,
    /// Substring match on `error_type`
    pub error_type_contains: Option<String>,
    /// Substring match on `error_message`
    pub message_contains: Option<String>,
    /// Maximum rows returned
    pub limit: Option<u32>,
    /// Rows to skip (pagination)
    pub offset: Option<u32>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.categories.push(category);
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn resolved(mut self, resolved: bool) -> Self {
        self.resolved = Some(resolved);
        self
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn error_type_contains(mut self, needle: impl Into<String>) -> Self {
        self.error_type_contains = Some(needle.into());
        self
    }

    pub fn message_contains(mut self, needle: impl Into<String>) -> Self {
        self.message_contains = Some(needle.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}
