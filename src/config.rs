//! Configuration system
//!
//! Engine configuration is resolved from an ordered list of layered
//! sources: a nested feature-scoped JSON file, a flat legacy JSON file
//! (remapped field by field), an injected config-service provider, the
//! store's own `system_config` table, then hard defaults. The first source
//! that yields a non-empty structure wins; later sources are not consulted.
//!
//! Sources are tagged variants chosen up front, never discovered by probing
//! the shape of whatever JSON happens to parse.

use crate::scheduler::Schedule;
use crate::store::{ConnectionPool, EngineResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Reserved top-level key for the engine's section in config files
pub const CONFIG_KEY: &str = "error_history";

/// Runtime configuration for the error-history engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Busy/lock wait timeout applied to every pooled connection
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_auto_cleanup")]
    pub auto_cleanup: bool,

    /// Either cron-lite `m h * * *` or interval `@every <N><unit>`
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
}

fn default_enabled() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/error_history.db")
}

fn default_max_connections() -> usize {
    5
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    90
}

fn default_auto_cleanup() -> bool {
    true
}

fn default_cleanup_schedule() -> String {
    "0 2 * * *".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            timeout_seconds: default_timeout_seconds(),
            retention_days: default_retention_days(),
            auto_cleanup: default_auto_cleanup(),
            cleanup_schedule: default_cleanup_schedule(),
        }
    }
}

impl EngineConfig {
    /// Clamp out-of-range values and replace an unparseable schedule
    ///
    /// Invalid fields are never fatal: each one is logged as a warning and
    /// falls back to its hard default.
    pub fn sanitize(mut self) -> Self {
        if self.max_connections < 1 {
            tracing::warn!(
                max_connections = self.max_connections,
                "max_connections below 1, clamping"
            );
            self.max_connections = 1;
        }
        if self.retention_days < 1 {
            tracing::warn!(
                retention_days = self.retention_days,
                "retention_days below 1, clamping"
            );
            self.retention_days = 1;
        }
        if Schedule::parse(&self.cleanup_schedule).is_err() {
            tracing::warn!(
                schedule = %self.cleanup_schedule,
                "unparseable cleanup_schedule, using daily 02:00"
            );
            self.cleanup_schedule = default_cleanup_schedule();
        }
        self
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// Injected lookup against an external configuration service
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Option<EngineConfig>;
}

/// One attempted configuration source, in loader priority order
#[derive(Clone)]
pub enum ConfigSource {
    /// JSON file with the engine section nested under `error_history`
    NestedFile(PathBuf),
    /// Flat legacy-shaped JSON file requiring field remapping
    LegacyFile(PathBuf),
    /// Config-service lookup supplied by the embedding application
    Provider(Arc<dyn ConfigProvider>),
    /// The `system_config` key/value table inside the store itself
    SystemTable,
}

impl std::fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::NestedFile(path) => write!(f, "NestedFile({:?})", path),
            ConfigSource::LegacyFile(path) => write!(f, "LegacyFile({:?})", path),
            ConfigSource::Provider(_) => write!(f, "Provider"),
            ConfigSource::SystemTable => write!(f, "SystemTable"),
        }
    }
}

/// Flat legacy config file shape, remapped by [`ConfigSource::LegacyFile`]
#[derive(Debug, Default, Deserialize)]
struct LegacyShape {
    error_history_enabled: Option<bool>,
    error_db_path: Option<PathBuf>,
    max_db_connections: Option<usize>,
    db_timeout_seconds: Option<u64>,
    history_retention_days: Option<u32>,
    auto_cleanup_enabled: Option<bool>,
    cleanup_cron: Option<String>,
}

impl LegacyShape {
    fn is_empty(&self) -> bool {
        self.error_history_enabled.is_none()
            && self.error_db_path.is_none()
            && self.max_db_connections.is_none()
            && self.db_timeout_seconds.is_none()
            && self.history_retention_days.is_none()
            && self.auto_cleanup_enabled.is_none()
            && self.cleanup_cron.is_none()
    }

    fn into_config(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            enabled: self.error_history_enabled.unwrap_or(defaults.enabled),
            database_path: self.error_db_path.unwrap_or(defaults.database_path),
            max_connections: self.max_db_connections.unwrap_or(defaults.max_connections),
            timeout_seconds: self.db_timeout_seconds.unwrap_or(defaults.timeout_seconds),
            retention_days: self
                .history_retention_days
                .unwrap_or(defaults.retention_days),
            auto_cleanup: self.auto_cleanup_enabled.unwrap_or(defaults.auto_cleanup),
            cleanup_schedule: self.cleanup_cron.unwrap_or(defaults.cleanup_schedule),
        }
    }
}

/// Resolves configuration through the ordered source list
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    /// Attached after the pool exists so the SystemTable source can read
    store: Mutex<Option<Arc<ConnectionPool>>>,
}

impl ConfigLoader {
    pub fn new(sources: Vec<ConfigSource>) -> Self {
        Self {
            sources,
            store: Mutex::new(None),
        }
    }

    /// Wire the store in so the `SystemTable` source participates
    pub fn attach_store(&self, pool: Arc<ConnectionPool>) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        *store = Some(pool);
    }

    /// Config file paths the watcher should poll
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.sources
            .iter()
            .filter_map(|source| match source {
                ConfigSource::NestedFile(path) | ConfigSource::LegacyFile(path) => {
                    Some(path.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Resolve the active configuration: first non-empty source wins
    pub fn resolve(&self) -> EngineConfig {
        for source in &self.sources {
            if let Some(config) = self.try_source(source) {
                tracing::debug!(?source, "configuration resolved");
                return config.sanitize();
            }
        }
        tracing::debug!("no configuration source available, using defaults");
        EngineConfig::default()
    }

    fn try_source(&self, source: &ConfigSource) -> Option<EngineConfig> {
        match source {
            ConfigSource::NestedFile(path) => load_nested(path),
            ConfigSource::LegacyFile(path) => load_legacy(path),
            ConfigSource::Provider(provider) => provider.load(),
            ConfigSource::SystemTable => {
                let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
                store.as_ref().and_then(|pool| load_system_table(pool))
            }
        }
    }
}

fn load_nested(path: &Path) -> Option<EngineConfig> {
    let content = read_config_file(path)?;
    let root: serde_json::Value = match serde_json::from_str(&content) {
        Ok(root) => root,
        Err(e) => {
            tracing::warn!(?path, error = %e, "failed to parse config file");
            return None;
        }
    };
    let section = root.get(CONFIG_KEY)?.clone();
    match serde_json::from_value(section) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(?path, error = %e, "malformed {} section", CONFIG_KEY);
            None
        }
    }
}

fn load_legacy(path: &Path) -> Option<EngineConfig> {
    let content = read_config_file(path)?;
    let shape: LegacyShape = match serde_json::from_str(&content) {
        Ok(shape) => shape,
        Err(e) => {
            tracing::warn!(?path, error = %e, "failed to parse legacy config file");
            return None;
        }
    };
    if shape.is_empty() {
        return None;
    }
    Some(shape.into_config())
}

fn load_system_table(pool: &ConnectionPool) -> Option<EngineConfig> {
    let conn = match pool.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "could not read system_config fallback");
            return None;
        }
    };
    let raw: Option<String> = conn
        .query_row(
            "SELECT config_value FROM system_config WHERE config_key = ?1",
            params![CONFIG_KEY],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();

    raw.and_then(|raw| match serde_json::from_str(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(error = %e, "malformed config in system_config table");
            None
        }
    })
}

fn read_config_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(?path, error = %e, "failed to read config file");
            None
        }
    }
}

/// Persist the in-memory config into the store's `system_config` table
///
/// Older SQLite builds reject `ON CONFLICT ... DO UPDATE`; the write falls
/// back to `INSERT OR REPLACE` when the primary upsert fails.
pub fn save_to_store(pool: &ConnectionPool, config: &EngineConfig) -> EngineResult<()> {
    let conn = pool.acquire()?;
    let value = serde_json::to_string(config)?;
    let now = Utc::now();

    let upsert = conn.execute(
        "INSERT INTO system_config
            (config_key, config_value, config_type, description, updated_at)
         VALUES (?1, ?2, 'json', 'error-history engine runtime configuration', ?3)
         ON CONFLICT(config_key) DO UPDATE SET
            config_value = excluded.config_value,
            updated_at = excluded.updated_at",
        params![CONFIG_KEY, value, now],
    );

    if let Err(e) = upsert {
        tracing::debug!(error = %e, "upsert rejected, using INSERT OR REPLACE fallback");
        conn.execute(
            "INSERT OR REPLACE INTO system_config
                (config_key, config_value, config_type, description, updated_at)
             VALUES (?1, ?2, 'json', 'error-history engine runtime configuration', ?3)",
            params![CONFIG_KEY, value, now],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.enabled);
        assert_eq!(config.database_path, PathBuf::from("data/error_history.db"));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.retention_days, 90);
        assert!(config.auto_cleanup);
        assert_eq!(config.cleanup_schedule, "0 2 * * *");
    }

    #[test]
    fn test_sanitize_clamps() {
        let config = EngineConfig {
            max_connections: 0,
            retention_days: 0,
            cleanup_schedule: "whenever".to_string(),
            ..Default::default()
        }
        .sanitize();

        assert_eq!(config.max_connections, 1);
        assert_eq!(config.retention_days, 1);
        assert_eq!(config.cleanup_schedule, "0 2 * * *");
    }

    #[test]
    fn test_nested_file_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"error_history": {"retention_days": 14, "cleanup_schedule": "@every 5m"}}"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(vec![ConfigSource::NestedFile(path)]);
        let config = loader.resolve();

        assert_eq!(config.retention_days, 14);
        assert_eq!(config.cleanup_schedule, "@every 5m");
        // Unspecified fields fall back to defaults
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_legacy_file_remap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        std::fs::write(
            &path,
            r#"{"error_db_path": "old/errors.db", "history_retention_days": 30,
                "max_db_connections": 2, "cleanup_cron": "30 4 * * *"}"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(vec![ConfigSource::LegacyFile(path)]);
        let config = loader.resolve();

        assert_eq!(config.database_path, PathBuf::from("old/errors.db"));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.cleanup_schedule, "30 4 * * *");
        assert!(config.auto_cleanup);
    }

    #[test]
    fn test_first_source_wins() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("config.json");
        let legacy = dir.path().join("legacy.json");
        std::fs::write(&nested, r#"{"error_history": {"retention_days": 7}}"#).unwrap();
        std::fs::write(&legacy, r#"{"history_retention_days": 99}"#).unwrap();

        let loader = ConfigLoader::new(vec![
            ConfigSource::NestedFile(nested),
            ConfigSource::LegacyFile(legacy),
        ]);
        assert_eq!(loader.resolve().retention_days, 7);
    }

    #[test]
    fn test_missing_file_falls_through() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::new(vec![ConfigSource::NestedFile(
            dir.path().join("absent.json"),
        )]);
        assert_eq!(loader.resolve(), EngineConfig::default());
    }

    #[test]
    fn test_provider_source() {
        struct Fixed;
        impl ConfigProvider for Fixed {
            fn load(&self) -> Option<EngineConfig> {
                Some(EngineConfig {
                    retention_days: 3,
                    ..Default::default()
                })
            }
        }

        let loader = ConfigLoader::new(vec![ConfigSource::Provider(Arc::new(Fixed))]);
        assert_eq!(loader.resolve().retention_days, 3);
    }

    #[test]
    fn test_system_table_round_trip() {
        let dir = tempdir().unwrap();
        let pool = Arc::new(
            ConnectionPool::open(
                dir.path().join("store.db"),
                2,
                std::time::Duration::from_millis(250),
            )
            .unwrap(),
        );
        {
            let conn = pool.acquire().unwrap();
            schema::initialize(&conn).unwrap();
        }

        let saved = EngineConfig {
            retention_days: 45,
            ..Default::default()
        };
        save_to_store(&pool, &saved).unwrap();
        // Saving twice exercises the upsert path
        save_to_store(&pool, &saved).unwrap();

        let loader = ConfigLoader::new(vec![ConfigSource::SystemTable]);
        // Not yet attached: source yields nothing
        assert_eq!(loader.resolve(), EngineConfig::default());

        loader.attach_store(pool);
        assert_eq!(loader.resolve().retention_days, 45);
    }

    #[test]
    fn test_watched_paths() {
        let loader = ConfigLoader::new(vec![
            ConfigSource::NestedFile(PathBuf::from("a.json")),
            ConfigSource::SystemTable,
            ConfigSource::LegacyFile(PathBuf::from("b.json")),
        ]);
        assert_eq!(
            loader.watched_paths(),
            vec![PathBuf::from("a.json"), PathBuf::from("b.json")]
        );
    }
}
