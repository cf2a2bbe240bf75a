//! Connection pool over the embedded database file
//!
//! One connection is cached per calling thread, created lazily and capped
//! at `max_connections` live connections across all threads. Connections
//! are health-checked on reuse and evicted when broken; they are never
//! closed on release, only on shutdown (or when the cap shrinks).
//!
//! The membership map is the only shared structure and is guarded by a
//! single lock; health-check and creation both happen inside that critical
//! section so two callers cannot race on the same slot.

use crate::store::error::{EngineError, EngineResult};
use rusqlite::Connection;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Duration;

/// Pool occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Connections currently open (idle + checked out)
    pub live: usize,
    /// Connections parked in the per-thread cache
    pub idle: usize,
    /// Configured cap
    pub max_connections: usize,
}

struct PoolInner {
    idle: HashMap<ThreadId, Connection>,
    live: usize,
    max: usize,
}

/// Per-thread cached connection pool over a single database file
pub struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    /// Open a pool over `path`, creating the parent directory if needed
    pub fn open(
        path: impl Into<PathBuf>,
        max_connections: usize,
        busy_timeout: Duration,
    ) -> EngineResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            path,
            busy_timeout,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                live: 0,
                max: max_connections.max(1),
            }),
        })
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire a connection for the calling thread
    ///
    /// Returns the thread's cached connection when it passes a health
    /// check, otherwise opens a new one. Fails with
    /// [`EngineError::PoolExhausted`] when the pool is at capacity and no
    /// broken cached connection can be reclaimed; callers should treat
    /// that as retryable.
    pub fn acquire(&self) -> EngineResult<PooledConnection<'_>> {
        let owner = std::thread::current().id();
        let mut inner = self.lock();

        if let Some(conn) = inner.idle.remove(&owner) {
            if health_check(&conn) {
                return Ok(PooledConnection {
                    pool: self,
                    owner,
                    conn: Some(conn),
                });
            }
            // Broken cached connection: discard and fall through to create
            tracing::warn!("evicting unhealthy pooled connection");
            inner.live -= 1;
            drop(conn);
        }

        if inner.live >= inner.max {
            // Sweep every cached connection, reclaiming broken slots
            let before = inner.idle.len();
            inner.idle.retain(|_, conn| health_check(conn));
            inner.live -= before - inner.idle.len();
        }

        if inner.live >= inner.max {
            return Err(EngineError::PoolExhausted {
                capacity: inner.max,
            });
        }

        let conn = self.open_connection()?;
        inner.live += 1;

        Ok(PooledConnection {
            pool: self,
            owner,
            conn: Some(conn),
        })
    }

    /// Update the connection cap at runtime (hot reload)
    ///
    /// Surplus idle connections beyond the new cap are closed; checked-out
    /// connections are untouched and close on release.
    pub fn set_max_connections(&self, max_connections: usize) {
        let mut inner = self.lock();
        inner.max = max_connections.max(1);

        while inner.live > inner.max {
            let key = match inner.idle.keys().next().copied() {
                Some(key) => key,
                None => break,
            };
            inner.idle.remove(&key);
            inner.live -= 1;
        }
    }

    /// Close every cached connection; used on engine shutdown
    pub fn drain(&self) {
        let mut inner = self.lock();
        let drained = inner.idle.len();
        inner.idle.clear();
        inner.live -= drained;
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            live: inner.live,
            idle: inner.idle.len(),
            max_connections: inner.max,
        }
    }

    fn open_connection(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        Ok(conn)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        // A poisoned lock only means another thread panicked mid-mutation
        // of the membership map; the map itself stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, owner: ThreadId, conn: Connection) {
        let mut inner = self.lock();
        if inner.live > inner.max {
            // Cap shrank while this connection was checked out
            inner.live -= 1;
            return;
        }
        if inner.idle.insert(owner, conn).is_some() {
            inner.live -= 1;
        }
    }
}

fn health_check(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .is_ok()
}

/// RAII guard for a pooled connection
///
/// Dereferences to [`rusqlite::Connection`]; dropping it returns the
/// connection to the owning thread's cache slot.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    owner: ThreadId,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.owner, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pool(max: usize) -> (ConnectionPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(
            dir.path().join("test.db"),
            max,
            Duration::from_millis(250),
        )
        .unwrap();
        (pool, dir)
    }

    #[test]
    fn test_acquire_creates_lazily() {
        let (pool, _dir) = test_pool(4);
        assert_eq!(pool.stats().live, 0);

        let conn = pool.acquire().unwrap();
        assert_eq!(pool.stats().live, 1);
        assert_eq!(pool.stats().idle, 0);
        drop(conn);

        assert_eq!(pool.stats().live, 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_same_thread_reuses_connection() {
        let (pool, _dir) = test_pool(4);

        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());

        // One thread, one cached connection
        assert_eq!(pool.stats().live, 1);
    }

    #[test]
    fn test_wal_mode_enabled() {
        let (pool, _dir) = test_pool(2);
        let conn = pool.acquire().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let (pool, _dir) = test_pool(1);
        let held = pool.acquire().unwrap();

        let err = std::thread::scope(|s| {
            s.spawn(|| pool.acquire().map(|_| ()).unwrap_err())
                .join()
                .unwrap()
        });

        assert!(matches!(err, EngineError::PoolExhausted { capacity: 1 }));
        assert!(err.is_retryable());
        drop(held);
    }

    #[test]
    fn test_capacity_raise_admits_second_thread() {
        let (pool, _dir) = test_pool(1);
        let held = pool.acquire().unwrap();
        pool.set_max_connections(2);

        let ok = std::thread::scope(|s| {
            s.spawn(|| pool.acquire().is_ok()).join().unwrap()
        });
        assert!(ok);
        drop(held);
    }

    #[test]
    fn test_capacity_shrink_evicts_idle() {
        let (pool, _dir) = test_pool(4);

        // Park connections from three different threads
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| drop(pool.acquire().unwrap()));
            }
        });
        drop(pool.acquire().unwrap());
        assert_eq!(pool.stats().live, 3);

        pool.set_max_connections(1);
        assert_eq!(pool.stats().live, 1);
        assert_eq!(pool.stats().max_connections, 1);
    }

    #[test]
    fn test_drain() {
        let (pool, _dir) = test_pool(4);
        drop(pool.acquire().unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.drain();
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().idle, 0);

        // Pool stays usable after a drain
        assert!(pool.acquire().is_ok());
    }
}
