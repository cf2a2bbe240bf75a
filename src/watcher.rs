//! Configuration hot-reload watcher
//!
//! Watches the file-based configuration sources and re-resolves the
//! layered configuration when any of them changes. Polling is the
//! baseline mechanism: every interval the watcher compares a
//! (modified-time, length) snapshot per file. Filesystem event
//! notification is an optional fast path layered on top; if the event
//! backend fails to initialize the watcher degrades to polling and says
//! so once, it never refuses to run.

use crate::config::{ConfigLoader, EngineConfig};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// How change detection is wired up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    /// Snapshot comparison on a fixed interval only
    Poll,
    /// Polling plus filesystem events when the backend is available
    PollAndEvents,
}

enum WatchSignal {
    Stop,
    Changed,
}

/// Per-file snapshot; length breaks ties when mtime granularity is coarse
type Snapshot = HashMap<PathBuf, (SystemTime, u64)>;

fn take_snapshot(paths: &[PathBuf]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for path in paths {
        if let Ok(meta) = std::fs::metadata(path) {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            snapshot.insert(path.clone(), (mtime, meta.len()));
        }
    }
    snapshot
}

/// Background watcher thread handle
pub struct ConfigWatcher {
    tx: mpsc::Sender<WatchSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigWatcher {
    /// Spawn the watcher thread. `apply` runs on the watcher thread with
    /// each newly resolved configuration.
    pub fn spawn(
        loader: Arc<ConfigLoader>,
        poll_interval: Duration,
        strategy: WatchStrategy,
        apply: impl Fn(EngineConfig) + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WatchSignal>();
        let event_tx = tx.clone();

        let handle = std::thread::spawn(move || {
            let paths = loader.watched_paths();

            // Event backend is best effort; hold the watcher so it stays alive
            let _event_watcher = match strategy {
                WatchStrategy::Poll => None,
                WatchStrategy::PollAndEvents => match spawn_event_watcher(&paths, event_tx) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        tracing::warn!(error = %e, "event watcher unavailable, polling only");
                        None
                    }
                },
            };

            let mut snapshot = take_snapshot(&paths);
            loop {
                let reload = match rx.recv_timeout(poll_interval) {
                    Ok(WatchSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(WatchSignal::Changed) => true,
                    Err(RecvTimeoutError::Timeout) => {
                        let current = take_snapshot(&paths);
                        let changed = current != snapshot;
                        snapshot = current;
                        changed
                    }
                };

                if reload {
                    tracing::info!("configuration source changed, reloading");
                    apply(loader.resolve());
                    // Event storms collapse into the snapshot taken here
                    snapshot = take_snapshot(&paths);
                }
            }
            tracing::debug!("config watcher stopped");
        });

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the thread to exit and join it
    pub fn stop(&self) {
        let taken = {
            let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            handle.take()
        };
        if let Some(handle) = taken {
            let _ = self.tx.send(WatchSignal::Stop);
            if handle.join().is_err() {
                tracing::error!("config watcher thread panicked");
            }
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_event_watcher(
    paths: &[PathBuf],
    tx: mpsc::Sender<WatchSignal>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                let _ = tx.send(WatchSignal::Changed);
            }
        }
    })?;
    for path in paths {
        // Watch the parent so create/rename of the file itself is seen
        let target = path.parent().filter(|p| p.exists()).map(PathBuf::from);
        match target {
            Some(dir) => watcher.watch(&dir, RecursiveMode::NonRecursive)?,
            None => {
                if path.exists() {
                    watcher.watch(path, RecursiveMode::NonRecursive)?;
                }
            }
        }
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn test_poll_detects_file_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"error_history": {"retention_days": 30}}"#,
        )
        .unwrap();

        let loader = Arc::new(ConfigLoader::new(vec![ConfigSource::NestedFile(
            path.clone(),
        )]));
        let seen: Arc<Mutex<Option<EngineConfig>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let watcher = ConfigWatcher::spawn(
            loader,
            Duration::from_millis(50),
            WatchStrategy::Poll,
            move |config| {
                *sink.lock().unwrap() = Some(config);
            },
        );

        // Let the initial snapshot settle before mutating the file
        std::thread::sleep(Duration::from_millis(150));
        std::fs::write(
            &path,
            r#"{"error_history": {"retention_days": 7}}"#,
        )
        .unwrap();

        assert!(wait_for(
            || {
                seen.lock()
                    .unwrap()
                    .as_ref()
                    .map(|c| c.retention_days == 7)
                    .unwrap_or(false)
            },
            Duration::from_secs(3),
        ));

        watcher.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let loader = Arc::new(ConfigLoader::new(vec![ConfigSource::NestedFile(
            dir.path().join("missing.json"),
        )]));
        let watcher = ConfigWatcher::spawn(
            loader,
            Duration::from_millis(50),
            WatchStrategy::Poll,
            |_| {},
        );
        watcher.stop();
        watcher.stop();
    }
}
