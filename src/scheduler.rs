//! Retention scheduler
//!
//! Background loop that periodically deletes records older than the
//! retention cutoff. Two schedule grammars are supported:
//!
//! - interval: `@every <N><unit>` with unit in {ms, s, m, h}, fired
//!   whenever `now - last_run >= interval`, checked on a short tick so
//!   short intervals stay responsive
//! - cron-lite: `m h * * *`, honoring only the minute and hour fields and
//!   guarded against firing twice in the same calendar day
//!
//! Malformed schedules fall back to daily 02:00. A failure inside one
//! cleanup pass is logged and the loop continues on its next tick.

use crate::config::EngineConfig;
use crate::store::error::{EngineError, EngineResult};
use crate::store::RecordStore;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Loop tick; also bounds how long `stop` waits for the thread to exit
const TICK: Duration = Duration::from_millis(250);

/// Parsed cleanup schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fire every fixed duration since the last run
    Interval(Duration),
    /// Fire once per day at the given UTC hour and minute
    Daily { hour: u32, minute: u32 },
}

impl Schedule {
    /// Parse either grammar; anything else is `ConfigInvalid`
    pub fn parse(raw: &str) -> EngineResult<Schedule> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("@every") {
            return parse_interval(rest.trim());
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::ConfigInvalid(format!(
                "schedule must be '@every <N><unit>' or 'm h * * *', got '{}'",
                raw
            )));
        }
        let minute: u32 = fields[0]
            .parse()
            .map_err(|_| EngineError::ConfigInvalid(format!("bad minute field '{}'", fields[0])))?;
        let hour: u32 = fields[1]
            .parse()
            .map_err(|_| EngineError::ConfigInvalid(format!("bad hour field '{}'", fields[1])))?;
        if minute > 59 || hour > 23 {
            return Err(EngineError::ConfigInvalid(format!(
                "minute/hour out of range in '{}'",
                raw
            )));
        }
        // Day, month and weekday fields are accepted but ignored
        Ok(Schedule::Daily { hour, minute })
    }

    /// Parse, falling back to the daily 02:00 default on any error
    pub fn parse_or_fallback(raw: &str) -> Schedule {
        match Schedule::parse(raw) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(schedule = raw, error = %e, "falling back to daily 02:00");
                Schedule::fallback()
            }
        }
    }

    pub fn fallback() -> Schedule {
        Schedule::Daily { hour: 2, minute: 0 }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Schedule::Interval(_) => "interval",
            Schedule::Daily { .. } => "daily",
        }
    }

    /// Next fire time derived from the schedule and the last run
    pub fn next_run(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Interval(interval) => {
                let interval = ChronoDuration::from_std(*interval)
                    .unwrap_or_else(|_| ChronoDuration::days(1));
                last_run.unwrap_or(now) + interval
            }
            Schedule::Daily { hour, minute } => {
                let today = now
                    .with_hour(*hour)
                    .and_then(|t| t.with_minute(*minute))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
        }
    }
}

fn parse_interval(rest: &str) -> EngineResult<Schedule> {
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err(EngineError::ConfigInvalid(format!(
            "interval needs a count: '@every {}'",
            rest
        )));
    }
    let (count, unit) = rest.split_at(digits);
    let count: u64 = count
        .parse()
        .map_err(|_| EngineError::ConfigInvalid(format!("bad interval count '{}'", count)))?;
    if count == 0 {
        return Err(EngineError::ConfigInvalid(
            "interval count must be at least 1".to_string(),
        ));
    }
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(count),
        "s" => Duration::from_secs(count),
        "m" => Duration::from_secs(count * 60),
        "h" => Duration::from_secs(count * 3600),
        other => {
            return Err(EngineError::ConfigInvalid(format!(
                "interval unit must be ms/s/m/h, got '{}'",
                other
            )))
        }
    };
    Ok(Schedule::Interval(duration))
}

/// Scheduler state snapshot for introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// Raw schedule string as configured
    pub schedule: String,
    /// "interval" or "daily"
    pub mode: String,
}

struct SchedulerInner {
    schedule: Schedule,
    raw_schedule: String,
    retention_days: u32,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    last_run_date: Option<NaiveDate>,
}

struct Shared {
    store: RecordStore,
    running: AtomicBool,
    inner: Mutex<SchedulerInner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One loop iteration: fire the cleanup when the schedule is due
    fn tick(&self, now: DateTime<Utc>) {
        let due = {
            let mut inner = self.lock();
            match inner.schedule {
                Schedule::Interval(interval) => {
                    let interval = ChronoDuration::from_std(interval)
                        .unwrap_or_else(|_| ChronoDuration::days(1));
                    let last = *inner.last_run.get_or_insert(now);
                    now - last >= interval
                }
                Schedule::Daily { hour, minute } => {
                    now.hour() == hour
                        && now.minute() == minute
                        && inner.last_run_date != Some(now.date_naive())
                }
            }
        };

        if due {
            self.run_pass(now);
        }
    }

    /// Run one cleanup pass; failures are logged and never stop the loop
    fn run_pass(&self, now: DateTime<Utc>) -> usize {
        let days = {
            let mut inner = self.lock();
            inner.last_run = Some(now);
            inner.last_run_date = Some(now.date_naive());
            inner.retention_days
        };

        match self.store.cleanup_older_than(days) {
            Ok(deleted) => {
                tracing::info!(deleted, retention_days = days, "scheduled cleanup pass done");
                deleted
            }
            Err(e) => {
                tracing::error!(error = %e, "scheduled cleanup pass failed");
                0
            }
        }
    }
}

/// Background retention scheduler: Stopped -> Running -> Stopped
///
/// No intermediate state survives a restart; `restart` re-reads the
/// active configuration.
pub struct RetentionScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl RetentionScheduler {
    pub fn new(store: RecordStore, config: &EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                running: AtomicBool::new(false),
                inner: Mutex::new(SchedulerInner {
                    schedule: Schedule::parse_or_fallback(&config.cleanup_schedule),
                    raw_schedule: config.cleanup_schedule.clone(),
                    retention_days: config.retention_days,
                    enabled: config.auto_cleanup,
                    last_run: None,
                    last_run_date: None,
                }),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the loop; no-op when already running or auto-cleanup is off
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }
        if !self.shared.lock().enabled {
            tracing::debug!("auto cleanup disabled, scheduler not started");
            return;
        }

        let shared = self.shared.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        shared.running.store(true, Ordering::SeqCst);

        let handle = std::thread::spawn(move || {
            tracing::debug!("retention scheduler loop started");
            loop {
                match stop_rx.recv_timeout(TICK) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                shared.tick(Utc::now());
            }
            shared.running.store(false, Ordering::SeqCst);
            tracing::debug!("retention scheduler loop stopped");
        });

        *worker = Some((stop_tx, handle));
    }

    /// Signal the loop to exit and join it; bounded by the loop tick
    pub fn stop(&self) {
        let taken = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some((stop_tx, handle)) = taken {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
                self.shared.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop, re-read the given configuration, start again
    pub fn restart(&self, config: &EngineConfig) {
        self.stop();
        {
            let mut inner = self.shared.lock();
            inner.schedule = Schedule::parse_or_fallback(&config.cleanup_schedule);
            inner.raw_schedule = config.cleanup_schedule.clone();
            inner.retention_days = config.retention_days;
            inner.enabled = config.auto_cleanup;
            inner.last_run = None;
            inner.last_run_date = None;
        }
        self.start();
    }

    /// Run one cleanup pass synchronously, regardless of schedule state
    pub fn trigger_now(&self) -> EngineResult<usize> {
        let days = {
            let mut inner = self.shared.lock();
            let now = Utc::now();
            inner.last_run = Some(now);
            inner.last_run_date = Some(now.date_naive());
            inner.retention_days
        };
        self.shared.store.cleanup_older_than(days)
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.shared.lock();
        let now = Utc::now();
        SchedulerStatus {
            enabled: inner.enabled,
            running: self.shared.running.load(Ordering::SeqCst),
            last_run: inner.last_run,
            next_run: Some(inner.schedule.next_run(inner.last_run, now)),
            schedule: inner.raw_schedule.clone(),
            mode: inner.schedule.mode().to_string(),
        }
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
