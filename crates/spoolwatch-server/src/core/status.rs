use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use spoolwatch_model::{LogSource, now_utc};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Tailing,
    RotationDetected,
    Reopening,
    Missing,
    Stopped,
}

impl WatcherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Tailing => "tailing",
            Self::RotationDetected => "rotation_detected",
            Self::Reopening => "reopening",
            Self::Missing => "missing",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub path: PathBuf,
    pub source: LogSource,
    pub state: WatcherState,
    pub offset: u64,
    pub rotations: u64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub context: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Point-in-time copy of [`ServiceStats`] for health surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub lines_received: u64,
    pub events_stored: u64,
    pub unknown_lines: u64,
    pub lossy_lines: u64,
    pub batches_flushed: u64,
    pub batches_dropped: u64,
    pub events_dropped: u64,
    pub attempts_recorded: u64,
    pub status_advances: u64,
    pub last_error: Option<LastError>,
    pub watchers: Vec<WatcherStatus>,
}

/// Shared counters updated by the watcher and ingestion workers.
pub struct ServiceStats {
    started_at: OffsetDateTime,
    lines_received: AtomicU64,
    events_stored: AtomicU64,
    unknown_lines: AtomicU64,
    lossy_lines: AtomicU64,
    batches_flushed: AtomicU64,
    batches_dropped: AtomicU64,
    events_dropped: AtomicU64,
    attempts_recorded: AtomicU64,
    status_advances: AtomicU64,
    last_error: Mutex<Option<LastError>>,
    watchers: Mutex<BTreeMap<PathBuf, WatcherStatus>>,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            started_at: now_utc(),
            lines_received: AtomicU64::new(0),
            events_stored: AtomicU64::new(0),
            unknown_lines: AtomicU64::new(0),
            lossy_lines: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            attempts_recorded: AtomicU64::new(0),
            status_advances: AtomicU64::new(0),
            last_error: Mutex::new(None),
            watchers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_line(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown(&self) {
        self.unknown_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// A line that was not valid UTF-8 and was stored with replacement
    /// characters.
    pub fn record_lossy_line(&self) {
        self.lossy_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_stored(
        &self,
        events: u64,
    ) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.events_stored.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_batch_dropped(
        &self,
        events: u64,
    ) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.events_dropped.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.attempts_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_advance(&self) {
        self.status_advances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(
        &self,
        context: &str,
        err: impl Display,
    ) {
        *lock(&self.last_error) = Some(LastError {
            context: context.to_string(),
            message: err.to_string(),
            at: now_utc(),
        });
    }

    pub fn register_watcher(
        &self,
        path: &Path,
        source: LogSource,
    ) {
        lock(&self.watchers).insert(path.to_path_buf(), WatcherStatus {
            path: path.to_path_buf(),
            source,
            state: WatcherState::Idle,
            offset: 0,
            rotations: 0,
            last_error: None,
            updated_at: now_utc(),
        });
    }

    pub fn set_watcher_state(
        &self,
        path: &Path,
        state: WatcherState,
        offset: u64,
    ) {
        self.update_watcher(path, |status| {
            if state == WatcherState::RotationDetected {
                status.rotations += 1;
            }
            if state == WatcherState::Tailing {
                status.last_error = None;
            }
            status.state = state;
            status.offset = offset;
        });
    }

    pub fn set_watcher_error(
        &self,
        path: &Path,
        err: impl Display,
    ) {
        let message = err.to_string();
        self.update_watcher(path, |status| {
            status.last_error = Some(message);
        });
    }

    fn update_watcher(
        &self,
        path: &Path,
        update: impl FnOnce(&mut WatcherStatus),
    ) {
        if let Some(status) = lock(&self.watchers).get_mut(path) {
            update(status);
            status.updated_at = now_utc();
        }
    }

    pub fn snapshot(&self) -> ServiceStatus {
        ServiceStatus {
            started_at: self.started_at,
            lines_received: self.lines_received.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            unknown_lines: self.unknown_lines.load(Ordering::Relaxed),
            lossy_lines: self.lossy_lines.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            attempts_recorded: self.attempts_recorded.load(Ordering::Relaxed),
            status_advances: self.status_advances.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
            watchers: lock(&self.watchers).values().cloned().collect(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
