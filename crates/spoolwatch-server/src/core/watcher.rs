use std::fs::Metadata;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher
};
use spoolwatch_model::LogSource;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ingest::IngestHandle;
use super::status::{ServiceStats, WatcherState};
use crate::config::WatchConfig;

/// Lines longer than this are emitted in pieces.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub source: LogSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity_of(meta: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;

    Some(FileIdentity { dev: meta.dev(), ino: meta.ino() })
}

#[cfg(not(unix))]
fn identity_of(_meta: &Metadata) -> Option<FileIdentity> {
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPosition {
    Start,
    End,
    /// Continue at the tracked offset if the file is still the same one.
    Resume,
}

/// Tail state for one path. Survives handle loss so a reopen can resume.
struct FileTail {
    path: PathBuf,
    source: LogSource,
    state: WatcherState,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    partial: Vec<u8>,
    buf: Vec<u8>,
    next_open: OpenPosition,
    next_open_at: Option<Instant>,
    retry_interval: Duration,
}

impl FileTail {
    fn new(
        file: &WatchedFile,
        config: &WatchConfig,
    ) -> Self {
        Self {
            path: file.path.clone(),
            source: file.source,
            state: WatcherState::Idle,
            file: None,
            identity: None,
            offset: 0,
            partial: Vec::new(),
            buf: vec![0; config.read_chunk_bytes.max(512)],
            next_open: if config.start_at_end {
                OpenPosition::End
            } else {
                OpenPosition::Start
            },
            next_open_at: None,
            retry_interval: config.retry_interval,
        }
    }

    fn set_state(
        &mut self,
        state: WatcherState,
        stats: &ServiceStats,
    ) {
        self.state = state;
        stats.set_watcher_state(&self.path, state, self.offset);
    }

    /// One wake-up: open if needed, check for rotation, read what is new.
    async fn poll(
        &mut self,
        ingest: &IngestHandle,
        stats: &ServiceStats,
    ) -> Result<()> {
        if self.file.is_none() && !self.try_open(stats).await {
            return Ok(());
        }

        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                let replaced = match (self.identity, identity_of(&meta)) {
                    (Some(current), Some(on_disk)) => current != on_disk,
                    _ => false,
                };
                if replaced {
                    self.rotate(ingest, stats, "identity changed", true).await?;
                } else if meta.len() < self.offset {
                    self.rotate(ingest, stats, "truncated", false).await?;
                }
            }
            // Renamed away and not recreated yet: keep draining the old handle.
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to stat {}", self.path.display())
                });
            }
        }

        let emitted = self.read_available(ingest, stats).await?;
        if emitted > 0 {
            stats.set_watcher_state(&self.path, self.state, self.offset);
        }
        Ok(())
    }

    async fn try_open(
        &mut self,
        stats: &ServiceStats,
    ) -> bool {
        let now = Instant::now();
        if self.next_open_at.is_some_and(|at| now < at) {
            return false;
        }

        match self.open(self.next_open).await {
            Ok(()) => {
                info!(
                    "watcher tailing: path={}, source={}, offset={}",
                    self.path.display(),
                    self.source,
                    self.offset
                );
                self.next_open_at = None;
                self.set_state(WatcherState::Tailing, stats);
                true
            }
            Err(err) => {
                if self.state == WatcherState::Missing {
                    debug!(
                        "log file still unavailable: path={}, error={:#}",
                        self.path.display(),
                        err
                    );
                } else {
                    warn!(
                        "log file unavailable, will retry: path={}, retry_ms={}, error={:#}",
                        self.path.display(),
                        self.retry_interval.as_millis(),
                        err
                    );
                }
                // A file that appears later holds only new lines.
                if self.next_open == OpenPosition::End {
                    self.next_open = OpenPosition::Start;
                }
                self.next_open_at = Some(now + self.retry_interval);
                stats.set_watcher_error(&self.path, format!("{err:#}"));
                self.set_state(WatcherState::Missing, stats);
                false
            }
        }
    }

    async fn open(
        &mut self,
        position: OpenPosition,
    ) -> Result<()> {
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        let identity = identity_of(&meta);

        let offset = match position {
            OpenPosition::Start => 0,
            OpenPosition::End => meta.len(),
            OpenPosition::Resume
                if identity.is_some()
                    && identity == self.identity
                    && meta.len() >= self.offset =>
            {
                self.offset
            }
            OpenPosition::Resume => 0,
        };
        if offset != self.offset || position != OpenPosition::Resume {
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek {}", self.path.display()))?;

        self.file = Some(file);
        self.identity = identity;
        self.offset = offset;
        Ok(())
    }

    async fn rotate(
        &mut self,
        ingest: &IngestHandle,
        stats: &ServiceStats,
        reason: &str,
        drain_old: bool,
    ) -> Result<()> {
        info!(
            "rotation detected: path={}, reason={}, offset={}",
            self.path.display(),
            reason,
            self.offset
        );
        self.set_state(WatcherState::RotationDetected, stats);

        if drain_old {
            self.read_available(ingest, stats).await?;
        }
        self.emit_partial(ingest, stats).await?;

        self.set_state(WatcherState::Reopening, stats);
        self.file = None;
        self.open(OpenPosition::Start).await?;
        self.set_state(WatcherState::Tailing, stats);
        Ok(())
    }

    /// Reads to EOF on the current handle, emitting complete lines in order.
    async fn read_available(
        &mut self,
        ingest: &IngestHandle,
        stats: &ServiceStats,
    ) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let mut emitted = 0;

        loop {
            let read = file
                .read(&mut self.buf)
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            if read == 0 {
                break;
            }
            self.offset += read as u64;

            let mut rest = &self.buf[..read];
            while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
                self.partial.extend_from_slice(&rest[..pos]);
                rest = &rest[pos + 1..];
                ingest.ingest(take_line(&mut self.partial, stats), self.source).await?;
                emitted += 1;
            }
            self.partial.extend_from_slice(rest);

            if self.partial.len() > MAX_LINE_BYTES {
                warn!(
                    "overlong line split: path={}, bytes={}",
                    self.path.display(),
                    self.partial.len()
                );
                ingest.ingest(take_line(&mut self.partial, stats), self.source).await?;
                emitted += 1;
            }
        }

        Ok(emitted)
    }

    /// Emits an unterminated trailing line left behind by a rotation.
    async fn emit_partial(
        &mut self,
        ingest: &IngestHandle,
        stats: &ServiceStats,
    ) -> Result<()> {
        if self.partial.is_empty() {
            return Ok(());
        }
        debug!(
            "emitting unterminated line: path={}, bytes={}",
            self.path.display(),
            self.partial.len()
        );
        ingest.ingest(take_line(&mut self.partial, stats), self.source).await
    }

    fn lose_handle(
        &mut self,
        stats: &ServiceStats,
    ) {
        self.file = None;
        self.next_open = OpenPosition::Resume;
        self.next_open_at = Some(Instant::now() + self.retry_interval);
        self.set_state(WatcherState::Missing, stats);
    }
}

/// Takes the buffered line without its `\r`. Invalid UTF-8 is replaced with
/// U+FFFD and the line is counted in `lossy_lines`.
pub(super) fn take_line(
    partial: &mut Vec<u8>,
    stats: &ServiceStats,
) -> String {
    let mut bytes = std::mem::take(partial);
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => {
            stats.record_lossy_line();
            debug!(
                "invalid utf-8 replaced: valid_up_to={}, bytes={}",
                err.utf8_error().valid_up_to(),
                err.as_bytes().len()
            );
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    }
}

/// Watches the parent directory so renames and re-creations of the file wake
/// the tail immediately. Wake-ups are coalesced into a one-slot channel.
fn watch_parent_dir(
    path: &Path,
    wake_tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(|name| name.to_os_string());

    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| {
            let Ok(event) = result else {
                return;
            };
            let relevant = event.paths.iter().any(|changed| {
                changed.file_name().map(|name| name.to_os_string()) == file_name
            });
            if relevant {
                let _ = wake_tx.try_send(());
            }
        },
        NotifyConfig::default(),
    )
    .context("failed to create notify watcher")?;

    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", parent.display()))?;
    Ok(watcher)
}

/// Optional notify watcher. Without one the tail runs on the poll ticker
/// alone and setup is retried every `retry_interval`.
struct NotifySlot {
    watcher: Option<RecommendedWatcher>,
    wake_tx: mpsc::Sender<()>,
    retry_at: Instant,
    retry_interval: Duration,
    failures: u64,
}

impl NotifySlot {
    fn new(
        wake_tx: mpsc::Sender<()>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            watcher: None,
            wake_tx,
            retry_at: Instant::now(),
            retry_interval,
            failures: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.watcher.is_some()
    }

    fn ensure(
        &mut self,
        path: &Path,
    ) {
        if self.watcher.is_some() || Instant::now() < self.retry_at {
            return;
        }
        match watch_parent_dir(path, self.wake_tx.clone()) {
            Ok(watcher) => {
                if self.failures > 0 {
                    info!(
                        "notify attached: path={}, failed_attempts={}",
                        path.display(),
                        self.failures
                    );
                }
                self.watcher = Some(watcher);
            }
            Err(err) => {
                if self.failures == 0 {
                    warn!(
                        "notify unavailable, polling only: path={}, error={:#}",
                        path.display(),
                        err
                    );
                } else {
                    debug!(
                        "notify retry failed: path={}, attempt={}, error={:#}",
                        path.display(),
                        self.failures + 1,
                        err
                    );
                }
                self.failures += 1;
                self.retry_at = Instant::now() + self.retry_interval;
            }
        }
    }
}

/// Tails one log file until shutdown. Missing files and read errors are
/// retried on `retry_interval`; they never stop the worker.
pub async fn run_file_watcher(
    file: WatchedFile,
    config: WatchConfig,
    ingest: IngestHandle,
    stats: Arc<ServiceStats>,
    shutdown: CancellationToken,
) {
    let mut tail = FileTail::new(&file, &config);
    stats.register_watcher(&file.path, file.source);

    // The slot keeps a sender, so `recv` never resolves to `None`.
    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let mut notify = NotifySlot::new(wake_tx, config.retry_interval);
    notify.ensure(&file.path);

    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            Some(()) = wake_rx.recv() => {}
            _ = ticker.tick() => {}
        }

        notify.ensure(&file.path);
        if let Err(err) = tail.poll(&ingest, &stats).await {
            if shutdown.is_cancelled() {
                break;
            }
            warn!(
                "watcher read failed, reopening later: path={}, offset={}, error={:#}",
                file.path.display(),
                tail.offset,
                err
            );
            stats.set_watcher_error(&file.path, format!("{err:#}"));
            tail.lose_handle(&stats);
        }
    }

    debug!(
        "watcher loop ended: path={}, notify_active={}",
        file.path.display(),
        notify.is_active()
    );
    tail.set_state(WatcherState::Stopped, &stats);
    info!(
        "watcher stopping: path={}, offset={}",
        file.path.display(),
        tail.offset
    );
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::core::ingest::{RawLine, ingest_channel};

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fast_config(start_at_end: bool) -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
            read_chunk_bytes: 512,
            channel_capacity: 64,
            start_at_end,
        }
    }

    fn append(
        path: &Path,
        data: &str,
    ) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn recv_lines(
        rx: &mut mpsc::Receiver<RawLine>,
        count: usize,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        while lines.len() < count {
            match timeout(Duration::from_secs(3), rx.recv()).await {
                Ok(Some(raw)) => lines.push(raw.line),
                _ => break,
            }
        }
        lines
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<RawLine>) {
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "unexpected extra line: {extra:?}");
    }

    struct Harness {
        dir: PathBuf,
        path: PathBuf,
        rx: mpsc::Receiver<RawLine>,
        stats: Arc<ServiceStats>,
        shutdown: CancellationToken,
        join: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(
            prefix: &str,
            config: WatchConfig,
            existing: Option<&str>,
        ) -> Self {
            let dir = make_temp_dir(prefix);
            let path = dir.join("mainlog");
            if let Some(content) = existing {
                append(&path, content);
            }
            let (handle, rx) = ingest_channel(64);
            let stats = Arc::new(ServiceStats::new());
            let shutdown = CancellationToken::new();
            let join = tokio::spawn(run_file_watcher(
                WatchedFile { path: path.clone(), source: LogSource::Main },
                config,
                handle,
                stats.clone(),
                shutdown.clone(),
            ));
            Self { dir, path, rx, stats, shutdown, join }
        }

        async fn stop(self) {
            self.shutdown.cancel();
            let _ = timeout(Duration::from_secs(2), self.join).await;
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn emits_appended_lines_in_order() {
        let mut h = Harness::start("spoolwatch-tail", fast_config(true), Some("old line\n"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        append(&h.path, "first\nsecond\r\nthi");
        assert_eq!(recv_lines(&mut h.rx, 2).await, vec!["first", "second"]);

        append(&h.path, "rd\n");
        assert_eq!(recv_lines(&mut h.rx, 1).await, vec!["third"]);
        assert_quiet(&mut h.rx).await;

        let status = h.stats.snapshot();
        assert_eq!(status.watchers[0].state, WatcherState::Tailing);
        h.stop().await;
    }

    #[tokio::test]
    async fn rename_and_recreate_emits_every_line_once() {
        let mut h = Harness::start("spoolwatch-rotate", fast_config(false), Some("1\n2\n"));
        assert_eq!(recv_lines(&mut h.rx, 2).await, vec!["1", "2"]);

        let rotated = h.dir.join("mainlog.1");
        std::fs::rename(&h.path, &rotated).unwrap();
        append(&rotated, "3\n");
        append(&h.path, "4\n5\n");

        assert_eq!(recv_lines(&mut h.rx, 3).await, vec!["3", "4", "5"]);
        append(&h.path, "6\n");
        assert_eq!(recv_lines(&mut h.rx, 1).await, vec!["6"]);
        assert_quiet(&mut h.rx).await;

        assert_eq!(h.stats.snapshot().watchers[0].rotations, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn truncation_restarts_from_zero() {
        let mut h = Harness::start("spoolwatch-truncate", fast_config(false), Some("aaaa\nbbbb\n"));
        assert_eq!(recv_lines(&mut h.rx, 2).await, vec!["aaaa", "bbbb"]);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&h.path)
            .unwrap()
            .set_len(0)
            .unwrap();
        append(&h.path, "c\n");

        assert_eq!(recv_lines(&mut h.rx, 1).await, vec!["c"]);
        assert_quiet(&mut h.rx).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn missing_file_is_retried_and_read_from_start() {
        let mut h = Harness::start("spoolwatch-missing", fast_config(true), None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.stats.snapshot().watchers[0].state, WatcherState::Missing);

        append(&h.path, "late\n");
        assert_eq!(recv_lines(&mut h.rx, 1).await, vec!["late"]);
        assert_eq!(h.stats.snapshot().watchers[0].state, WatcherState::Tailing);
        h.stop().await;
    }

    #[tokio::test]
    async fn shutdown_marks_watcher_stopped() {
        let h = Harness::start("spoolwatch-stop", fast_config(true), Some(""));
        let stats = h.stats.clone();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.stop().await;
        assert_eq!(stats.snapshot().watchers[0].state, WatcherState::Stopped);
    }

    #[tokio::test]
    async fn missing_directory_keeps_wake_channel_open_and_retries_notify() {
        let dir = make_temp_dir("spoolwatch-nodir");
        let path = dir.join("later").join("mainlog");
        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let mut slot = NotifySlot::new(wake_tx, Duration::from_millis(20));

        slot.ensure(&path);
        assert!(!slot.is_active());
        assert!(matches!(
            wake_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        slot.ensure(&path);
        assert_eq!(slot.failures, 1);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        slot.ensure(&path);
        assert!(slot.is_active());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn tails_file_whose_directory_appears_later() {
        let dir = make_temp_dir("spoolwatch-latedir");
        let path = dir.join("exim").join("mainlog");
        let (handle, mut rx) = ingest_channel(64);
        let stats = Arc::new(ServiceStats::new());
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(run_file_watcher(
            WatchedFile { path: path.clone(), source: LogSource::Main },
            fast_config(false),
            handle,
            stats.clone(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.snapshot().watchers[0].state, WatcherState::Missing);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        append(&path, "arrived\n");
        assert_eq!(recv_lines(&mut rx, 1).await, vec!["arrived"]);

        shutdown.cancel();
        timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn take_line_strips_cr_and_counts_bad_utf8() {
        let stats = ServiceStats::new();
        let mut bytes = b"abc\r".to_vec();
        assert_eq!(take_line(&mut bytes, &stats), "abc");
        assert!(bytes.is_empty());
        assert_eq!(stats.snapshot().lossy_lines, 0);

        let mut bytes = vec![b'a', 0xff, b'b'];
        assert_eq!(take_line(&mut bytes, &stats), "a\u{fffd}b");
        assert_eq!(stats.snapshot().lossy_lines, 1);
    }

    #[tokio::test]
    async fn non_utf8_lines_are_delivered_and_counted() {
        let mut h = Harness::start("spoolwatch-latin1", fast_config(false), None);
        std::fs::write(&h.path, b"caf\xe9 ok\nplain\n").unwrap();

        assert_eq!(recv_lines(&mut h.rx, 2).await, vec!["caf\u{fffd} ok", "plain"]);
        assert_eq!(h.stats.snapshot().lossy_lines, 1);
        h.stop().await;
    }
}
