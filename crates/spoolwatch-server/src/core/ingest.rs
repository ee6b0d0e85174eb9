use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use spoolwatch_helpers::shutdown::with_deadline;
use spoolwatch_model::{EventKind, LogEvent, LogSource};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::bus::{BusEvent, MessageBus};
use super::correlate::{delivery_attempts_for, is_thaw_notice, status_implied_by};
use super::parser::LineParser;
use super::status::ServiceStats;
use super::store::Repository;
use crate::config::IngestConfig;

/// One line as read from a watched file, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub source: LogSource,
    pub line: String,
}

/// Sending side of the watcher-to-ingestion channel.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<RawLine>,
}

impl IngestHandle {
    /// Queues one line. Waits while the channel is full, which is how a slow
    /// store pushes back on the watchers.
    pub async fn ingest(
        &self,
        raw_line: impl Into<String>,
        source: LogSource,
    ) -> Result<()> {
        self.tx
            .send(RawLine { source, line: raw_line.into() })
            .await
            .map_err(|_| anyhow!("ingest worker stopped"))
    }
}

pub fn ingest_channel(capacity: usize) -> (IngestHandle, mpsc::Receiver<RawLine>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestHandle { tx }, rx)
}

/// Accumulates parsed events and writes them as one transactional insert,
/// then applies the per-event derived effects.
///
/// A batch the store keeps refusing is split into single-row inserts, so one
/// row the store rejects costs only that row.
pub struct BatchWriter<R, B> {
    repo: Arc<R>,
    bus: Arc<B>,
    stats: Arc<ServiceStats>,
    batch: Vec<LogEvent>,
    batch_size: usize,
    retry_attempts: usize,
    retry_backoff: Duration,
    // Taken from the batch but neither stored nor counted as dropped yet.
    unwritten: usize,
}

impl<R: Repository, B: MessageBus> BatchWriter<R, B> {
    pub fn new(
        repo: Arc<R>,
        bus: Arc<B>,
        stats: Arc<ServiceStats>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            repo,
            bus,
            stats,
            batch: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: config.retry_backoff,
            unwritten: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Events of the last flush whose insert had not finished when that flush
    /// was abandoned.
    pub fn unwritten(&self) -> usize {
        self.unwritten
    }

    /// Appends an event; returns `true` once the size threshold is reached.
    pub fn push(
        &mut self,
        event: LogEvent,
    ) -> bool {
        self.batch.push(event);
        self.batch.len() >= self.batch_size
    }

    /// Writes the pending batch. Returns `false` when any event was dropped.
    pub async fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }

        let events = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.batch_size),
        );
        self.unwritten = events.len();

        let (stored, dropped) = match self.insert_with_retry(&events).await {
            Ok(_) => (events, 0),
            Err(err) => {
                warn!(
                    "batch insert exhausted retries, inserting rows one by one: events={}, error={:#}",
                    events.len(),
                    err
                );
                self.insert_rows(events).await
            }
        };
        self.unwritten = 0;

        if dropped > 0 {
            self.stats.record_batch_dropped(dropped as u64);
        }
        if stored.is_empty() {
            return false;
        }

        self.stats.record_batch_stored(stored.len() as u64);
        self.apply_derived_effects(&stored).await;
        let unknown = stored
            .iter()
            .filter(|event| event.kind == EventKind::Unknown)
            .count();
        self.bus.publish(BusEvent::BatchStored {
            events: stored.len(),
            unknown,
        });
        debug!(
            "batch flushed: events={}, unknown={}, dropped={}",
            stored.len(),
            unknown,
            dropped
        );
        dropped == 0
    }

    async fn insert_with_retry(
        &self,
        events: &[LogEvent],
    ) -> Result<u64> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=self.retry_attempts {
            match self.repo.insert_events(events).await {
                Ok(stored) => return Ok(stored),
                Err(err) => {
                    warn!(
                        "batch insert failed: attempt={}, events={}, error={:#}",
                        attempt,
                        events.len(),
                        err
                    );
                    last_error = Some(err);
                    if attempt < self.retry_attempts {
                        sleep(self.retry_backoff * attempt as u32).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("batch insert failed")))
    }

    /// One insert per event, no retries. Returns the stored events in order
    /// and the number dropped.
    async fn insert_rows(
        &mut self,
        events: Vec<LogEvent>,
    ) -> (Vec<LogEvent>, usize) {
        let mut stored = Vec::with_capacity(events.len());
        let mut dropped = 0usize;

        for event in events {
            match self.repo.insert_events(std::slice::from_ref(&event)).await {
                Ok(_) => stored.push(event),
                Err(err) => {
                    error!(
                        "event dropped: source={}, line={}, error={:#}",
                        event.source,
                        event.raw_line,
                        err
                    );
                    self.stats.record_error("event insert", format!("{err:#}"));
                    dropped += 1;
                }
            }
            self.unwritten = self.unwritten.saturating_sub(1);
        }

        (stored, dropped)
    }

    async fn apply_derived_effects(
        &self,
        events: &[LogEvent],
    ) {
        for event in events {
            let Some(message_id) = event.message_id.as_ref() else {
                continue;
            };

            for attempt in delivery_attempts_for(event) {
                let recipient = attempt.recipient.clone();
                match self.repo.insert_delivery_attempt(attempt).await {
                    Ok(_) => self.stats.record_attempt(),
                    Err(err) => {
                        warn!(
                            "delivery attempt insert failed: message_id={}, recipient={}, error={:#}",
                            message_id,
                            recipient.as_deref().unwrap_or("-"),
                            err
                        );
                        self.stats.record_error("delivery attempt insert", format!("{err:#}"));
                    }
                }
            }

            let Some(status) = status_implied_by(event) else {
                continue;
            };
            let changed = if is_thaw_notice(event) {
                self.repo.thaw_message_status(message_id, event.timestamp).await
            } else {
                self.repo
                    .advance_message_status(message_id, status, event.timestamp)
                    .await
            };
            match changed {
                Ok(true) => {
                    self.stats.record_status_advance();
                    self.bus.publish(BusEvent::StatusAdvanced {
                        message_id: message_id.clone(),
                        status,
                    });
                }
                Ok(false) => {
                    trace!(
                        "status not advanced: message_id={}, candidate={}",
                        message_id,
                        status
                    );
                }
                Err(err) => {
                    warn!(
                        "status update failed: message_id={}, status={}, error={:#}",
                        message_id,
                        status,
                        err
                    );
                    self.stats.record_error("status update", format!("{err:#}"));
                }
            }
        }
    }
}

/// Counts unknown lines per window and reports once per window when the
/// count crosses the threshold.
struct UnknownRate {
    threshold: u64,
    window: Duration,
    window_start: Instant,
    count: u64,
}

impl UnknownRate {
    fn new(
        threshold: u64,
        window: Duration,
    ) -> Self {
        Self { threshold, window, window_start: Instant::now(), count: 0 }
    }

    fn observe(
        &mut self,
        now: Instant,
    ) -> Option<u64> {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        (self.count == self.threshold).then_some(self.count)
    }
}

/// Parser plus batch writer; shared by the live path and backlog processing.
pub struct Ingestor<R, B> {
    parser: Arc<LineParser>,
    writer: BatchWriter<R, B>,
    stats: Arc<ServiceStats>,
    unknown: UnknownRate,
    unknown_window: Duration,
}

impl<R: Repository, B: MessageBus> Ingestor<R, B> {
    pub fn new(
        parser: Arc<LineParser>,
        repo: Arc<R>,
        bus: Arc<B>,
        stats: Arc<ServiceStats>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            parser,
            writer: BatchWriter::new(repo, bus, stats.clone(), config),
            stats,
            unknown: UnknownRate::new(
                config.unknown_warn_threshold,
                config.unknown_warn_window
            ),
            unknown_window: config.unknown_warn_window,
        }
    }

    /// Parses and buffers one line; returns `true` when a flush is due.
    pub fn ingest_line(
        &mut self,
        raw_line: &str,
        source: LogSource,
    ) -> bool {
        let event = self.parser.parse_line(raw_line, source);
        self.accept(event)
    }

    /// Buffers an already parsed event; returns `true` when a flush is due.
    pub fn accept(
        &mut self,
        event: LogEvent,
    ) -> bool {
        self.stats.record_line();
        if event.kind == EventKind::Unknown {
            self.stats.record_unknown();
            trace!(
                "unparsed line: source={}, line={}",
                event.source,
                event.raw_line
            );
            if let Some(count) = self.unknown.observe(Instant::now()) {
                warn!(
                    "unknown line rate above threshold: count={}, window_secs={}, source={}, sample={}",
                    count,
                    self.unknown_window.as_secs(),
                    event.source,
                    event.raw_line
                );
            }
        }
        self.writer.push(event)
    }

    pub async fn flush(&mut self) -> bool {
        self.writer.flush().await
    }

    pub fn pending(&self) -> usize {
        self.writer.len()
    }

    /// Flushes within `deadline`. Events whose insert had not finished by then
    /// are counted as dropped; derived effects cut short are only logged.
    pub async fn flush_before(
        &mut self,
        deadline: Duration,
    ) {
        if self.writer.is_empty() {
            return;
        }
        let pending = self.writer.len();
        if with_deadline(deadline, self.writer.flush()).await.is_some() {
            return;
        }

        let lost = self.writer.unwritten();
        warn!(
            "final flush timed out: events={}, unwritten={}, timeout_ms={}",
            pending,
            lost,
            deadline.as_millis()
        );
        if lost > 0 {
            self.stats.record_batch_dropped(lost as u64);
            self.stats.record_error("shutdown flush", "timed out");
        }
    }
}

/// Live ingestion worker: drains the watcher channel, flushing on size or on
/// the flush interval, whichever comes first.
pub async fn run_ingest_worker<R: Repository, B: MessageBus>(
    mut ingestor: Ingestor<R, B>,
    mut lines_rx: mpsc::Receiver<RawLine>,
    config: IngestConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "ingest worker started: batch_size={}, flush_interval_ms={}",
        config.batch_size,
        config.flush_interval.as_millis()
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                break;
            }
            maybe_line = lines_rx.recv() => {
                let Some(raw) = maybe_line else {
                    break;
                };
                if ingestor.ingest_line(&raw.line, raw.source) {
                    ingestor.flush().await;
                }
            }
            _ = ticker.tick() => {
                if ingestor.pending() > 0 {
                    ingestor.flush().await;
                }
            }
        }
    }

    // Drained lines still flush in batch_size chunks, all within one deadline.
    let deadline = Instant::now() + config.shutdown_flush_timeout;
    lines_rx.close();
    let mut drained = 0usize;
    while let Ok(raw) = lines_rx.try_recv() {
        drained += 1;
        if ingestor.ingest_line(&raw.line, raw.source) {
            ingestor
                .flush_before(deadline.saturating_duration_since(Instant::now()))
                .await;
        }
    }

    info!(
        "ingest worker stopping: pending={}, drained={}",
        ingestor.pending(),
        drained
    );
    ingestor
        .flush_before(deadline.saturating_duration_since(Instant::now()))
        .await;
}

#[cfg(test)]
mod tests {
    use spoolwatch_model::{AttemptOutcome, MessageId, MessageStatus};
    use tokio::time::timeout;

    use super::*;
    use crate::core::bus::BroadcastBus;
    use crate::core::memory::MemoryRepository;

    const ID: &str = "1a2b3c-4d5e6f-7g";

    fn test_config(batch_size: usize) -> IngestConfig {
        IngestConfig {
            batch_size,
            flush_interval: Duration::from_secs(3600),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            shutdown_flush_timeout: Duration::from_secs(2),
            unknown_warn_threshold: 2,
            unknown_warn_window: Duration::from_secs(60),
        }
    }

    fn ingestor(
        repo: &Arc<MemoryRepository>,
        stats: &Arc<ServiceStats>,
        config: &IngestConfig,
    ) -> Ingestor<MemoryRepository, BroadcastBus> {
        let bus = Arc::new(BroadcastBus::new(64));
        bus.start();
        Ingestor::new(
            Arc::new(LineParser::compile().unwrap()),
            repo.clone(),
            bus,
            stats.clone(),
            config,
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        timeout(Duration::from_secs(3), async {
            while !check() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    fn spawn_worker(
        repo: &Arc<MemoryRepository>,
        stats: &Arc<ServiceStats>,
        config: IngestConfig,
    ) -> (IngestHandle, CancellationToken, tokio::task::JoinHandle<()>) {
        let (handle, rx) = ingest_channel(16);
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(run_ingest_worker(
            ingestor(repo, stats, &config),
            rx,
            config,
            shutdown.clone(),
        ));
        (handle, shutdown, join)
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full_and_keeps_order() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let (handle, shutdown, join) = spawn_worker(&repo, &stats, test_config(3));

        for n in 0..3 {
            handle
                .ingest(format!("2024-01-01 12:00:0{n} line {n}"), LogSource::Main)
                .await
                .unwrap();
        }

        assert!(wait_until(|| repo.events().len() == 3).await);
        let lines: Vec<String> =
            repo.events().into_iter().map(|event| event.raw_line).collect();
        assert_eq!(lines, vec![
            "2024-01-01 12:00:00 line 0",
            "2024-01-01 12:00:01 line 1",
            "2024-01-01 12:00:02 line 2",
        ]);
        assert_eq!(stats.snapshot().unknown_lines, 3);

        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn flushes_on_interval() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut config = test_config(100);
        config.flush_interval = Duration::from_millis(30);
        let (handle, shutdown, join) = spawn_worker(&repo, &stats, config);

        handle
            .ingest(
                format!("2024-01-01 12:00:00 {ID} <= a@example.org S=10"),
                LogSource::Main,
            )
            .await
            .unwrap();

        assert!(wait_until(|| repo.events().len() == 1).await);
        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_partial_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let (handle, shutdown, join) = spawn_worker(&repo, &stats, test_config(100));

        handle.ingest("2024-01-01 12:00:00 a", LogSource::Panic).await.unwrap();
        handle.ingest("2024-01-01 12:00:01 b", LogSource::Panic).await.unwrap();
        assert!(wait_until(|| stats.snapshot().lines_received == 2).await);

        shutdown.cancel();
        timeout(Duration::from_secs(3), join).await.unwrap().unwrap();
        assert_eq!(repo.events().len(), 2);
        assert_eq!(stats.snapshot().batches_flushed, 1);
    }

    #[tokio::test]
    async fn retries_then_stores() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(10));
        repo.fail_next_event_inserts(2);

        ingestor.ingest_line("2024-01-01 12:00:00 x", LogSource::Main);
        assert!(ingestor.flush().await);
        assert_eq!(repo.event_insert_calls(), 3);
        assert_eq!(repo.events().len(), 1);
    }

    #[tokio::test]
    async fn drops_batch_after_retry_budget_and_continues() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(10));
        // Three batch attempts, then the single-row fallback.
        repo.fail_next_event_inserts(4);

        ingestor.ingest_line("2024-01-01 12:00:00 lost", LogSource::Main);
        assert!(!ingestor.flush().await);
        assert_eq!(ingestor.pending(), 0);

        ingestor.ingest_line("2024-01-01 12:00:01 kept", LogSource::Main);
        assert!(ingestor.flush().await);

        let status = stats.snapshot();
        assert_eq!(status.batches_dropped, 1);
        assert_eq!(status.events_dropped, 1);
        assert_eq!(status.batches_flushed, 1);
        assert!(status.last_error.is_some());
        assert_eq!(repo.events()[0].raw_line, "2024-01-01 12:00:01 kept");
    }

    #[tokio::test]
    async fn rejected_row_costs_only_itself() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(10));
        repo.reject_events_containing("too-long");

        for line in [
            format!("2024-01-01 12:00:00 {ID} <= alice@example.org S=100"),
            "2024-01-01 12:00:01 too-long".to_string(),
            format!("2024-01-01 12:00:02 {ID} => bob@example.net R=r T=t"),
        ] {
            ingestor.ingest_line(&line, LogSource::Main);
        }
        assert!(!ingestor.flush().await);

        let lines: Vec<String> =
            repo.events().into_iter().map(|event| event.raw_line).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("<= alice@example.org"));
        assert!(lines[1].contains("=> bob@example.net"));
        assert_eq!(
            repo.status_of(&MessageId::parse(ID).unwrap()),
            Some(MessageStatus::Delivered)
        );

        let status = stats.snapshot();
        assert_eq!(status.events_stored, 2);
        assert_eq!(status.events_dropped, 1);
        assert_eq!(status.batches_dropped, 1);
    }

    #[tokio::test]
    async fn thaw_lines_correct_frozen_status() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(100));
        let id = MessageId::parse(ID).unwrap();

        for line in [
            format!("2024-01-01 12:00:00 {ID} <= alice@example.org S=100"),
            format!("2024-01-01 12:01:00 {ID} Message is frozen"),
        ] {
            ingestor.ingest_line(&line, LogSource::Main);
        }
        assert!(ingestor.flush().await);
        assert_eq!(repo.status_of(&id), Some(MessageStatus::Frozen));

        ingestor.ingest_line(
            &format!("2024-01-01 12:02:00 {ID} unfrozen by root"),
            LogSource::Main,
        );
        assert!(ingestor.flush().await);
        assert_eq!(repo.status_of(&id), Some(MessageStatus::Queued));
        assert!(repo.attempts().is_empty());

        ingestor.ingest_line(
            &format!("2024-01-01 12:03:00 {ID} unfrozen by root"),
            LogSource::Main,
        );
        ingestor.ingest_line(
            &format!("2024-01-01 12:04:00 {ID} => bob@example.net R=r T=t C=\"250 OK\""),
            LogSource::Main,
        );
        assert!(ingestor.flush().await);
        assert_eq!(repo.status_of(&id), Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn delivery_supersedes_frozen() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(100));

        for line in [
            format!("2024-01-01 12:01:00 {ID} frozen by root"),
            format!("2024-01-01 12:02:00 {ID} => bob@example.net R=r T=t C=\"250 OK\""),
            format!("2024-01-01 12:02:00 {ID} Completed"),
        ] {
            ingestor.ingest_line(&line, LogSource::Main);
        }
        assert!(ingestor.flush().await);
        assert_eq!(
            repo.status_of(&MessageId::parse(ID).unwrap()),
            Some(MessageStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn shutdown_drain_flushes_in_batch_sized_chunks() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let config = test_config(2);
        let (handle, rx) = ingest_channel(16);
        for n in 0..5 {
            handle
                .ingest(format!("2024-01-01 12:00:0{n} line {n}"), LogSource::Main)
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let worker = ingestor(&repo, &stats, &config);
        timeout(
            Duration::from_secs(3),
            run_ingest_worker(worker, rx, config, shutdown),
        )
        .await
        .unwrap();

        assert_eq!(repo.events().len(), 5);
        assert_eq!(repo.event_insert_calls(), 3);
        assert_eq!(stats.snapshot().batches_flushed, 3);
    }

    #[tokio::test]
    async fn slow_derived_effects_do_not_count_stored_events_as_dropped() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(100));
        repo.delay_attempt_inserts(Duration::from_secs(5));

        ingestor.ingest_line(
            &format!("2024-01-01 12:00:00 {ID} => bob@example.net R=r T=t"),
            LogSource::Main,
        );
        ingestor.flush_before(Duration::from_millis(100)).await;

        let status = stats.snapshot();
        assert_eq!(repo.events().len(), 1);
        assert_eq!(status.events_stored, 1);
        assert_eq!(status.events_dropped, 0);
        assert_eq!(ingestor.pending(), 0);
    }

    #[tokio::test]
    async fn derives_attempts_and_forward_only_status() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(ServiceStats::new());
        let mut ingestor = ingestor(&repo, &stats, &test_config(100));

        for line in [
            format!("2024-01-01 12:01:00 {ID} == bob@example.net R=dnslookup T=remote_smtp defer (-53): retry time not reached"),
            format!("2024-01-01 12:02:00 {ID} == bob@example.net R=dnslookup T=remote_smtp defer (110): Connection timed out"),
            format!("2024-01-01 12:03:00 {ID} => bob@example.net R=dnslookup T=remote_smtp H=mx.example.net [192.0.2.1] C=\"250 OK\""),
            format!("2024-01-01 12:00:00 {ID} <= alice@example.org H=localhost [127.0.0.1] P=esmtp S=100"),
        ] {
            ingestor.ingest_line(&line, LogSource::Main);
        }
        assert!(ingestor.flush().await);

        let id = MessageId::parse(ID).unwrap();
        let attempts = repo.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(attempts[1].outcome, AttemptOutcome::Timeout);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
        assert_eq!(repo.status_of(&id), Some(MessageStatus::Delivered));
        assert_eq!(stats.snapshot().attempts_recorded, 3);
    }

    #[test]
    fn unknown_rate_reports_once_per_window() {
        let mut rate = UnknownRate::new(3, Duration::from_secs(60));
        let start = rate.window_start;
        assert_eq!(rate.observe(start), None);
        assert_eq!(rate.observe(start), None);
        assert_eq!(rate.observe(start), Some(3));
        assert_eq!(rate.observe(start), None);
        assert_eq!(rate.observe(start + Duration::from_secs(61)), None);
    }
}
