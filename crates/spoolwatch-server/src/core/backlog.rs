use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use spoolwatch_model::{EventKind, LogEvent, LogSource};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::bus::MessageBus;
use super::ingest::Ingestor;
use super::parser::LineParser;
use super::status::ServiceStats;
use super::store::Repository;
use super::watcher::take_line;
use crate::config::{BacklogConfig, IngestConfig};

/// Lines handed to a parser worker at a time.
const LINES_PER_UNIT: usize = 256;

struct WorkUnit {
    seq: u64,
    lines: Vec<String>,
}

struct ParsedUnit {
    seq: u64,
    events: Vec<LogEvent>,
}

struct ReadOutcome {
    lines: u64,
    cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct BacklogReport {
    pub run_id: Uuid,
    pub path: PathBuf,
    pub source: LogSource,
    pub lines_processed: u64,
    pub unknown_lines: u64,
    pub batches_dropped: u64,
    /// Shutdown stopped the run before end of file.
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Processes static log files to completion through the same parser and
/// batch writer as the live path. Parsing fans out to a worker pool; events
/// are put back in file order before batching, and inserts stay serialized.
///
/// Re-running over a file stores its events again; nothing is deduplicated.
pub struct BacklogProcessor<R, B> {
    parser: Arc<LineParser>,
    repo: Arc<R>,
    bus: Arc<B>,
    stats: Arc<ServiceStats>,
    ingest: IngestConfig,
    backlog: BacklogConfig,
}

impl<R: Repository, B: MessageBus> BacklogProcessor<R, B> {
    pub fn new(
        parser: Arc<LineParser>,
        repo: Arc<R>,
        bus: Arc<B>,
        stats: Arc<ServiceStats>,
        ingest: IngestConfig,
        backlog: BacklogConfig,
    ) -> Self {
        Self { parser, repo, bus, stats, ingest, backlog }
    }

    pub async fn process_file_backlog(
        &self,
        path: &Path,
        source: LogSource,
        shutdown: &CancellationToken,
    ) -> Result<BacklogReport> {
        let run_id = Uuid::now_v7();
        let started = Instant::now();
        let workers = self.backlog.workers.max(1);
        let queue_capacity =
            workers.saturating_mul(self.backlog.queue_per_worker).max(1);

        // Open here so a missing file fails before any task is spawned.
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open backlog file {}", path.display()))?;

        info!(
            "backlog started: run={}, path={}, source={}, workers={}",
            run_id,
            path.display(),
            source,
            workers
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkUnit>(queue_capacity);
        let (parsed_tx, mut parsed_rx) = mpsc::channel::<ParsedUnit>(queue_capacity);

        let reader = tokio::spawn(read_units(
            file,
            path.to_path_buf(),
            self.backlog.chunk_bytes,
            self.stats.clone(),
            work_tx,
            shutdown.clone(),
        ));

        let shared_rx = Arc::new(Mutex::new(work_rx));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let shared_rx = shared_rx.clone();
            let parsed_tx = parsed_tx.clone();
            let parser = self.parser.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = shared_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(unit) = next else {
                        break;
                    };

                    let events = unit
                        .lines
                        .iter()
                        .map(|line| parser.parse_line(line, source))
                        .collect();
                    if parsed_tx.send(ParsedUnit { seq: unit.seq, events }).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(parsed_tx);

        let mut ingestor = Ingestor::new(
            self.parser.clone(),
            self.repo.clone(),
            self.bus.clone(),
            self.stats.clone(),
            &self.ingest
        );
        let mut reorder: BTreeMap<u64, Vec<LogEvent>> = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut lines_processed = 0u64;
        let mut unknown_lines = 0u64;
        let mut batches_dropped = 0u64;

        while let Some(unit) = parsed_rx.recv().await {
            reorder.insert(unit.seq, unit.events);

            while let Some(events) = reorder.remove(&next_seq) {
                next_seq += 1;
                for event in events {
                    lines_processed += 1;
                    if event.kind == EventKind::Unknown {
                        unknown_lines += 1;
                    }
                    if ingestor.accept(event) && !ingestor.flush().await {
                        batches_dropped += 1;
                    }
                }
            }
        }

        if ingestor.pending() > 0 && !ingestor.flush().await {
            batches_dropped += 1;
        }

        for handle in handles {
            if let Err(err) = handle.await {
                warn!("backlog parser task join failed: run={}, error={}", run_id, err);
            }
        }

        let outcome = reader
            .await
            .map_err(|err| anyhow!("backlog reader task failed: {err}"))?
            .with_context(|| {
                format!(
                    "backlog aborted: path={}, lines_processed={}",
                    path.display(),
                    lines_processed
                )
            })?;

        if outcome.lines != lines_processed {
            warn!(
                "backlog line count mismatch: run={}, read={}, processed={}",
                run_id,
                outcome.lines,
                lines_processed
            );
        }

        let report = BacklogReport {
            run_id,
            path: path.to_path_buf(),
            source,
            lines_processed,
            unknown_lines,
            batches_dropped,
            cancelled: outcome.cancelled,
            elapsed: started.elapsed(),
        };

        info!(
            "backlog finished: run={}, path={}, lines={}, unknown={}, batches_dropped={}, cancelled={}, elapsed_ms={}",
            run_id,
            path.display(),
            report.lines_processed,
            report.unknown_lines,
            report.batches_dropped,
            report.cancelled,
            report.elapsed.as_millis()
        );
        Ok(report)
    }
}

/// Reads fixed-size chunks and cuts them into line units. A final line
/// without a newline is still emitted.
async fn read_units(
    mut file: File,
    path: PathBuf,
    chunk_bytes: usize,
    stats: Arc<ServiceStats>,
    work_tx: mpsc::Sender<WorkUnit>,
    shutdown: CancellationToken,
) -> Result<ReadOutcome> {
    let mut buf = vec![0u8; chunk_bytes.max(64)];
    let mut partial = Vec::new();
    let mut unit = Vec::with_capacity(LINES_PER_UNIT);
    let mut seq = 0u64;
    let mut lines = 0u64;

    loop {
        if shutdown.is_cancelled() {
            send_unit(&work_tx, &mut seq, &mut unit).await?;
            return Ok(ReadOutcome { lines, cancelled: true });
        }

        let read = file
            .read(&mut buf)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }

        let mut rest = &buf[..read];
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            unit.push(take_line(&mut partial, &stats));
            lines += 1;
            if unit.len() == LINES_PER_UNIT {
                send_unit(&work_tx, &mut seq, &mut unit).await?;
            }
        }
        partial.extend_from_slice(rest);
    }

    if !partial.is_empty() {
        unit.push(take_line(&mut partial, &stats));
        lines += 1;
    }
    send_unit(&work_tx, &mut seq, &mut unit).await?;

    Ok(ReadOutcome { lines, cancelled: false })
}

async fn send_unit(
    work_tx: &mpsc::Sender<WorkUnit>,
    seq: &mut u64,
    unit: &mut Vec<String>,
) -> Result<()> {
    if unit.is_empty() {
        return Ok(());
    }
    let lines = std::mem::replace(unit, Vec::with_capacity(LINES_PER_UNIT));
    work_tx
        .send(WorkUnit { seq: *seq, lines })
        .await
        .map_err(|_| anyhow!("backlog parser pool stopped"))?;
    *seq += 1;
    Ok(())
}
