use std::sync::Arc;

use anyhow::{Context, Result};
use spoolwatch_helpers::shutdown::with_deadline;
use spoolwatch_model::MessageId;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, LogFileConfig};
use crate::core::{
    BacklogProcessor, BroadcastBus, Database, Ingestor, LineParser,
    MessageBus, MessageView, QueueMediator, Repository, ServiceStats, ServiceStatus,
    TokioCommandRunner, WatchedFile, ingest_channel, run_file_watcher,
    run_ingest_worker, run_retention_loop, run_snapshot_sampler
};

pub type EximMediator = QueueMediator<Database, TokioCommandRunner, BroadcastBus>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub parser: Arc<LineParser>,
    pub bus: Arc<BroadcastBus>,
    pub stats: Arc<ServiceStats>,
    pub mediator: Arc<EximMediator>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Connects the store and builds the shared components. A database that
    /// cannot be reached here is fatal.
    pub async fn connect(config: Config) -> Result<Self> {
        let db = Arc::new(
            Database::connect(&config.database_url)
                .await
                .context("failed to connect database")?,
        );
        db.ensure_schema().await?;

        let parser = Arc::new(
            LineParser::compile().context("failed to compile log line patterns")?,
        );
        let bus = Arc::new(BroadcastBus::new(config.queue.bus_capacity));
        let runner = Arc::new(TokioCommandRunner::new(
            config.exim_binary.clone(),
            config.queue.command_timeout,
        ));
        let mediator = Arc::new(QueueMediator::new(
            db.clone(),
            runner,
            bus.clone(),
            config.queue.bulk_limit,
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            parser,
            bus,
            stats: Arc::new(ServiceStats::new()),
            mediator,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn backlog_processor(&self) -> BacklogProcessor<Database, BroadcastBus> {
        BacklogProcessor::new(
            self.parser.clone(),
            self.db.clone(),
            self.bus.clone(),
            self.stats.clone(),
            self.config.ingest.clone(),
            self.config.backlog.clone(),
        )
    }

    /// History plus the live spool entry. A failed queue listing degrades to
    /// history only.
    pub async fn message_view(
        &self,
        message_id: &MessageId,
    ) -> Result<MessageView> {
        let live = match self.mediator.list_queue().await {
            Ok(entries) => Some(entries),
            Err(err) => {
                warn!("queue listing unavailable: error={:#}", err);
                None
            }
        };
        MessageView::load(&*self.db, message_id, live.as_deref()).await
    }

    pub fn status(&self) -> ServiceStatus {
        self.stats.snapshot()
    }
}

/// Runs every worker until the shutdown token is cancelled, then waits for
/// the watchers and the final ingest flush.
pub async fn run(state: AppState) -> Result<()> {
    let config = state.config.clone();
    warn_if_privileged();
    state.bus.start();

    let (ingest, lines_rx) = ingest_channel(config.watch.channel_capacity);
    let ingestor = Ingestor::new(
        state.parser.clone(),
        state.db.clone(),
        state.bus.clone(),
        state.stats.clone(),
        &config.ingest,
    );
    let ingest_task = tokio::spawn(run_ingest_worker(
        ingestor,
        lines_rx,
        config.ingest.clone(),
        state.shutdown.clone(),
    ));

    let mut watchers = Vec::with_capacity(config.logs.len());
    for log in &config.logs {
        watchers.push(tokio::spawn(run_file_watcher(
            WatchedFile { path: log.path.clone(), source: log.source },
            config.watch.clone(),
            ingest.clone(),
            state.stats.clone(),
            state.shutdown.clone(),
        )));
    }
    drop(ingest);

    // Backlog files are stored alongside live tailing, not before it.
    let backlog_task = tokio::spawn(run_startup_backlog(
        state.backlog_processor(),
        config.backlog.startup_files.clone(),
        state.shutdown.clone(),
    ));

    let mut background = Vec::new();
    if let Some(every) = config.queue.snapshot_interval {
        background.push(tokio::spawn(run_snapshot_sampler(
            state.mediator.clone(),
            state.db.clone(),
            state.bus.clone(),
            every,
            state.shutdown.clone(),
        )));
    }
    background.push(tokio::spawn(run_retention_loop(
        state.db.clone(),
        config.retention.clone(),
        state.shutdown.clone(),
    )));

    info!(
        "server started: logs={}, exim_binary={}",
        config.logs.len(),
        config.exim_binary.display()
    );

    state.shutdown.cancelled().await;

    let backlog_abort = backlog_task.abort_handle();
    match with_deadline(config.ingest.shutdown_flush_timeout, backlog_task).await {
        Some(Ok(())) => {}
        Some(Err(err)) => warn!("startup backlog join failed: error={}", err),
        None => {
            warn!(
                "startup backlog did not stop in time, aborting: timeout_ms={}",
                config.ingest.shutdown_flush_timeout.as_millis()
            );
            backlog_abort.abort();
        }
    }

    for handle in watchers.into_iter().chain(background) {
        if let Err(err) = handle.await {
            warn!("worker task join failed: error={}", err);
        }
    }
    if let Err(err) = ingest_task.await {
        warn!("ingest worker join failed: error={}", err);
    }

    state.bus.stop();
    let status = state.status();
    info!(
        "server stopped: lines={}, events_stored={}, batches_dropped={}",
        status.lines_received,
        status.events_stored,
        status.batches_dropped
    );
    Ok(())
}

async fn run_startup_backlog<R: Repository, B: MessageBus>(
    processor: BacklogProcessor<R, B>,
    files: Vec<LogFileConfig>,
    shutdown: CancellationToken,
) {
    for file in &files {
        match processor
            .process_file_backlog(&file.path, file.source, &shutdown)
            .await
        {
            Ok(report) if report.cancelled => break,
            Ok(_) => {}
            Err(err) => error!(
                "startup backlog failed: path={}, error={:#}",
                file.path.display(),
                err
            ),
        }
    }
}

/// Privileges are not dropped at runtime; the supervisor is expected to start
/// the daemon as a dedicated account.
fn warn_if_privileged() {
    if let Some(0) = effective_uid() {
        warn!("running as root: start spoolwatch under a dedicated unprivileged account");
    }
}

#[cfg(target_os = "linux")]
fn effective_uid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_effective_uid(&status)
}

#[cfg(not(target_os = "linux"))]
fn effective_uid() -> Option<u32> {
    None
}

/// `Uid:` lists real, effective, saved and filesystem ids.
fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
