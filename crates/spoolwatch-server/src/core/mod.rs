mod audit;
mod backlog;
mod bus;
mod command;
mod correlate;
mod database;
mod ingest;
#[cfg(test)]
pub(crate) mod memory;
mod parser;
mod queue;
mod retention;
mod snapshot;
mod status;
mod store;
mod watcher;

pub use audit::AuditRecorder;
pub use backlog::{BacklogProcessor, BacklogReport};
pub use bus::{BroadcastBus, BusEvent, MessageBus};
pub use command::{
    CommandOutput, CommandRunner, EximCommand, TokioCommandRunner,
    classify_outcome, parse_queue_listing
};
pub use correlate::{
    MessageView, delivery_attempts_for, derive_status, is_thaw_notice,
    status_implied_by
};
pub use database::Database;
pub use ingest::{
    BatchWriter, IngestHandle, Ingestor, RawLine, ingest_channel,
    run_ingest_worker
};
pub use parser::LineParser;
pub use queue::QueueMediator;
pub use retention::{PurgeReport, purge_expired, run_retention_loop};
pub use snapshot::{run_snapshot_sampler, take_queue_snapshot};
pub use status::{
    LastError, ServiceStats, ServiceStatus, WatcherState, WatcherStatus
};
pub use store::{AuditQuery, EventQuery, Repository};
pub use watcher::{WatchedFile, run_file_watcher};
