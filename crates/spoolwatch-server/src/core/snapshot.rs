use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use spoolwatch_model::{QueueSnapshot, now_utc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{BusEvent, MessageBus};
use super::command::CommandRunner;
use super::queue::QueueMediator;
use super::store::Repository;

/// Lists the queue once and stores the rollup.
pub async fn take_queue_snapshot<R: Repository, C: CommandRunner, B: MessageBus>(
    mediator: &QueueMediator<R, C, B>,
    repo: &R,
    bus: &B,
) -> Result<QueueSnapshot> {
    let entries = mediator.list_queue().await?;
    let snapshot = QueueSnapshot::from_entries(now_utc(), &entries);
    repo.insert_queue_snapshot(&snapshot)
        .await
        .context("failed to store queue snapshot")?;

    debug!(
        "queue snapshot: total={}, deferred={}, frozen={}, oldest_age_secs={:?}",
        snapshot.total,
        snapshot.deferred,
        snapshot.frozen,
        snapshot.oldest_age_secs
    );
    bus.publish(BusEvent::SnapshotTaken { snapshot: snapshot.clone() });
    Ok(snapshot)
}

pub async fn run_snapshot_sampler<R: Repository, C: CommandRunner, B: MessageBus>(
    mediator: Arc<QueueMediator<R, C, B>>,
    repo: Arc<R>,
    bus: Arc<B>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("queue snapshot sampler started: interval_secs={}", every.as_secs());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("queue snapshot sampler stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = take_queue_snapshot(&*mediator, &*repo, &*bus).await {
                    warn!("queue snapshot failed: error={:#}", err);
                }
            }
        }
    }
}
