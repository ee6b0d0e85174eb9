use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use spoolwatch_model::{ActorContext, AuditAction, now_utc};
use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::audit::AuditRecorder;
use super::store::Repository;
use crate::config::RetentionConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub log_events: u64,
    pub attempts: u64,
    pub statuses: u64,
    pub audit: u64,
    pub snapshots: u64,
    /// Purges that failed; the others still ran.
    pub failures: u32,
}

fn cutoff_for(
    now: OffsetDateTime,
    age: Duration,
) -> Option<OffsetDateTime> {
    let age = time::Duration::try_from(age).ok()?;
    now.checked_sub(age)
}

/// One retention pass. Delivery attempts and cached status rows follow the
/// log event horizon. An audit purge is itself audited as `retention_purge`
/// by the system actor.
pub async fn purge_expired<R: Repository>(
    repo: &R,
    audit: &AuditRecorder<R>,
    config: &RetentionConfig,
    now: OffsetDateTime,
) -> PurgeReport {
    let mut report = PurgeReport::default();

    if let Some(cutoff) = config.log_events.and_then(|age| cutoff_for(now, age)) {
        match repo.purge_events_before(cutoff).await {
            Ok(count) => report.log_events = count,
            Err(err) => {
                report.failures += 1;
                warn!("log event purge failed: cutoff={}, error={:#}", cutoff, err);
            }
        }
        match repo.purge_attempts_before(cutoff).await {
            Ok(count) => report.attempts = count,
            Err(err) => {
                report.failures += 1;
                warn!("delivery attempt purge failed: cutoff={}, error={:#}", cutoff, err);
            }
        }
        match repo.purge_statuses_before(cutoff).await {
            Ok(count) => report.statuses = count,
            Err(err) => {
                report.failures += 1;
                warn!("message status purge failed: cutoff={}, error={:#}", cutoff, err);
            }
        }
    }

    if let Some(cutoff) = config.snapshots.and_then(|age| cutoff_for(now, age)) {
        match repo.purge_snapshots_before(cutoff).await {
            Ok(count) => report.snapshots = count,
            Err(err) => {
                report.failures += 1;
                warn!("snapshot purge failed: cutoff={}, error={:#}", cutoff, err);
            }
        }
    }

    if let Some(cutoff) = config.audit.and_then(|age| cutoff_for(now, age)) {
        let detail = match repo.purge_audit_before(cutoff).await {
            Ok(count) => {
                report.audit = count;
                json!({ "cutoff": cutoff.to_string(), "deleted": count, "result": "success" })
            }
            Err(err) => {
                report.failures += 1;
                warn!("audit purge failed: cutoff={}, error={:#}", cutoff, err);
                json!({ "cutoff": cutoff.to_string(), "result": "failed", "error": format!("{err:#}") })
            }
        };
        audit
            .record(AuditAction::RetentionPurge, None, &ActorContext::system(), detail)
            .await;
    }

    info!(
        "retention purge: log_events={}, attempts={}, statuses={}, snapshots={}, audit={}, failures={}",
        report.log_events,
        report.attempts,
        report.statuses,
        report.snapshots,
        report.audit,
        report.failures
    );
    report
}

pub async fn run_retention_loop<R: Repository>(
    repo: Arc<R>,
    config: RetentionConfig,
    shutdown: CancellationToken,
) {
    if !config.enabled() {
        info!("retention purge disabled");
        return;
    }

    let audit = AuditRecorder::new(repo.clone());
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("retention loop stopping");
                break;
            }
            _ = ticker.tick() => {
                purge_expired(&*repo, &audit, &config, now_utc()).await;
            }
        }
    }
}
