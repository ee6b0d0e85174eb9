use std::sync::Arc;

use serde_json::Value;
use spoolwatch_helpers::logging::AUDIT_TARGET;
use spoolwatch_model::{
    ActorContext, AuditAction, AuditLogEntry, MessageId, NewAuditEntry, now_utc
};
use tracing::{error, info};

use super::store::Repository;

/// Writes the administrative trail twice: one immutable store row and one
/// line on the `audit` tracing target. The log line is written first so it
/// survives a store outage.
pub struct AuditRecorder<R> {
    repo: Arc<R>,
}

impl<R> Clone for AuditRecorder<R> {
    fn clone(&self) -> Self {
        Self { repo: self.repo.clone() }
    }
}

impl<R: Repository> AuditRecorder<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Never fails. A store error is reported on the audit target and the
    /// stored row is `None`.
    pub async fn record(
        &self,
        action: AuditAction,
        message_id: Option<MessageId>,
        actor: &ActorContext,
        detail: Value,
    ) -> Option<AuditLogEntry> {
        let message = message_id.as_ref().map(MessageId::as_str).unwrap_or("-");
        let source = actor.source_address.as_deref().unwrap_or("-");

        info!(
            target: AUDIT_TARGET,
            "audit: action={}, actor={}, source={}, message_id={}, detail={}",
            action,
            actor.actor_id,
            source,
            message,
            detail
        );

        let entry = NewAuditEntry {
            created_at: now_utc(),
            action,
            message_id: message_id.clone(),
            actor_id: actor.actor_id.clone(),
            source_address: actor.source_address.clone(),
            detail,
        };

        match self.repo.insert_audit_entry(entry).await {
            Ok(stored) => Some(stored),
            Err(err) => {
                error!(
                    target: AUDIT_TARGET,
                    "audit store write failed: action={}, actor={}, message_id={}, error={:#}",
                    action,
                    actor.actor_id,
                    message,
                    err
                );
                None
            }
        }
    }
}
