use std::future::Future;

use anyhow::Result;
use spoolwatch_model::{
    AuditAction, AuditLogEntry, DeliveryAttempt, EventKind, LogEvent, LogSource,
    MessageId, MessageStatus, MessageStatusRecord, NewAuditEntry,
    NewDeliveryAttempt, QueueSnapshot
};
use time::OffsetDateTime;

const DEFAULT_QUERY_LIMIT: u32 = 500;
const MAX_QUERY_LIMIT: u32 = 10_000;

/// Filter for [`Repository::query_events`]. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub message_id: Option<MessageId>,
    pub source: Option<LogSource>,
    pub kind: Option<EventKind>,
    pub since: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub limit: Option<u32>,
}

impl EventQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(
        &self,
        event: &LogEvent,
    ) -> bool {
        self.message_id
            .as_ref()
            .is_none_or(|id| event.message_id.as_ref() == Some(id))
            && self.source.is_none_or(|source| event.source == source)
            && self.kind.is_none_or(|kind| event.kind == kind)
            && self.since.is_none_or(|since| event.timestamp >= since)
            && self.until.is_none_or(|until| event.timestamp < until)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub actor_id: Option<String>,
    pub message_id: Option<MessageId>,
    pub since: Option<OffsetDateTime>,
    pub limit: Option<u32>,
}

impl AuditQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(
        &self,
        entry: &AuditLogEntry,
    ) -> bool {
        self.action.is_none_or(|action| entry.action == action)
            && self
                .actor_id
                .as_deref()
                .is_none_or(|actor| entry.actor_id == actor)
            && self
                .message_id
                .as_ref()
                .is_none_or(|id| entry.message_id.as_ref() == Some(id))
            && self.since.is_none_or(|since| entry.created_at >= since)
    }
}

/// Persistence seam for every component. All rows are append-only except the
/// message status cache; removal happens only through the `purge_*` methods.
pub trait Repository: Send + Sync + 'static {
    /// Inserts the whole batch in one transaction, preserving slice order.
    fn insert_events(
        &self,
        events: &[LogEvent],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Forward-only status update. Returns `true` when the cached status
    /// changed, `false` when `status` does not outrank the stored one.
    fn advance_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Moves a `frozen` message back to `queued`. Returns `false` when the
    /// cached status is anything other than `frozen`.
    fn thaw_message_status(
        &self,
        message_id: &MessageId,
        at: OffsetDateTime,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Corrective status write that ignores the forward-only order.
    fn set_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stores the attempt with the next sequence number for its
    /// `(message_id, recipient)` pair.
    fn insert_delivery_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> impl Future<Output = Result<DeliveryAttempt>> + Send;

    fn insert_audit_entry(
        &self,
        entry: NewAuditEntry,
    ) -> impl Future<Output = Result<AuditLogEntry>> + Send;

    fn insert_queue_snapshot(
        &self,
        snapshot: &QueueSnapshot,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Events for one message ordered by timestamp, then insertion order.
    fn events_for_message(
        &self,
        message_id: &MessageId,
    ) -> impl Future<Output = Result<Vec<LogEvent>>> + Send;

    fn query_events(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Vec<LogEvent>>> + Send;

    /// Attempts for one message ordered by recipient, then sequence.
    fn delivery_attempts(
        &self,
        message_id: &MessageId,
    ) -> impl Future<Output = Result<Vec<DeliveryAttempt>>> + Send;

    fn message_status(
        &self,
        message_id: &MessageId,
    ) -> impl Future<Output = Result<Option<MessageStatusRecord>>> + Send;

    /// Newest first.
    fn audit_entries(
        &self,
        query: &AuditQuery,
    ) -> impl Future<Output = Result<Vec<AuditLogEntry>>> + Send;

    fn queue_snapshots(
        &self,
        since: OffsetDateTime,
    ) -> impl Future<Output = Result<Vec<QueueSnapshot>>> + Send;

    fn purge_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn purge_audit_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn purge_snapshots_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn purge_attempts_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Drops cached status rows last touched before `cutoff`.
    fn purge_statuses_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64>> + Send;
}
