use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use spoolwatch_model::{
    AuditLogEntry, DeliveryAttempt, LogEvent, MessageId, MessageStatus,
    MessageStatusRecord, NewAuditEntry, NewDeliveryAttempt, QueueSnapshot
};
use time::OffsetDateTime;

use super::store::{AuditQuery, EventQuery, Repository};

#[derive(Default)]
struct MemoryState {
    events: Vec<LogEvent>,
    statuses: Vec<MessageStatusRecord>,
    attempts: Vec<DeliveryAttempt>,
    audit: Vec<AuditLogEntry>,
    snapshots: Vec<QueueSnapshot>,
}

/// Test double for [`Repository`] with failure injection.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    failing_event_inserts: AtomicU32,
    rejected_raw_fragment: Mutex<Option<String>>,
    fail_audit: AtomicBool,
    attempt_delay_ms: AtomicU64,
    event_insert_calls: AtomicU32,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `insert_events` fail.
    pub fn fail_next_event_inserts(
        &self,
        count: u32,
    ) {
        self.failing_event_inserts.store(count, Ordering::SeqCst);
    }

    /// Makes every `insert_events` call fail while the slice holds an event
    /// whose raw line contains `fragment`, like a row the store rejects.
    pub fn reject_events_containing(
        &self,
        fragment: &str,
    ) {
        *self
            .rejected_raw_fragment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(fragment.to_string());
    }

    /// Stalls every `insert_delivery_attempt` call by `delay`.
    pub fn delay_attempt_inserts(
        &self,
        delay: Duration,
    ) {
        self.attempt_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_audit_failing(
        &self,
        failing: bool,
    ) {
        self.fail_audit.store(failing, Ordering::SeqCst);
    }

    pub fn event_insert_calls(&self) -> u32 {
        self.event_insert_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.lock().events.clone()
    }

    pub fn audit(&self) -> Vec<AuditLogEntry> {
        self.lock().audit.clone()
    }

    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.lock().attempts.clone()
    }

    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        self.lock().snapshots.clone()
    }

    pub fn status_of(
        &self,
        message_id: &MessageId,
    ) -> Option<MessageStatus> {
        self.lock()
            .statuses
            .iter()
            .find(|record| &record.message_id == message_id)
            .map(|record| record.status)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn upsert_status(
        state: &mut MemoryState,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) {
        match state
            .statuses
            .iter_mut()
            .find(|record| &record.message_id == message_id)
        {
            Some(record) => {
                record.status = status;
                record.updated_at = at;
            }
            None => state.statuses.push(MessageStatusRecord {
                message_id: message_id.clone(),
                status,
                updated_at: at,
            }),
        }
    }
}

impl Repository for MemoryRepository {
    async fn insert_events(
        &self,
        events: &[LogEvent],
    ) -> Result<u64> {
        self.event_insert_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_event_inserts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_event_inserts.store(failing - 1, Ordering::SeqCst);
            bail!("injected insert failure");
        }
        let rejected = self
            .rejected_raw_fragment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(fragment) = rejected {
            if events.iter().any(|event| event.raw_line.contains(&fragment)) {
                bail!("injected row rejection");
            }
        }
        self.lock().events.extend_from_slice(events);
        Ok(events.len() as u64)
    }

    async fn advance_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let mut state = self.lock();
        let current = state
            .statuses
            .iter()
            .find(|record| &record.message_id == message_id)
            .map(|record| record.status);
        if !status.advances(current) {
            return Ok(false);
        }
        Self::upsert_status(&mut state, message_id, status, at);
        Ok(true)
    }

    async fn thaw_message_status(
        &self,
        message_id: &MessageId,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state
            .statuses
            .iter_mut()
            .find(|record| &record.message_id == message_id)
        {
            Some(record) if record.status == MessageStatus::Frozen => {
                record.status = MessageStatus::Queued;
                record.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> Result<()> {
        Self::upsert_status(&mut self.lock(), message_id, status, at);
        Ok(())
    }

    async fn insert_delivery_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Result<DeliveryAttempt> {
        let delay = self.attempt_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut state = self.lock();
        let last = state
            .attempts
            .iter()
            .filter(|stored| {
                stored.message_id == attempt.message_id
                    && stored.recipient == attempt.recipient
            })
            .map(|stored| stored.sequence)
            .max()
            .unwrap_or(0);
        let stored = attempt.with_sequence(last + 1);
        state.attempts.push(stored.clone());
        Ok(stored)
    }

    async fn insert_audit_entry(
        &self,
        entry: NewAuditEntry,
    ) -> Result<AuditLogEntry> {
        if self.fail_audit.load(Ordering::SeqCst) {
            bail!("injected audit failure");
        }
        let mut state = self.lock();
        let stored = entry.stored(state.audit.len() as u64 + 1);
        state.audit.push(stored.clone());
        Ok(stored)
    }

    async fn insert_queue_snapshot(
        &self,
        snapshot: &QueueSnapshot,
    ) -> Result<()> {
        self.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn events_for_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<LogEvent>> {
        let mut events: Vec<LogEvent> = self
            .lock()
            .events
            .iter()
            .filter(|event| event.message_id.as_ref() == Some(message_id))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    async fn query_events(
        &self,
        query: &EventQuery,
    ) -> Result<Vec<LogEvent>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|event| query.matches(event))
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn delivery_attempts(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .lock()
            .attempts
            .iter()
            .filter(|attempt| &attempt.message_id == message_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| {
            a.recipient.cmp(&b.recipient).then(a.sequence.cmp(&b.sequence))
        });
        Ok(attempts)
    }

    async fn message_status(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<MessageStatusRecord>> {
        Ok(self
            .lock()
            .statuses
            .iter()
            .find(|record| &record.message_id == message_id)
            .cloned())
    }

    async fn audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .lock()
            .audit
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn queue_snapshots(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<QueueSnapshot>> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.taken_at >= since)
            .cloned()
            .collect())
    }

    async fn purge_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.events.len();
        state.events.retain(|event| event.timestamp >= cutoff);
        Ok((before - state.events.len()) as u64)
    }

    async fn purge_audit_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.audit.len();
        state.audit.retain(|entry| entry.created_at >= cutoff);
        Ok((before - state.audit.len()) as u64)
    }

    async fn purge_snapshots_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.snapshots.len();
        state.snapshots.retain(|snapshot| snapshot.taken_at >= cutoff);
        Ok((before - state.snapshots.len()) as u64)
    }

    async fn purge_attempts_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.attempts.len();
        state.attempts.retain(|attempt| attempt.attempted_at >= cutoff);
        Ok((before - state.attempts.len()) as u64)
    }

    async fn purge_statuses_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.statuses.len();
        state.statuses.retain(|record| record.updated_at >= cutoff);
        Ok((before - state.statuses.len()) as u64)
    }
}
