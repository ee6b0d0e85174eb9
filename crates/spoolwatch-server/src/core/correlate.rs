use anyhow::Result;
use serde::Serialize;
use spoolwatch_model::{
    AttemptOutcome, DeliveryAttempt, EventKind, LogEvent, MessageId,
    MessageStatus, MessageStatusRecord, NewDeliveryAttempt, QueueEntry
};

use super::store::Repository;

const FROZEN_STATUS_LABEL: &str = "frozen";
const UNFROZEN_STATUS_LABEL: &str = "unfrozen";

/// Status a single event implies for its message, if any.
///
/// `Completed` maps to delivered, which a bounce outranks, so a message with
/// a bounced recipient keeps `bounced`. An `unfrozen` notice implies `queued`
/// and is applied as a correction rather than a forward step.
pub fn status_implied_by(event: &LogEvent) -> Option<MessageStatus> {
    match event.kind {
        EventKind::Arrival => Some(MessageStatus::Received),
        EventKind::Deferral if is_frozen_notice(event) => {
            Some(MessageStatus::Frozen)
        }
        EventKind::Deferral if is_thaw_notice(event) => {
            Some(MessageStatus::Queued)
        }
        EventKind::Deferral => Some(MessageStatus::Deferred),
        EventKind::Delivery | EventKind::Completion => {
            Some(MessageStatus::Delivered)
        }
        EventKind::Bounce => Some(MessageStatus::Bounced),
        EventKind::Rejection | EventKind::Panic | EventKind::Unknown => None,
    }
}

/// Folds an event history into the highest-ranked status it implies.
///
/// Ranks form a total order, so the result does not depend on input order.
/// Frozen notices at or before the latest `unfrozen` notice are ignored.
pub fn derive_status<'a, I>(events: I) -> Option<MessageStatus>
where
    I: IntoIterator<Item = &'a LogEvent>,
{
    let events: Vec<&LogEvent> = events.into_iter().collect();
    let last_thaw = events
        .iter()
        .filter(|event| is_thaw_notice(event))
        .map(|event| event.timestamp)
        .max();

    events
        .into_iter()
        .filter(|event| {
            !(is_frozen_notice(event)
                && last_thaw.is_some_and(|thaw| event.timestamp <= thaw))
        })
        .filter_map(status_implied_by)
        .max_by_key(MessageStatus::rank)
}

/// One pending attempt per recipient for delivery-class events that carry a
/// message id. Freeze and thaw notices are not attempts.
pub fn delivery_attempts_for(event: &LogEvent) -> Vec<NewDeliveryAttempt> {
    let Some(message_id) = event.message_id.as_ref() else {
        return Vec::new();
    };
    if !event.kind.is_delivery_class()
        || is_frozen_notice(event)
        || is_thaw_notice(event)
    {
        return Vec::new();
    }

    let outcome = attempt_outcome(event);
    let response_text = match event.kind {
        EventKind::Delivery => {
            event.confirmation.clone().or_else(|| event.error_text.clone())
        }
        _ => event.error_text.clone(),
    };

    let recipients: Vec<Option<String>> = match event.recipients.as_deref() {
        Some(list) if !list.is_empty() => list.iter().cloned().map(Some).collect(),
        _ => vec![None],
    };

    recipients
        .into_iter()
        .map(|recipient| NewDeliveryAttempt {
            message_id: message_id.clone(),
            recipient,
            attempted_at: event.timestamp,
            host: event.host.clone(),
            host_address: event.host_address.clone(),
            response_code: event.error_code.clone(),
            response_text: response_text.clone(),
            outcome,
        })
        .collect()
}

fn attempt_outcome(event: &LogEvent) -> AttemptOutcome {
    match event.kind {
        EventKind::Delivery => AttemptOutcome::Success,
        EventKind::Bounce => AttemptOutcome::Bounce,
        _ if mentions_timeout(event.error_text.as_deref()) => {
            AttemptOutcome::Timeout
        }
        _ => AttemptOutcome::Defer,
    }
}

fn mentions_timeout(text: Option<&str>) -> bool {
    text.is_some_and(|text| {
        let lower = text.to_ascii_lowercase();
        lower.contains("timed out") || lower.contains("timeout")
    })
}

fn is_frozen_notice(event: &LogEvent) -> bool {
    event.status.as_deref() == Some(FROZEN_STATUS_LABEL)
}

pub fn is_thaw_notice(event: &LogEvent) -> bool {
    event.kind == EventKind::Deferral
        && event.status.as_deref() == Some(UNFROZEN_STATUS_LABEL)
}

/// Everything known about one message: stored history, the cached status
/// column, the status the history implies and the live spool entry if the
/// message is still queued.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub message_id: MessageId,
    pub events: Vec<LogEvent>,
    pub attempts: Vec<DeliveryAttempt>,
    pub cached_status: Option<MessageStatusRecord>,
    pub derived_status: Option<MessageStatus>,
    pub queue_entry: Option<QueueEntry>,
}

impl MessageView {
    pub async fn load<R: Repository>(
        repo: &R,
        message_id: &MessageId,
        live_queue: Option<&[QueueEntry]>,
    ) -> Result<Self> {
        let events = repo.events_for_message(message_id).await?;
        let attempts = repo.delivery_attempts(message_id).await?;
        let cached_status = repo.message_status(message_id).await?;
        let derived_status = derive_status(&events);
        let queue_entry = live_queue.and_then(|entries| {
            entries.iter().find(|entry| &entry.message_id == message_id).cloned()
        });

        Ok(Self {
            message_id: message_id.clone(),
            events,
            attempts,
            cached_status,
            derived_status,
            queue_entry,
        })
    }

    /// Spool state wins for messages still queued; history otherwise.
    pub fn current_status(&self) -> Option<MessageStatus> {
        match &self.queue_entry {
            Some(entry) if entry.frozen => Some(MessageStatus::Frozen),
            Some(_) => Some(
                self.derived_status
                    .filter(|status| {
                        !status.is_terminal() && *status != MessageStatus::Frozen
                    })
                    .unwrap_or(MessageStatus::Queued),
            ),
            None => self
                .derived_status
                .or(self.cached_status.as_ref().map(|record| record.status)),
        }
    }
}
