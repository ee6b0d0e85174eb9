mod attempt;
mod audit;
mod event;
mod message_id;
mod queue;
mod status;
mod timestamp;

pub use attempt::{AttemptOutcome, DeliveryAttempt, NewDeliveryAttempt};
pub use audit::{
    ActorContext, AuditAction, AuditLogEntry, NewAuditEntry, SYSTEM_ACTOR
};
pub use event::{EventKind, LogEvent, LogSource, UnknownVariant};
pub use message_id::{
    MESSAGE_ID_PATTERN, MessageId, MessageIdError, find_message_id,
    find_message_ids
};
pub use queue::{
    BulkItemResult, BulkOperationResult, MAX_ECHOED_INPUT, OperationOutcome,
    OperationResult, QueueEntry, QueueOperation, QueueRecipient, QueueSnapshot,
    ValidationError, check_command_argument, echo_input, validate_message_id
};
pub use status::{MessageStatus, MessageStatusRecord};
pub use timestamp::{
    TimestampError, format_log_timestamp, now_utc, parse_log_timestamp
};
