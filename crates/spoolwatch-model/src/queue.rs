use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::audit::AuditAction;
use crate::message_id::{MessageId, MessageIdError};

/// Longest prefix of rejected caller input echoed back in errors and audit
/// detail.
pub const MAX_ECHOED_INPUT: usize = 64;

/// Caller input cut to [`MAX_ECHOED_INPUT`] chars for errors and audit detail.
pub fn echo_input(input: &str) -> String {
    input.chars().take(MAX_ECHOED_INPUT).collect()
}

/// Mutating queue operations. This enum is the allow-list: nothing else can
/// reach the exim binary through the mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    Deliver,
    Freeze,
    Thaw,
    Delete,
}

impl QueueOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deliver => "deliver",
            Self::Freeze => "freeze",
            Self::Thaw => "thaw",
            Self::Delete => "delete",
        }
    }

    pub fn audit_action(&self) -> AuditAction {
        match self {
            Self::Deliver => AuditAction::QueueDeliver,
            Self::Freeze => AuditAction::QueueFreeze,
            Self::Thaw => AuditAction::QueueThaw,
            Self::Delete => AuditAction::QueueDelete,
        }
    }
}

impl FromStr for QueueOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deliver" => Ok(Self::Deliver),
            "freeze" => Ok(Self::Freeze),
            "thaw" => Ok(Self::Thaw),
            "delete" => Ok(Self::Delete),
            other => Err(ValidationError::OperationNotAllowed(echo_input(other))),
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refusals raised before any external command is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid message id {input:?}: {source}")]
    MessageId {
        input: String,
        #[source]
        source: MessageIdError,
    },
    #[error("operation not allowed: {0:?}")]
    OperationNotAllowed(String),
    #[error("argument rejected: {reason}")]
    UnsafeArgument { reason: &'static str },
    #[error("actor identifier is missing")]
    MissingActor,
    #[error("bulk request has no message ids")]
    EmptyBulk,
    #[error("bulk request has {count} message ids, limit is {limit}")]
    BulkTooLarge { count: usize, limit: usize },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MessageId { .. } => "INVALID_MESSAGE_ID",
            Self::OperationNotAllowed(_) => "OPERATION_NOT_ALLOWED",
            Self::UnsafeArgument { .. } => "UNSAFE_ARGUMENT",
            Self::MissingActor => "MISSING_ACTOR",
            Self::EmptyBulk => "EMPTY_BULK",
            Self::BulkTooLarge { .. } => "BULK_TOO_LARGE",
        }
    }
}

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?',
    '!', '~', '#', '\'', '"', '\\', '\n', '\r', '\t', ' ', '\0',
];

/// Checks a free-text value that will become a process argument.
///
/// Arguments are passed as an argv vector and never through a shell; this
/// check still refuses shell metacharacters, path traversal and leading
/// dashes so nothing can be read as an option or a path by the binary.
pub fn check_command_argument(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::UnsafeArgument { reason: "empty argument" });
    }
    if value.starts_with('-') {
        return Err(ValidationError::UnsafeArgument {
            reason: "argument starts with '-'",
        });
    }
    if value.contains("..") || value.contains('/') {
        return Err(ValidationError::UnsafeArgument {
            reason: "path traversal sequence",
        });
    }
    if value.chars().any(|c| SHELL_METACHARACTERS.contains(&c) || c.is_control())
    {
        return Err(ValidationError::UnsafeArgument {
            reason: "shell metacharacter",
        });
    }
    Ok(())
}

/// Validates a caller-supplied message id for use as a command argument.
pub fn validate_message_id(input: &str) -> Result<MessageId, ValidationError> {
    check_command_argument(input)?;
    MessageId::parse(input).map_err(|source| ValidationError::MessageId {
        input: echo_input(input),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Success,
    NotFound,
    PermissionDenied,
    AlreadyInState,
    UnknownFailure,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::AlreadyInState => "already_in_state",
            Self::UnknownFailure => "unknown_failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: QueueOperation,
    pub message_id: MessageId,
    pub outcome: OperationOutcome,
    pub exit_code: Option<i32>,
    /// Captured command output for anything other than plain success.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub message_id: String,
    pub outcome: Option<OperationOutcome>,
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_some_and(|outcome| outcome.is_success())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub operation: QueueOperation,
    pub items: Vec<BulkItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkOperationResult {
    pub fn from_items(
        operation: QueueOperation,
        items: Vec<BulkItemResult>,
    ) -> Self {
        let succeeded = items.iter().filter(|item| item.is_success()).count();
        let failed = items.len() - succeeded;
        Self { operation, items, succeeded, failed }
    }

    /// One `(message_id, error)` pair per failed identifier.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter(|item| !item.is_success()).map(|item| {
            (
                item.message_id.as_str(),
                item.error.as_deref().unwrap_or("operation failed"),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecipient {
    pub address: String,
    pub delivered: bool,
}

/// One message as listed by `exim -bp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message_id: MessageId,
    pub age_secs: u64,
    pub size_bytes: Option<u64>,
    pub sender: Option<String>,
    pub frozen: bool,
    pub recipients: Vec<QueueRecipient>,
}

/// Point-in-time queue rollup for trend display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub total: u64,
    pub deferred: u64,
    pub frozen: u64,
    pub oldest_age_secs: Option<u64>,
}

impl QueueSnapshot {
    pub fn from_entries(
        taken_at: OffsetDateTime,
        entries: &[QueueEntry],
    ) -> Self {
        let total = entries.len() as u64;
        let frozen = entries.iter().filter(|entry| entry.frozen).count() as u64;
        Self {
            taken_at,
            total,
            deferred: total - frozen,
            frozen,
            oldest_age_secs: entries.iter().map(|entry| entry.age_secs).max(),
        }
    }
}
