use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::message_id::MessageId;
use crate::timestamp::now_utc;

/// Which exim log file a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Main,
    Reject,
    Panic,
}

impl LogSource {
    pub const ALL: [LogSource; 3] = [Self::Main, Self::Reject, Self::Panic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Reject => "reject",
            Self::Panic => "panic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value {value:?} for {field}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl FromStr for LogSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" | "mainlog" | "primary" => Ok(Self::Main),
            "reject" | "rejectlog" | "rejected" => Ok(Self::Reject),
            "panic" | "paniclog" => Ok(Self::Panic),
            other => Err(UnknownVariant {
                field: "log source",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Arrival,
    Delivery,
    Deferral,
    Bounce,
    Rejection,
    Panic,
    Completion,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arrival => "arrival",
            Self::Delivery => "delivery",
            Self::Deferral => "deferral",
            Self::Bounce => "bounce",
            Self::Rejection => "rejection",
            Self::Panic => "panic",
            Self::Completion => "completion",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that record one delivery attempt per recipient.
    pub fn is_delivery_class(&self) -> bool {
        matches!(self, Self::Delivery | Self::Deferral | Self::Bounce)
    }
}

impl FromStr for EventKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "arrival" => Self::Arrival,
            "delivery" => Self::Delivery,
            "deferral" => Self::Deferral,
            "bounce" => Self::Bounce,
            "rejection" => Self::Rejection,
            "panic" => Self::Panic,
            "completion" => Self::Completion,
            "unknown" => Self::Unknown,
            other => {
                return Err(UnknownVariant {
                    field: "event kind",
                    value: other.to_string(),
                });
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed occurrence from an exim log line.
///
/// `raw_line` is always the verbatim input. Optional fields stay `None` when
/// the line does not carry them; `recipients: Some(vec![])` would mean "known
/// to have no recipients" and is never produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message_id: Option<MessageId>,
    pub source: LogSource,
    pub kind: EventKind,
    pub host: Option<String>,
    pub host_address: Option<String>,
    pub sender: Option<String>,
    pub recipients: Option<Vec<String>>,
    pub size: Option<u64>,
    pub status: Option<String>,
    pub error_code: Option<String>,
    pub error_text: Option<String>,
    pub confirmation: Option<String>,
    pub raw_line: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
}

impl LogEvent {
    pub fn new(
        kind: EventKind,
        source: LogSource,
        timestamp: OffsetDateTime,
        raw_line: &str,
    ) -> Self {
        Self {
            timestamp,
            message_id: None,
            source,
            kind,
            host: None,
            host_address: None,
            sender: None,
            recipients: None,
            size: None,
            status: None,
            error_code: None,
            error_text: None,
            confirmation: None,
            raw_line: raw_line.to_string(),
            ingested_at: now_utc(),
        }
    }

    pub fn unknown(
        source: LogSource,
        timestamp: OffsetDateTime,
        raw_line: &str,
    ) -> Self {
        Self::new(EventKind::Unknown, source, timestamp, raw_line)
    }

    pub fn first_recipient(&self) -> Option<&str> {
        self.recipients.as_ref()?.first().map(String::as_str)
    }
}
