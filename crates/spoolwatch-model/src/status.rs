use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::UnknownVariant;
use crate::message_id::MessageId;

/// Cached per-message status. Ordering is by [`MessageStatus::rank`]:
/// `received < queued < deferred < frozen < delivered < bounced`.
///
/// A frozen message can still be delivered or bounced once thawed, so frozen
/// sits below both outcomes. A bounce outranks a delivery because a message
/// with one bounced recipient also logs deliveries and `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Queued,
    Deferred,
    Delivered,
    Bounced,
    Frozen,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Deferred => "deferred",
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Frozen => "frozen",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Queued => 1,
            Self::Deferred => 2,
            Self::Frozen => 3,
            Self::Delivered => 4,
            Self::Bounced => 5,
        }
    }

    /// Delivered or bounced. Frozen messages are still in the spool.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced)
    }

    /// True when moving from `current` to `self` is a forward step.
    pub fn advances(
        &self,
        current: Option<MessageStatus>,
    ) -> bool {
        current.is_none_or(|current| self.rank() > current.rank())
    }
}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "received" => Self::Received,
            "queued" => Self::Queued,
            "deferred" => Self::Deferred,
            "delivered" => Self::Delivered,
            "bounced" => Self::Bounced,
            "frozen" => Self::Frozen,
            other => {
                return Err(UnknownVariant {
                    field: "message status",
                    value: other.to_string(),
                });
            }
        };
        Ok(status)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored current-status row; a cache over the event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusRecord {
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
