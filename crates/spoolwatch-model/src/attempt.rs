use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::UnknownVariant;
use crate::message_id::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Defer,
    Bounce,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Defer => "defer",
            Self::Bounce => "bounce",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "defer" => Ok(Self::Defer),
            "bounce" => Ok(Self::Bounce),
            "timeout" => Ok(Self::Timeout),
            other => Err(UnknownVariant {
                field: "attempt outcome",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery attempt before the store has assigned its sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDeliveryAttempt {
    pub message_id: MessageId,
    pub recipient: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
    pub host: Option<String>,
    pub host_address: Option<String>,
    pub response_code: Option<String>,
    pub response_text: Option<String>,
    pub outcome: AttemptOutcome,
}

impl NewDeliveryAttempt {
    pub fn with_sequence(
        self,
        sequence: u32,
    ) -> DeliveryAttempt {
        DeliveryAttempt {
            message_id: self.message_id,
            recipient: self.recipient,
            sequence,
            attempted_at: self.attempted_at,
            host: self.host,
            host_address: self.host_address,
            response_code: self.response_code,
            response_text: self.response_text,
            outcome: self.outcome,
        }
    }
}

/// One outcome for one recipient of one message. Sequence numbers start at
/// 1 and increase per `(message_id, recipient)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub recipient: Option<String>,
    pub sequence: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
    pub host: Option<String>,
    pub host_address: Option<String>,
    pub response_code: Option<String>,
    pub response_text: Option<String>,
    pub outcome: AttemptOutcome,
}
