use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::event::UnknownVariant;
use crate::message_id::MessageId;

pub const SYSTEM_ACTOR: &str = "system";

/// Identity of whoever asked for a mutating action, as established by the
/// authentication layer in front of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: String,
    pub source_address: Option<String>,
}

impl ActorContext {
    pub fn new(
        actor_id: impl Into<String>,
        source_address: Option<String>,
    ) -> Self {
        Self { actor_id: actor_id.into(), source_address }
    }

    pub fn system() -> Self {
        Self { actor_id: SYSTEM_ACTOR.to_string(), source_address: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    QueueDeliver,
    QueueFreeze,
    QueueThaw,
    QueueDelete,
    /// A queue request refused before any command ran (bad operation name).
    QueueRejected,
    RetentionPurge,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueDeliver => "queue_deliver",
            Self::QueueFreeze => "queue_freeze",
            Self::QueueThaw => "queue_thaw",
            Self::QueueDelete => "queue_delete",
            Self::QueueRejected => "queue_rejected",
            Self::RetentionPurge => "retention_purge",
        }
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "queue_deliver" => Self::QueueDeliver,
            "queue_freeze" => Self::QueueFreeze,
            "queue_thaw" => Self::QueueThaw,
            "queue_delete" => Self::QueueDelete,
            "queue_rejected" => Self::QueueRejected,
            "retention_purge" => Self::RetentionPurge,
            other => {
                return Err(UnknownVariant {
                    field: "audit action",
                    value: other.to_string(),
                });
            }
        };
        Ok(action)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row as handed to the store. There is no update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub action: AuditAction,
    pub message_id: Option<MessageId>,
    pub actor_id: String,
    pub source_address: Option<String>,
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub action: AuditAction,
    pub message_id: Option<MessageId>,
    pub actor_id: String,
    pub source_address: Option<String>,
    pub detail: Value,
}

impl NewAuditEntry {
    pub fn stored(
        self,
        id: u64,
    ) -> AuditLogEntry {
        AuditLogEntry {
            id,
            created_at: self.created_at,
            action: self.action,
            message_id: self.message_id,
            actor_id: self.actor_id,
            source_address: self.source_address,
            detail: self.detail,
        }
    }
}
