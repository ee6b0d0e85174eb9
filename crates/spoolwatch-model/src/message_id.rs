use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Regex fragment matching one exim message id, for embedding in larger line
/// patterns. Callers must supply their own boundaries.
pub const MESSAGE_ID_PATTERN: &str =
    r"[A-Za-z0-9]{6}-[A-Za-z0-9]{6}-[A-Za-z0-9]{2,6}";

const GROUP_LEN: usize = 6;
const TAIL_MIN_LEN: usize = 2;
const TAIL_MAX_LEN: usize = 6;
const MAX_LEN: usize = GROUP_LEN * 2 + TAIL_MAX_LEN + 2;

/// Exim-assigned message identifier, e.g. `1a2b3c-4d5e6f-7g`.
///
/// Construction always validates the lexical shape, so a `MessageId` is safe
/// to pass as a process argument.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageIdError {
    #[error("message id is empty")]
    Empty,
    #[error("message id too long: {0} bytes")]
    TooLong(usize),
    #[error("message id contains forbidden character {0:?}")]
    ForbiddenChar(char),
    #[error("message id must have three dash-separated groups, found {0}")]
    GroupCount(usize),
    #[error("message id group {index} has length {len}")]
    GroupLength { index: usize, len: usize },
}

impl MessageId {
    pub fn parse(value: &str) -> Result<Self, MessageIdError> {
        if value.is_empty() {
            return Err(MessageIdError::Empty);
        }
        if value.len() > MAX_LEN {
            return Err(MessageIdError::TooLong(value.len()));
        }
        if let Some(bad) =
            value.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(MessageIdError::ForbiddenChar(bad));
        }

        let groups: Vec<&str> = value.split('-').collect();
        if groups.len() != 3 {
            return Err(MessageIdError::GroupCount(groups.len()));
        }

        for (index, group) in groups.iter().enumerate() {
            let ok = if index < 2 {
                group.len() == GROUP_LEN
            } else {
                (TAIL_MIN_LEN..=TAIL_MAX_LEN).contains(&group.len())
            };
            if !ok {
                return Err(MessageIdError::GroupLength {
                    index,
                    len: group.len(),
                });
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = MessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MessageId {
    type Error = MessageIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Finds the first message id embedded anywhere in free text.
///
/// Candidates are maximal runs of `[A-Za-z0-9-]`, so an id glued to other
/// alphanumerics (`x1a2b3c-...`) is not reported.
pub fn find_message_id(text: &str) -> Option<MessageId> {
    candidate_tokens(text).find_map(|token| MessageId::parse(token).ok())
}

/// Finds every message id in free text, in order of appearance.
pub fn find_message_ids(text: &str) -> Vec<MessageId> {
    candidate_tokens(text)
        .filter_map(|token| MessageId::parse(token).ok())
        .collect()
}

fn candidate_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .filter(|token| token.len() >= GROUP_LEN * 2 + TAIL_MIN_LEN + 2)
}
