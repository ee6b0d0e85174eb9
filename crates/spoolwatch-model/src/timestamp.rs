use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid log timestamp {input:?}: {reason}")]
pub struct TimestampError {
    pub input: String,
    pub reason: String,
}

/// Parses an exim log timestamp (`YYYY-MM-DD HH:MM:SS`) as UTC.
pub fn parse_log_timestamp(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let format =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(value, format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| TimestampError {
            input: value.to_string(),
            reason: err.to_string(),
        })
}

pub fn format_log_timestamp(value: OffsetDateTime) -> String {
    let format =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    value
        .format(format)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

/// Current UTC time truncated to microseconds, the precision the store keeps.
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.replace_nanosecond(micros).unwrap_or(now)
}
