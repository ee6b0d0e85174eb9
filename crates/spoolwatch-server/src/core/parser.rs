use regex::{Captures, Regex};
use spoolwatch_model::{
    EventKind, LogEvent, LogSource, MESSAGE_ID_PATTERN, MessageId, now_utc,
    parse_log_timestamp
};
use time::OffsetDateTime;
use tracing::trace;

const MAX_ERROR_TEXT_LEN: usize = 1024;

// Widths of the bounded `log_events` and `delivery_attempts` columns.
const MAX_HOST_LEN: usize = 255;
const MAX_HOST_ADDRESS_LEN: usize = 64;
const MAX_ADDRESS_LEN: usize = 512;
const MAX_STATUS_LEN: usize = 64;
const MAX_ERROR_CODE_LEN: usize = 16;

/// Leading `timestamp [pid] ` shared by every exim log line. Optional
/// fractional seconds and a numeric zone are tolerated but not interpreted.
const PREFIX: &str = r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?:\.\d+)?(?: [+-]\d{4})?(?: \[\d+\])? ";

const LENIENT_TIMESTAMP: &str =
    r"^\s*(?P<ts>\d{4}-\d{2}-\d{2})[ T](?P<clock>\d{2}:\d{2}:\d{2})";

type Extractor = fn(&Captures<'_>, &mut LogEvent);

struct LinePattern {
    name: &'static str,
    kind: EventKind,
    status: &'static str,
    regex: Regex,
    extract: Extractor,
}

/// Converts raw exim log lines into [`LogEvent`]s.
///
/// Each log source has an ordered pattern list; the first match wins, so list
/// order is the precedence between overlapping shapes. Lines that match no
/// pattern become `EventKind::Unknown` events with a best-effort timestamp.
pub struct LineParser {
    main: Vec<LinePattern>,
    reject: Vec<LinePattern>,
    panic: Vec<LinePattern>,
    lenient_timestamp: Regex,
}

impl LineParser {
    pub fn compile() -> Result<Self, regex::Error> {
        let id = MESSAGE_ID_PATTERN;

        let main = vec![
            // Arrival first: `<=` is unambiguous and the most frequent line.
            pattern(
                "arrival",
                EventKind::Arrival,
                "received",
                &format!(r"(?P<id>{id}) <= (?P<sender>\S+)(?P<rest>.*)$"),
                extract_arrival,
            )?,
            // Frozen notices carry no flag, so they must be claimed before the
            // delivery-class patterns below could ever be loosened.
            pattern(
                "frozen",
                EventKind::Deferral,
                "frozen",
                &format!(
                    r"(?P<id>{id}) (?:Message is frozen|\*\*\* Frozen|frozen by)(?P<rest>.*)$"
                ),
                extract_frozen,
            )?,
            // Manual `-Mt` and auto-thaw both log `unfrozen by <who>`.
            pattern(
                "unfrozen",
                EventKind::Deferral,
                "unfrozen",
                &format!(r"(?P<id>{id}) [Uu]nfrozen by (?P<rest>.*)$"),
                extract_nothing,
            )?,
            // Deferral before delivery: a defer line also names a recipient and
            // a host, which a permissive delivery shape would accept.
            pattern(
                "deferral",
                EventKind::Deferral,
                "deferred",
                &format!(r"(?P<id>{id}) == (?P<rcpt>\S+)(?P<rest>.*)$"),
                extract_failure,
            )?,
            // Bounce before delivery for the same reason as deferral.
            pattern(
                "bounce",
                EventKind::Bounce,
                "bounced",
                &format!(r"(?P<id>{id}) \*\* (?P<rcpt>\S+)(?P<rest>.*)$"),
                extract_failure,
            )?,
            // First, additional and suppressed deliveries share one shape.
            pattern(
                "delivery",
                EventKind::Delivery,
                "delivered",
                &format!(r"(?P<id>{id}) (?:=>|->|\*>) (?P<rcpt>\S+)(?P<rest>.*)$"),
                extract_delivery,
            )?,
            pattern(
                "completion",
                EventKind::Completion,
                "completed",
                &format!(r"(?P<id>{id}) Completed(?P<rest>.*)$"),
                extract_nothing,
            )?,
        ];

        let reject = vec![
            // SMTP-phase rejection first: connection-level wording may appear
            // in the ACL text of a RCPT rejection, never the other way round.
            pattern(
                "reject_smtp",
                EventKind::Rejection,
                "rejected",
                &format!(
                    r"(?:(?P<id>{id}) )?(?P<head>.*?)\brejected (?P<phase>after DATA|RCPT|MAIL|DATA|EHLO|HELO|VRFY|EXPN)\b(?P<rest>.*)$"
                ),
                extract_smtp_rejection,
            )?,
            pattern(
                "reject_connection",
                EventKind::Rejection,
                "rejected_connection",
                r"(?P<head>.*?)(?:\brejected connection\b|\brefused connection\b|\b[Cc]onnection from .*?\brefused\b)(?P<rest>.*)$",
                extract_connection_rejection,
            )?,
        ];

        let panic = vec![
            // Error wording first so the catch-all below only labels the rest.
            pattern(
                "panic_error",
                EventKind::Panic,
                "error",
                &format!(
                    r"(?:(?P<id>{id}) )?(?P<text>.*\b(?:failed|[Ee]rror|cannot|unable|[Ff]ailure)\b.*)$"
                ),
                extract_panic_text,
            )?,
            pattern(
                "panic",
                EventKind::Panic,
                "panic",
                &format!(r"(?:(?P<id>{id}) )?(?P<text>.+)$"),
                extract_panic_text,
            )?,
        ];

        Ok(Self {
            main,
            reject,
            panic,
            lenient_timestamp: Regex::new(LENIENT_TIMESTAMP)?,
        })
    }

    /// Parses one raw line. Never fails: unmatched or inconsistent lines fall
    /// back to an `unknown` event that keeps the raw line verbatim.
    pub fn parse_line(
        &self,
        raw_line: &str,
        source: LogSource,
    ) -> LogEvent {
        let line = raw_line.trim_end_matches(['\r', '\n']);

        for pattern in self.patterns_for(source) {
            let Some(caps) = pattern.regex.captures(line) else {
                continue;
            };

            let Ok(timestamp) = parse_log_timestamp(&caps["ts"]) else {
                trace!(
                    "pattern matched with unparseable timestamp: pattern={}, line={}",
                    pattern.name,
                    line
                );
                break;
            };

            let mut event =
                LogEvent::new(pattern.kind, source, timestamp, raw_line);
            event.status = Some(pattern.status.to_string());
            event.message_id = caps
                .name("id")
                .and_then(|id| MessageId::parse(id.as_str()).ok());
            (pattern.extract)(&caps, &mut event);
            fit_columns(&mut event);
            return event;
        }

        LogEvent::unknown(source, self.fallback_timestamp(line), raw_line)
    }

    /// Names of the patterns tried for `source`, in precedence order.
    pub fn pattern_names(
        &self,
        source: LogSource,
    ) -> Vec<&'static str> {
        self.patterns_for(source).iter().map(|pattern| pattern.name).collect()
    }

    fn patterns_for(
        &self,
        source: LogSource,
    ) -> &[LinePattern] {
        match source {
            LogSource::Main => &self.main,
            LogSource::Reject => &self.reject,
            LogSource::Panic => &self.panic,
        }
    }

    fn fallback_timestamp(
        &self,
        line: &str,
    ) -> OffsetDateTime {
        self.lenient_timestamp
            .captures(line)
            .and_then(|caps| {
                parse_log_timestamp(&format!("{} {}", &caps["ts"], &caps["clock"]))
                    .ok()
            })
            .unwrap_or_else(now_utc)
    }
}

fn pattern(
    name: &'static str,
    kind: EventKind,
    status: &'static str,
    body: &str,
    extract: Extractor,
) -> Result<LinePattern, regex::Error> {
    Ok(LinePattern {
        name,
        kind,
        status,
        regex: Regex::new(&format!("{PREFIX}{body}"))?,
        extract,
    })
}

fn extract_arrival(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    event.sender = Some(strip_angles(&caps["sender"]).to_string());
    event.host = extract_field(rest, "H=").map(normalize_host);
    event.host_address = extract_host_address(rest);
    event.size = extract_field(rest, "S=").and_then(|size| size.parse().ok());

    if let Some(idx) = rest.find(" for ") {
        let recipients: Vec<String> = rest[idx + 5..]
            .split_whitespace()
            .map(|addr| strip_angles(addr).to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
        if !recipients.is_empty() {
            event.recipients = Some(recipients);
        }
    }
}

fn extract_frozen(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let reason = rest.trim_start_matches([':', ' ']).trim();
    if !reason.is_empty() {
        event.error_text = Some(truncate(reason));
    }
}

/// Deferral and bounce lines: `<flag> rcpt R=.. T=.. [defer (errno)] [H=..]: text`.
fn extract_failure(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    event.recipients = Some(vec![strip_angles(&caps["rcpt"]).to_string()]);
    event.host = extract_field(rest, "H=").map(normalize_host);
    event.host_address = extract_host_address(rest);

    let error_text = rest.split_once(": ").map(|(_, text)| text.trim());
    event.error_code = error_text
        .and_then(find_smtp_code)
        .or_else(|| extract_between(rest, "defer (", ")").map(str::to_string));
    event.error_text = error_text.filter(|text| !text.is_empty()).map(truncate);
}

fn extract_delivery(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    event.recipients = Some(vec![strip_angles(&caps["rcpt"]).to_string()]);
    event.host = extract_field(rest, "H=").map(normalize_host);
    event.host_address = extract_host_address(rest);
    event.confirmation = extract_field(rest, "C=").map(str::to_string);
}

fn extract_nothing(
    _caps: &Captures<'_>,
    _event: &mut LogEvent,
) {
}

fn extract_smtp_rejection(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let head = caps.name("head").map_or("", |m| m.as_str());
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let phase = &caps["phase"];

    event.status = Some(format!(
        "rejected_{}",
        phase.to_ascii_lowercase().replace(' ', "_")
    ));
    event.host = extract_field(head, "H=").map(normalize_host);
    event.host_address = extract_host_address(head);
    event.sender = extract_between(head, "F=<", ">").map(str::to_string);

    let (target, text) = match rest.split_once(": ") {
        Some((target, text)) => (target, Some(text.trim())),
        None => (rest, None),
    };
    if phase == "RCPT" {
        if let Some(rcpt) = extract_between(target, "<", ">") {
            event.recipients = Some(vec![rcpt.to_string()]);
        }
    }
    event.error_code = text.and_then(find_smtp_code);
    event.error_text = text.filter(|text| !text.is_empty()).map(truncate);
}

fn extract_connection_rejection(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let head = caps.name("head").map_or("", |m| m.as_str());
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let line = format!("{head}{rest}");

    event.host = extract_field(&line, "H=").map(normalize_host);
    event.host_address = extract_host_address(&line);
    let text = rest
        .trim_start_matches([':', ' '])
        .trim();
    if !text.is_empty() {
        event.error_text = Some(truncate(text));
    }
}

fn extract_panic_text(
    caps: &Captures<'_>,
    event: &mut LogEvent,
) {
    let text = caps.name("text").map_or("", |m| m.as_str()).trim();
    if !text.is_empty() {
        event.error_text = Some(truncate(text));
    }
}

/// Value of a `KEY=value` field that starts the text or follows whitespace.
/// Double-quoted values (`C="250 OK"`) are returned without the quotes.
fn extract_field<'a>(
    text: &'a str,
    key: &str,
) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(key) {
        let start = search_from + found;
        let at_boundary = start == 0
            || text[..start].ends_with(|c: char| c.is_whitespace());
        if at_boundary {
            let value = &text[start + key.len()..];
            if let Some(quoted) = value.strip_prefix('"') {
                return quoted.split_once('"').map(|(inner, _)| inner);
            }
            let end = value
                .find(|c: char| c.is_whitespace())
                .unwrap_or(value.len());
            let value = value[..end].trim_end_matches([':', ',']);
            return if value.is_empty() { None } else { Some(value) };
        }
        search_from = start + key.len();
    }
    None
}

fn extract_between<'a>(
    text: &'a str,
    start: &str,
    end: &str,
) -> Option<&'a str> {
    let start_idx = text.find(start)? + start.len();
    let rem = &text[start_idx..];
    let end_idx = rem.find(end)?;
    let value = rem[..end_idx].trim();
    if value.is_empty() { None } else { Some(value) }
}

/// First bracketed address after `H=`, e.g. `H=mx.example (helo) [192.0.2.1]`.
fn extract_host_address(text: &str) -> Option<String> {
    let from = text.find("H=")?;
    extract_between(&text[from..], "[", "]").map(str::to_string)
}

/// `(helo.name)` is what exim logs when there is no reverse DNS.
fn normalize_host(host: &str) -> String {
    host.trim_start_matches('(').trim_end_matches(')').to_string()
}

fn strip_angles(value: &str) -> &str {
    let trimmed = value.trim_end_matches([',', ':']);
    if trimmed == "<>" {
        return trimmed;
    }
    trimmed.trim_start_matches('<').trim_end_matches('>')
}

/// First standalone SMTP reply code (`550`, `451-`) in an error text.
fn find_smtp_code(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_end_matches('-'))
        .find(|token| {
            token.len() == 3
                && token.chars().all(|c| c.is_ascii_digit())
                && matches!(token.as_bytes()[0], b'2' | b'4' | b'5')
        })
        .map(str::to_string)
}

fn truncate(text: &str) -> String {
    let mut text = text.to_string();
    cap(&mut text, MAX_ERROR_TEXT_LEN);
    text
}

/// Cuts `text` to at most `max` bytes on a char boundary.
fn cap(
    text: &mut String,
    max: usize,
) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Extracted fields are client controlled (HELO names, envelope addresses),
/// so each is cut to the width of the column it is stored in.
fn fit_columns(event: &mut LogEvent) {
    for (field, max) in [
        (&mut event.host, MAX_HOST_LEN),
        (&mut event.host_address, MAX_HOST_ADDRESS_LEN),
        (&mut event.sender, MAX_ADDRESS_LEN),
        (&mut event.status, MAX_STATUS_LEN),
        (&mut event.error_code, MAX_ERROR_CODE_LEN),
    ] {
        if let Some(value) = field.as_mut() {
            cap(value, max);
        }
    }
    for recipient in event.recipients.iter_mut().flatten() {
        cap(recipient, MAX_ADDRESS_LEN);
    }
}
