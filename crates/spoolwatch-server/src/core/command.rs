use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use spoolwatch_model::{
    MessageId, OperationOutcome, QueueEntry, QueueOperation, QueueRecipient
};
use tokio::process::Command;
use tracing::debug;

/// Captured result of one exim invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr when present, stdout otherwise, trimmed.
    pub fn diagnostic(&self) -> Option<String> {
        let text = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
        let text = text.trim();
        (!text.is_empty()).then(|| text.chars().take(1024).collect())
    }
}

/// The closed set of exim invocations. Each takes at most one variable
/// argument, the message id, which is already validated by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EximCommand<'a> {
    Operation(QueueOperation, &'a MessageId),
    List,
    Inspect(&'a MessageId),
}

impl EximCommand<'_> {
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Operation(QueueOperation::Deliver, _) => "-M",
            Self::Operation(QueueOperation::Freeze, _) => "-Mf",
            Self::Operation(QueueOperation::Thaw, _) => "-Mt",
            Self::Operation(QueueOperation::Delete, _) => "-Mrm",
            Self::List => "-bp",
            Self::Inspect(_) => "-Mvh",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Operation(_, id) | Self::Inspect(id) => {
                vec![self.flag().to_string(), id.as_str().to_string()]
            }
            Self::List => vec![self.flag().to_string()],
        }
    }
}

/// Execution seam for the exim binary. Every call is a fresh process with its
/// own argument vector; nothing is shared between concurrent calls.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        args: Vec<String>,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

pub struct TokioCommandRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(
        binary: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self { binary: binary.into(), timeout }
    }
}

impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        args: Vec<String>,
    ) -> Result<CommandOutput> {
        debug!("exim command: binary={}, args={:?}", self.binary.display(), args);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                anyhow!(
                    "exim command timed out after {}ms: args={:?}",
                    self.timeout.as_millis(),
                    args
                )
            })?
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

const PERMISSION_MARKERS: &[&str] =
    &["permission denied", "not an admin", "must be an admin"];
const NOT_FOUND_MARKERS: &[&str] =
    &["does not exist", "not found", "no such file", "no such message"];
const ALREADY_MARKERS: &[&str] =
    &["is already frozen", "is not frozen", "already delivered"];

/// Maps exim's exit status and output text to an outcome. Text markers win
/// over the exit status because exim reports some no-ops with status 0.
///
/// Not-found and already-in-state markers only count on a line that names
/// `message_id`, so unrelated diagnostics (a missing config file) stay
/// unknown failures.
pub fn classify_outcome(
    output: &CommandOutput,
    message_id: &MessageId,
) -> OperationOutcome {
    let id = message_id.as_str().to_ascii_lowercase();
    let lines: Vec<String> = output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .map(str::to_ascii_lowercase)
        .collect();
    let has = |markers: &[&str], scoped: bool| {
        lines.iter().any(|line| {
            (!scoped || line.contains(&id))
                && markers.iter().any(|marker| line.contains(marker))
        })
    };

    if has(PERMISSION_MARKERS, false) {
        OperationOutcome::PermissionDenied
    } else if has(NOT_FOUND_MARKERS, true) {
        OperationOutcome::NotFound
    } else if has(ALREADY_MARKERS, true) {
        OperationOutcome::AlreadyInState
    } else if output.success() {
        OperationOutcome::Success
    } else {
        OperationOutcome::UnknownFailure
    }
}

/// Parses `exim -bp` output. Each entry is a header line
/// (`age size id <sender> [*** frozen ***]`) followed by indented recipient
/// lines; delivered recipients carry a `D` mark. Unrecognised lines are
/// skipped.
pub fn parse_queue_listing(output: &str) -> Vec<QueueEntry> {
    let mut entries: Vec<QueueEntry> = Vec::new();
    let mut current: Option<QueueEntry> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            entries.extend(current.take());
            continue;
        }

        if let Some(entry) = parse_header(line) {
            entries.extend(current.replace(entry));
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["D", address] => entry.recipients.push(QueueRecipient {
                address: (*address).to_string(),
                delivered: true,
            }),
            [address] => entry.recipients.push(QueueRecipient {
                address: (*address).to_string(),
                delivered: false,
            }),
            _ => {}
        }
    }

    entries.extend(current);
    entries
}

fn parse_header(line: &str) -> Option<QueueEntry> {
    let mut tokens = line.split_whitespace();
    let age_secs = parse_age(tokens.next()?)?;
    let size_bytes = parse_size(tokens.next()?);
    let message_id = MessageId::parse(tokens.next()?).ok()?;

    let rest: Vec<&str> = tokens.collect();
    let sender = rest
        .first()
        .filter(|token| token.starts_with('<'))
        .map(|token| token.trim_start_matches('<').trim_end_matches('>'))
        .filter(|sender| !sender.is_empty())
        .map(str::to_string);

    Some(QueueEntry {
        message_id,
        age_secs,
        size_bytes,
        sender,
        frozen: rest.join(" ").contains("*** frozen ***"),
        recipients: Vec::new(),
    })
}

fn parse_age(token: &str) -> Option<u64> {
    let (split, _) = token.char_indices().last()?;
    let (value, unit) = token.split_at(split);
    let value: u64 = value.parse().ok()?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    Some(value * unit_secs)
}

fn parse_size(token: &str) -> Option<u64> {
    let (value, multiplier) = match token.chars().last()? {
        'K' | 'k' => (&token[..token.len() - 1], 1024.0),
        'M' => (&token[..token.len() - 1], 1024.0 * 1024.0),
        'G' => (&token[..token.len() - 1], 1024.0 * 1024.0 * 1024.0),
        _ => (token, 1.0),
    };
    let value: f64 = value.parse().ok()?;
    Some((value * multiplier).round() as u64)
}

/// Test runner: answers per full argv (`"-Mf <id>"`) or per flag, and
/// records every argv. Unscripted calls succeed with empty output.
#[cfg(test)]
#[derive(Default)]
pub struct ScriptedRunner {
    responses: std::sync::Mutex<std::collections::HashMap<String, CommandOutput>>,
    calls: std::sync::Mutex<Vec<Vec<String>>>,
}

#[cfg(test)]
impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(
        &self,
        flag: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) {
        self.responses.lock().unwrap().insert(
            flag.to_string(),
            CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        args: Vec<String>,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(args.clone());
        let flag = args.first().cloned().unwrap_or_default();
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .get(&args.join(" "))
            .or_else(|| responses.get(&flag))
            .cloned()
            .unwrap_or(CommandOutput { exit_code: Some(0), ..CommandOutput::default() }))
    }
}
