use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use spoolwatch_model::LogSource;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_exim_binary")]
    pub exim_binary: PathBuf,
    #[serde(default)]
    pub logs: Vec<LogFileConfig>,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogFileConfig {
    pub path: PathBuf,
    pub source: LogSource,
}

impl Config {
    /// Loads the config named by the first CLI argument, or the first one
    /// found by [`resolve_config_path`].
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context(
                "config path not found (SPOOLWATCH_CONFIG_PATH or spoolwatch.yaml/spoolwatch.yml)",
            )?;

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| {
            format!("failed to read config file {}", path.display())
        })?;
        let mut config: Config = serde_yaml::from_slice(&raw).with_context(|| {
            format!("failed to parse YAML config {}", path.display())
        })?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.database_url = self.database_url.trim().to_string();
        if self.database_url.is_empty() {
            bail!("config missing `database_url`");
        }
        if self.exim_binary.as_os_str().is_empty() {
            self.exim_binary = default_exim_binary();
        }
        if self.logs.is_empty() {
            self.logs = default_logs();
        }

        self.watch.normalize();
        self.ingest.normalize();
        self.backlog.normalize();
        self.queue.normalize();
        self.retention.normalize();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.exim_binary.is_absolute() {
            bail!(
                "`exim_binary` must be an absolute path: {}",
                self.exim_binary.display()
            );
        }

        let mut seen = HashSet::new();
        for log in self.logs.iter().chain(self.backlog.startup_files.iter()) {
            if !log.path.is_absolute() {
                bail!("log path must be absolute: {}", log.path.display());
            }
        }
        for log in &self.logs {
            if !seen.insert(&log.path) {
                bail!("log path listed twice: {}", log.path.display());
            }
        }
        Ok(())
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: spoolwatch-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: spoolwatch-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

/// `SPOOLWATCH_CONFIG_PATH`, then `$HOME/spoolwatch.{yaml,yml}`, then the
/// same names in the working directory.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("SPOOLWATCH_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::new();
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| {
            [dir.join("spoolwatch.yaml"), dir.join("spoolwatch.yml")]
        })
        .find(|candidate| candidate.exists())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(
        default = "default_retry_interval",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub retry_interval: Duration,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Skip existing content on the first open; rotated files are always
    /// read from the start.
    #[serde(default = "default_true")]
    pub start_at_end: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            retry_interval: default_retry_interval(),
            read_chunk_bytes: default_read_chunk_bytes(),
            channel_capacity: default_channel_capacity(),
            start_at_end: true,
        }
    }
}

impl WatchConfig {
    fn normalize(&mut self) {
        self.poll_interval = self.poll_interval.max(Duration::from_millis(10));
        self.retry_interval = self.retry_interval.max(Duration::from_millis(10));
        self.read_chunk_bytes = self.read_chunk_bytes.clamp(512, 16 * 1024 * 1024);
        self.channel_capacity = self.channel_capacity.max(1);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(
        default = "default_flush_interval",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub flush_interval: Duration,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(
        default = "default_retry_backoff",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub retry_backoff: Duration,
    #[serde(
        default = "default_shutdown_flush_timeout",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub shutdown_flush_timeout: Duration,
    /// Unknown lines per window above which a warning is logged.
    #[serde(default = "default_unknown_warn_threshold")]
    pub unknown_warn_threshold: u64,
    #[serde(
        default = "default_unknown_warn_window",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub unknown_warn_window: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            shutdown_flush_timeout: default_shutdown_flush_timeout(),
            unknown_warn_threshold: default_unknown_warn_threshold(),
            unknown_warn_window: default_unknown_warn_window(),
        }
    }
}

impl IngestConfig {
    fn normalize(&mut self) {
        self.batch_size = self.batch_size.clamp(1, 50_000);
        self.flush_interval = self.flush_interval.max(Duration::from_millis(10));
        self.retry_attempts = self.retry_attempts.max(1);
        self.unknown_warn_threshold = self.unknown_warn_threshold.max(1);
        self.unknown_warn_window =
            self.unknown_warn_window.max(Duration::from_secs(1));
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BacklogConfig {
    #[serde(default = "default_backlog_workers")]
    pub workers: usize,
    #[serde(default = "default_backlog_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(default = "default_backlog_queue_per_worker")]
    pub queue_per_worker: usize,
    /// Files processed to completion before live tailing starts.
    #[serde(default)]
    pub startup_files: Vec<LogFileConfig>,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            workers: default_backlog_workers(),
            chunk_bytes: default_backlog_chunk_bytes(),
            queue_per_worker: default_backlog_queue_per_worker(),
            startup_files: Vec::new(),
        }
    }
}

impl BacklogConfig {
    fn normalize(&mut self) {
        self.workers = self.workers.clamp(1, 64);
        self.chunk_bytes = self.chunk_bytes.clamp(4096, 64 * 1024 * 1024);
        self.queue_per_worker = self.queue_per_worker.max(1);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub command_timeout: Duration,
    #[serde(default = "default_bulk_limit")]
    pub bulk_limit: usize,
    /// `None` disables the snapshot sampler.
    #[serde(
        default = "default_snapshot_interval",
        deserialize_with = "spoolwatch_helpers::de::deserialize_optional_duration"
    )]
    pub snapshot_interval: Option<Duration>,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            bulk_limit: default_bulk_limit(),
            snapshot_interval: default_snapshot_interval(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl QueueConfig {
    fn normalize(&mut self) {
        self.command_timeout = self.command_timeout.max(Duration::from_secs(1));
        self.bulk_limit = self.bulk_limit.max(1);
        self.snapshot_interval = self
            .snapshot_interval
            .map(|interval| interval.max(Duration::from_secs(1)));
        self.bus_capacity = self.bus_capacity.max(1);
    }
}

/// Horizons are ages; `None` keeps rows of that kind forever.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(
        default = "default_retention_interval",
        deserialize_with = "spoolwatch_helpers::de::deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_log_events_retention",
        deserialize_with = "spoolwatch_helpers::de::deserialize_optional_duration"
    )]
    pub log_events: Option<Duration>,
    #[serde(
        default = "default_audit_retention",
        deserialize_with = "spoolwatch_helpers::de::deserialize_optional_duration"
    )]
    pub audit: Option<Duration>,
    #[serde(
        default = "default_snapshot_retention",
        deserialize_with = "spoolwatch_helpers::de::deserialize_optional_duration"
    )]
    pub snapshots: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: default_retention_interval(),
            log_events: default_log_events_retention(),
            audit: default_audit_retention(),
            snapshots: default_snapshot_retention(),
        }
    }
}

impl RetentionConfig {
    pub fn enabled(&self) -> bool {
        self.log_events.is_some() || self.audit.is_some() || self.snapshots.is_some()
    }

    fn normalize(&mut self) {
        self.interval = self.interval.max(Duration::from_secs(60));
    }
}

fn default_exim_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/exim")
}

fn default_logs() -> Vec<LogFileConfig> {
    vec![
        LogFileConfig {
            path: PathBuf::from("/var/log/exim/mainlog"),
            source: LogSource::Main,
        },
        LogFileConfig {
            path: PathBuf::from("/var/log/exim/rejectlog"),
            source: LogSource::Reject,
        },
        LogFileConfig {
            path: PathBuf::from("/var/log/exim/paniclog"),
            source: LogSource::Panic,
        },
    ]
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_flush_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_unknown_warn_threshold() -> u64 {
    100
}

fn default_unknown_warn_window() -> Duration {
    Duration::from_secs(60)
}

fn default_backlog_workers() -> usize {
    4
}

fn default_backlog_chunk_bytes() -> usize {
    1024 * 1024
}

fn default_backlog_queue_per_worker() -> usize {
    1024
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bulk_limit() -> usize {
    500
}

fn default_snapshot_interval() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_log_events_retention() -> Option<Duration> {
    Some(Duration::from_secs(90 * 86_400))
}

fn default_audit_retention() -> Option<Duration> {
    Some(Duration::from_secs(365 * 86_400))
}

fn default_snapshot_retention() -> Option<Duration> {
    Some(Duration::from_secs(30 * 86_400))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_exim_defaults() {
        let config = parse("database_url: mysql://u:p@localhost/spool\n").unwrap();
        assert_eq!(config.exim_binary, PathBuf::from("/usr/sbin/exim"));
        assert_eq!(config.logs.len(), 3);
        assert_eq!(config.logs[1].source, LogSource::Reject);
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.queue.snapshot_interval, Some(Duration::from_secs(300)));
        assert!(config.retention.enabled());
    }

    #[test]
    fn durations_accept_text_and_clamp() {
        let config = parse(
            "database_url: mysql://x\n\
             ingest:\n  flush_interval: 1ms\n  batch_size: 0\n\
             queue:\n  snapshot_interval: ''\n\
             retention:\n  log_events: 7d\n  audit: ''\n",
        )
        .unwrap();
        assert_eq!(config.ingest.flush_interval, Duration::from_millis(10));
        assert_eq!(config.ingest.batch_size, 1);
        assert_eq!(config.queue.snapshot_interval, None);
        assert_eq!(config.retention.log_events, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(config.retention.audit, None);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(parse("database_url: ''\n").is_err());
        assert!(parse("database_url: x\nlisten: 1\n").is_err());
        assert!(parse("database_url: x\nexim_binary: exim\n").is_err());
        assert!(
            parse("database_url: x\nlogs:\n  - path: mainlog\n    source: main\n")
                .is_err()
        );
        assert!(
            parse(
                "database_url: x\nlogs:\n  - path: /a\n    source: main\n  - path: /a\n    source: reject\n"
            )
            .is_err()
        );
        assert!(
            parse("database_url: x\nlogs:\n  - path: /a\n    source: debug\n").is_err()
        );
    }

    #[test]
    fn cli_arg_parsing() {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(parse_config_path_arg(args(&[]).into_iter()).unwrap(), None);
        assert_eq!(
            parse_config_path_arg(args(&["/etc/spoolwatch.yaml"]).into_iter()).unwrap(),
            Some(PathBuf::from("/etc/spoolwatch.yaml"))
        );
        assert!(parse_config_path_arg(args(&["a", "b"]).into_iter()).is_err());
        assert!(parse_config_path_arg(args(&["--help"]).into_iter()).is_err());
    }

    #[test]
    fn load_from_reads_file() {
        let dir = std::env::temp_dir().join(format!("spoolwatch-config-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("spoolwatch.yaml");
        std::fs::write(
            &path,
            "database_url: mysql://x\nlogs:\n  - path: /var/log/exim/mainlog\n    source: main\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.logs.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
