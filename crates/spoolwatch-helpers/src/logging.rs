use std::env;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target used for the audit mirror so operators can route or filter the
/// administrative trail separately (`SPOOLWATCH_LOG=audit=info,...`).
pub const AUDIT_TARGET: &str = "audit";

/// Installs the global tracing subscriber.
///
/// Filter precedence: `env_key`, then `RUST_LOG`, then `default_filter`.
/// Under systemd the journald layer is used, otherwise a stderr formatter.
pub fn init_logging(
    default_filter: &str,
    env_key: &str,
    service_name: &str,
) {
    let env_filter = build_env_filter(default_filter, env_key);

    if is_running_under_systemd() {
        #[cfg(target_os = "linux")]
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer.with_syslog_identifier(service_name.to_string()))
                    .init();
                return;
            }
            Err(err) => {
                eprintln!(
                    "{service_name}: journald init failed, falling back to stderr formatter: {err}"
                );
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
        )
        .init();
}

fn build_env_filter(
    default_filter: &str,
    env_key: &str,
) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn is_running_under_systemd() -> bool {
    env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some()
}
