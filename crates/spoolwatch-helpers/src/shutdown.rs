use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` on SIGTERM or SIGINT (ctrl-c elsewhere).
pub async fn listen_shutdown(token: CancellationToken) {
    let signal_name = wait_for_signal().await;
    warn!("shutdown signal received: {signal_name}");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to install unix signal handlers: error={err}");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

/// Runs a shutdown step with a deadline. Returns `None` when it timed out so
/// callers can log what was abandoned.
pub async fn with_deadline<F, T>(
    deadline: Duration,
    step: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, step).await.ok()
}
