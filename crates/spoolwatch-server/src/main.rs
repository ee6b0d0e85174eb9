use anyhow::{Context, Result};
use spoolwatch_helpers::{logging, shutdown};
use spoolwatch_server::app::{self, AppState};
use spoolwatch_server::config::Config;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "spoolwatch_server=info,audit=info,notify=warn,sqlx=warn",
        "SPOOLWATCH_LOG",
        "spoolwatch-server",
    );

    let config = Config::load().context("failed to load configuration")?;
    info!(
        "server starting: logs={}, startup_backlog={}, snapshot_interval={:?}",
        config.logs.len(),
        config.backlog.startup_files.len(),
        config.queue.snapshot_interval
    );

    let state = AppState::connect(config).await?;
    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    app::run(state).await
}
