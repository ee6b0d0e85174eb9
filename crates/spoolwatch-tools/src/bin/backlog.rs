use std::env;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use spoolwatch_helpers::{logging, shutdown};
use spoolwatch_model::LogSource;
use spoolwatch_server::app::AppState;
use spoolwatch_server::config::{Config, resolve_config_path};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "spoolwatch_server=info,sqlx=warn",
        "SPOOLWATCH_LOG",
        "spoolwatch-backlog",
    );

    let args = Args::parse(env::args().skip(1))?;
    let config = Config::load_from(&args.config)?;
    let state = AppState::connect(config).await?;
    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    println!("backlog start: {}", args);

    let report = state
        .backlog_processor()
        .process_file_backlog(&args.path, args.source, &state.shutdown)
        .await?;

    println!(
        "completed: run={}, lines={}, unknown={}, batches_dropped={}, cancelled={}, elapsed_ms={}",
        report.run_id,
        report.lines_processed,
        report.unknown_lines,
        report.batches_dropped,
        report.cancelled,
        report.elapsed.as_millis()
    );

    if report.cancelled || report.batches_dropped > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Args {
    source: LogSource,
    path: PathBuf,
    config: PathBuf,
}

impl Args {
    fn parse<I>(mut it: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut config = None;

        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" => {
                    config = Some(PathBuf::from(
                        it.next().context("missing value for --config")?,
                    ));
                }
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => positional.push(arg),
            }
        }

        let [source, path] = <[String; 2]>::try_from(positional).map_err(|_| {
            print_usage();
            anyhow!("expected a log source and a path")
        })?;

        Ok(Self {
            source: source.parse::<LogSource>()?,
            path: PathBuf::from(path),
            config: config
                .or_else(resolve_config_path)
                .context("config path not found (--config or SPOOLWATCH_CONFIG_PATH)")?,
        })
    }
}

fn print_usage() {
    eprintln!("usage: backlog <main|reject|panic> <path> [--config spoolwatch.yaml]");
}

impl fmt::Display for Args {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "source={}, path={}, config={}",
            self.source,
            self.path.display(),
            self.config.display()
        )
    }
}
