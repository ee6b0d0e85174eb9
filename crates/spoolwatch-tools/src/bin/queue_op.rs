use std::env;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use spoolwatch_helpers::logging;
use spoolwatch_model::ActorContext;
use spoolwatch_server::app::AppState;
use spoolwatch_server::config::{Config, resolve_config_path};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "spoolwatch_server=warn,audit=info,sqlx=warn",
        "SPOOLWATCH_LOG",
        "spoolwatch-queue-op",
    );

    let args = Args::parse(env::args().skip(1))?;
    let config = Config::load_from(&args.config)?;
    let state = AppState::connect(config).await?;
    let actor = local_actor();
    println!("queue-op start: {}, actor={}", args, actor.actor_id);

    let failed = if let [message_id] = args.message_ids.as_slice() {
        match state.mediator.execute_str(&args.operation, message_id, &actor).await {
            Ok(result) => {
                println!(
                    "{} {}: {}{}",
                    result.operation,
                    result.message_id,
                    result.outcome,
                    result.message.map(|text| format!(" ({text})")).unwrap_or_default()
                );
                !result.outcome.is_success()
            }
            Err(err) => {
                println!("{} {}: rejected ({})", args.operation, message_id, err);
                true
            }
        }
    } else {
        let result = state
            .mediator
            .execute_bulk_str(&args.operation, &args.message_ids, &actor)
            .await?;
        let operation = result.operation;
        for item in &result.items {
            match (&item.outcome, &item.error) {
                (Some(outcome), None) => println!("{} {}: {}", operation, item.message_id, outcome),
                (_, error) => println!(
                    "{} {}: failed ({})",
                    operation,
                    item.message_id,
                    error.as_deref().unwrap_or("operation failed")
                ),
            }
        }
        println!("completed: succeeded={}, failed={}", result.succeeded, result.failed);
        result.failed > 0
    };

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Local operators are identified by login name; `sudo` keeps the invoking
/// user.
fn local_actor() -> ActorContext {
    let actor_id = ["SUDO_USER", "USER", "LOGNAME"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_default();
    ActorContext::new(actor_id, Some("local".to_string()))
}

#[derive(Debug, Clone)]
struct Args {
    operation: String,
    message_ids: Vec<String>,
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

        let mut positional = positional.into_iter();
        let operation = positional.next().ok_or_else(|| {
            print_usage();
            anyhow!("missing operation")
        })?;
        let message_ids: Vec<String> = positional.collect();
        if message_ids.is_empty() {
            print_usage();
            return Err(anyhow!("missing message id"));
        }

        Ok(Self {
            operation,
            message_ids,
            config: config
                .or_else(resolve_config_path)
                .context("config path not found (--config or SPOOLWATCH_CONFIG_PATH)")?,
        })
    }
}

fn print_usage() {
    eprintln!(
        "usage: queue-op <deliver|freeze|thaw|delete> <message-id>... [--config spoolwatch.yaml]"
    );
}

impl fmt::Display for Args {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "operation={}, messages={}, config={}",
            self.operation,
            self.message_ids.len(),
            self.config.display()
        )
    }
}
