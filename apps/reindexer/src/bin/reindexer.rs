use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reindexer::build_reindexer;
use reindexer::config::Config;
use serde::Serialize;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "reindexer")]
#[command(about = "Online rebuilds of bloated postgres indexes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the bookkeeping schema if it does not exist.
    Migrate,
    /// Clean up, drain the queue, then rebuild the most bloated candidates.
    RunOnce,
    /// Queue one index, given as `schema.index`, for the next run.
    Enqueue { identifier: String },
    /// Actions started in the last N days.
    Recent {
        #[arg(long)]
        days: Option<u32>,
    },
    /// The rebuild currently in flight, if any.
    InFlight,
    /// Pending queue entries, oldest first.
    Queued,
    /// Drop temporary indexes left by interrupted rebuilds.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("load reindexer config")?;
    let (db, reindexer) = build_reindexer(&config).await?;

    match cli.command {
        Command::Migrate => {
            db.apply_schema().await?;
            print_json(&json!({ "migrated": true }))
        }
        Command::RunOnce => print_json(&reindexer.run_once().await?),
        Command::Enqueue { identifier } => print_json(&reindexer.enqueue(&identifier).await?),
        Command::Recent { days } => {
            let days = days.unwrap_or(config.recent_window_days);
            print_json(&reindexer.recent_actions(days).await?)
        }
        Command::InFlight => print_json(&reindexer.in_flight().await?),
        Command::Queued => print_json(&reindexer.queued().await?),
        Command::Cleanup => {
            let dropped = reindexer.cleanup_leftovers().await?;
            print_json(&json!({ "dropped": dropped }))
        }
    }
}

// Logs go to stderr so stdout carries only the JSON result.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logs = std::env::var("REINDEX_LOG_FORMAT")
        .is_ok_and(|format| format.trim().eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("encode output")?;
    writeln!(stdout).context("write output")?;
    Ok(())
}
