//! Sightline - send telemetry events from the command line.
//!
//! # Commands
//!
//! - `sightline track <name> [--data JSON]`: Send one custom event
//! - `sightline pipe`: Track every JSON line read from stdin
//!
//! # Environment Variables
//!
//! See the `config` module of the library for available configuration options.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sightline_sdk::config::MonitorOptions;
use sightline_sdk::monitor::Monitor;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Sightline - telemetry SDK command line.
///
/// Sends custom events to a collection endpoint through the full SDK
/// pipeline: enrichment, hooks, batching and delivery.
#[derive(Parser, Debug)]
#[command(name = "sightline")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SIGHTLINE_DSN_URL               Collection endpoint (required)
    SIGHTLINE_USER_ID               User identifier (required)
    SIGHTLINE_PROJECT_ID            Project identifier (default: default)
    SIGHTLINE_FRAMEWORK             normal, react or vue (default: normal)
    SIGHTLINE_SAMPLE_RATE           Session sampling rate 0-1 (default: 1)
    SIGHTLINE_PLUGINS               Comma-separated plugin categories
    SIGHTLINE_UPLOAD_INTERVAL_SECS  Periodic flush interval (default: 30)

EXAMPLES:
    # Send a single event
    export SIGHTLINE_DSN_URL=https://collect.example/report
    export SIGHTLINE_USER_ID=user-42
    sightline track deploy --data '{\"version\": \"1.4.0\"}'

    # Stream events, one JSON object per line
    tail -f events.jsonl | sightline pipe
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Send one custom event and flush.
    Track {
        /// Event type.
        name: String,

        /// Event fields as JSON. Non-object values are stored under `data`.
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Track JSON lines from stdin until EOF or Ctrl+C.
    ///
    /// Each line is an object with a `name` (or `type`) field; the remaining
    /// fields become the event's data.
    Pipe,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    init_logging();

    let options = MonitorOptions::from_env().context("Failed to load configuration")?;
    let monitor = Monitor::new();
    monitor
        .init(options)
        .await
        .context("Failed to initialize monitor")?;

    info!(session_id = %monitor.session_id(), "Monitor started");

    match command {
        Command::Track { name, data } => {
            let data = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data is not valid JSON")?,
                None => Value::Null,
            };
            monitor.track(name, data).await;
        }
        Command::Pipe => pipe(&monitor).await?,
    }

    info!("Shutting down...");
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), monitor.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT_SECS,
            "Shutdown timed out, some events may not have been sent"
        );
    }

    info!("Monitor stopped");
    Ok(())
}

/// Tracks stdin lines until EOF or a shutdown signal.
async fn pipe(monitor: &Monitor) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut tracked = 0usize;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("End of input");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok((name, data)) => {
                        monitor.track(name, data).await;
                        tracked += 1;
                    }
                    Err(e) => warn!(error = %e, "Skipping line"),
                }
            }
        }
    }

    info!(events = tracked, "Input finished");
    Ok(())
}

/// Splits a JSON line into an event name and its data.
fn parse_line(line: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(line).context("invalid JSON")?;
    let Value::Object(mut fields) = value else {
        bail!("expected a JSON object");
    };

    let name = match fields.remove("name").or_else(|| fields.remove("type")) {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => bail!("missing string field 'name'"),
    };

    let data = match fields.remove("data") {
        Some(data) if fields.is_empty() => data,
        Some(data) => {
            fields.insert("data".to_string(), data);
            Value::Object(fields)
        }
        None => Value::Object(fields),
    };
    Ok((name, data))
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_line_uses_name_and_remaining_fields() {
        let (name, data) = parse_line(r#"{"name": "deploy", "version": "1.4.0"}"#).unwrap();
        assert_eq!(name, "deploy");
        assert_eq!(data, json!({"version": "1.4.0"}));
    }

    #[test]
    fn parse_line_accepts_type_and_data() {
        let (name, data) = parse_line(r#"{"type": "note", "data": "hello"}"#).unwrap();
        assert_eq!(name, "note");
        assert_eq!(data, json!("hello"));
    }

    #[test]
    fn parse_line_keeps_data_next_to_other_fields() {
        let (_, data) = parse_line(r#"{"name": "n", "data": 1, "extra": 2}"#).unwrap();
        assert_eq!(data, json!({"data": 1, "extra": 2}));
    }

    #[test]
    fn parse_line_rejects_bad_input() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line("[1, 2]").is_err());
        assert!(parse_line(r#"{"data": 1}"#).is_err());
        assert!(parse_line(r#"{"name": 5}"#).is_err());
    }

    #[test]
    fn cli_parses_track_with_data() {
        let cli = Cli::try_parse_from(["sightline", "track", "deploy", "--data", "{}"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Track { ref name, data: Some(_) } if name == "deploy"
        ));
    }
}
