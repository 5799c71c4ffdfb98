//! Parley CLI - exercise the correlation engine against an in-memory broker.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parley_correlation::{CorrelationMode, LoopbackBehavior};
use tracing::info;

mod config;
mod loadgen;
mod telemetry;

use config::Settings;
use loadgen::LoadgenOptions;

/// Parley - request/reply correlation over message brokers
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/parley/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs and reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run requests through a loopback broker and report the outcomes
    Loopback(LoopbackArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    /// Total requests to send
    #[arg(short = 'n', long)]
    requests: Option<usize>,

    /// Requests in flight at once
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Request body size in bytes
    #[arg(long)]
    payload_size: Option<usize>,

    /// Correlate on the caller's own key instead of the broker id
    #[arg(long)]
    provisional: bool,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Delay before each message is sent, in milliseconds
    #[arg(long, default_value_t = 0)]
    send_delay_ms: u64,

    /// Delay between send notification and reply, in milliseconds
    #[arg(long, default_value_t = 0)]
    reply_delay_ms: u64,

    /// Publish replies before the send notification
    #[arg(long)]
    reply_first: bool,

    /// Do not report broker message ids on send
    #[arg(long)]
    no_assign: bool,

    /// Report an unreadable message id on send
    #[arg(long)]
    fail_assignment: bool,

    /// Publish every reply twice
    #[arg(long)]
    duplicates: bool,

    /// Drop every n-th reply
    #[arg(long)]
    drop_every: Option<u64>,
}

impl LoopbackArgs {
    fn options(&self, settings: &Settings) -> LoadgenOptions {
        LoadgenOptions {
            requests: self.requests.unwrap_or(settings.loadgen.requests),
            concurrency: self.concurrency.unwrap_or(settings.loadgen.concurrency),
            payload_size: self.payload_size.unwrap_or(settings.loadgen.payload_size),
            timeout: self.timeout_ms.map(Duration::from_millis),
            behavior: LoopbackBehavior {
                send_delay: Duration::from_millis(self.send_delay_ms),
                reply_delay: Duration::from_millis(self.reply_delay_ms),
                assign_ids: !self.no_assign,
                fail_assignment: self.fail_assignment,
                reply_first: self.reply_first,
                duplicate_replies: self.duplicates,
                drop_every: self.drop_every,
                echo_provisional: false,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.json)?;

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", settings.to_toml()?);
        }
        Commands::Loopback(args) => {
            if args.provisional {
                settings.correlation.mode = CorrelationMode::Provisional;
            }
            let options = args.options(&settings);
            info!(version = env!("CARGO_PKG_VERSION"), "Parley loopback starting");

            let report = loadgen::run(settings.correlation, options).await?;
            if cli.json {
                let rendered =
                    serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
                println!("{rendered}");
            } else {
                println!("{}", report.render());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_loopback_flags_map_to_behavior() {
        let cli = Cli::parse_from([
            "parley",
            "loopback",
            "-n",
            "5",
            "--reply-first",
            "--no-assign",
            "--fail-assignment",
            "--drop-every",
            "3",
            "--reply-delay-ms",
            "20",
        ]);
        let Commands::Loopback(args) = cli.command else {
            panic!("expected loopback command");
        };

        let options = args.options(&Settings::default());
        assert_eq!(options.requests, 5);
        assert_eq!(options.concurrency, 64);
        assert!(options.behavior.reply_first);
        assert!(!options.behavior.assign_ids);
        assert!(options.behavior.fail_assignment);
        assert!(!options.behavior.duplicate_replies);
        assert_eq!(options.behavior.drop_every, Some(3));
        assert_eq!(options.behavior.reply_delay, Duration::from_millis(20));
        assert_eq!(options.timeout, None);
    }
}
