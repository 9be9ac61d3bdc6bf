//! antiscan - block known Internet scanners on Linux hosts.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use antiscan::cli::{Cli, Commands};

/// Map `--log-level` to a tracing level; anything unrecognised is INFO.
fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&cli.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Full {
            urls,
            enable_logging,
        } => antiscan::commands::full::run(urls, enable_logging, &cli.config).await,
        Commands::Aggregate => antiscan::commands::aggregate::run(&cli.config).await,
    }
}
