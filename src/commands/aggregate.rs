//! `antiscan aggregate`: one log aggregation cycle, run by the systemd timer.

use anyhow::{Context, Result};
use std::path::Path;

use crate::aggregate::{run_cycle, TcpWhois};
use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::lock::LockGuard;
use crate::utils::format_count;

/// Run the aggregate command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let _lock = LockGuard::acquire(&config.paths.aggregate_lock_file)?;

    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let report = run_cycle(
        &CommandRunner::real(),
        &config,
        TcpWhois::new(&config.whois.server),
        now,
    )
    .await?;

    if report.rewritten {
        println!(
            "[OK] {} hits from {} addresses merged, {} entries in {}",
            format_count(report.hits as usize),
            format_count(report.addresses),
            format_count(report.table_size),
            config.paths.aggregate_csv.display()
        );
    } else {
        println!("[OK] No new log entries");
    }
    Ok(())
}
