//! Log aggregation: one cycle turns the raw per-family LOG files into
//! updated per-address counters with ASN and netname.
//!
//! ```text
//! raw logs ──grab+truncate──▶ parse ──▶ WHOIS (cached) ──▶ merge ──▶ sorted table
//! ```

pub mod logs;
pub mod table;
pub mod whois;

pub use logs::{grab_and_truncate, parse_log, Hit, LogBatch};
pub use table::{AggregateRecord, AggregateTable, BatchEntry, HEADER};
pub use whois::{parse_whois, IpInfo, IpInfoLookup, TcpWhois, WhoisCache, WhoisResolver, UNKNOWN};

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::enforcer::Family;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Distinct (family, address) pairs in the batch
    pub addresses: usize,
    /// Log lines counted
    pub hits: u64,
    pub whois_queries: usize,
    /// Whether the table file was rewritten
    pub rewritten: bool,
    pub table_size: usize,
}

/// Run one aggregation cycle against the files named in `config`.
///
/// `now` is the unix time used for cache expiry.
pub async fn run_cycle<R: WhoisResolver>(
    runner: &CommandRunner,
    config: &Config,
    resolver: R,
    now: u64,
) -> Result<CycleReport> {
    let paths = &config.paths;
    let mut report = CycleReport::default();

    let cache = WhoisCache::load(
        &paths.whois_cache,
        Duration::from_secs(config.whois.cache_ttl_secs),
        now,
    )
    .context("Failed to load WHOIS cache")?;

    // the table must be loadable and replaceable before any log is consumed
    if table::ensure_table(&paths.aggregate_csv)
        .context("Failed to create aggregate table")?
    {
        info!(path = %paths.aggregate_csv.display(), "Created aggregate table");
    }
    let mut counters =
        AggregateTable::load(&paths.aggregate_csv).context("Failed to load aggregate table")?;
    table::check_writable(&paths.aggregate_csv)
        .context("Aggregate table cannot be rewritten")?;

    let mut batches = Vec::with_capacity(Family::ALL.len());
    for family in Family::ALL {
        let path = paths.raw_log(family);
        let content = match grab_and_truncate(runner, path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{:#}", e), "Failed to grab log");
                String::new()
            }
        };
        let batch = parse_log(&content, config.names.log_prefix(family), family);
        debug!(family = %family, addresses = batch.len(), "Parsed raw log");
        batches.push((family, batch));
    }

    report.addresses = batches.iter().map(|(_, b)| b.len()).sum();
    if report.addresses == 0 {
        debug!("No new log entries");
        return Ok(report);
    }

    let mut lookup = IpInfoLookup::new(
        resolver,
        cache,
        Duration::from_secs(config.whois.timeout_secs),
    );

    for (family, batch) in batches {
        for (address, hit) in batch {
            let info = lookup.lookup(&address, now).await;
            report.hits += hit.count;
            counters.merge(BatchEntry {
                family,
                address,
                count: hit.count,
                last_seen: hit.last_seen,
                info: (!info.is_unknown()).then_some(info),
            });
        }
    }

    counters
        .save(&paths.aggregate_csv)
        .context("Failed to write aggregate table")?;

    report.whois_queries = lookup.queries();
    report.rewritten = true;
    report.table_size = counters.len();

    let unresolved = counters
        .sorted()
        .into_iter()
        .filter(|r| table::is_unresolved(r))
        .count();
    info!(
        addresses = report.addresses,
        hits = report.hits,
        whois_queries = report.whois_queries,
        table_size = report.table_size,
        unresolved,
        "Aggregation cycle complete"
    );
    Ok(report)
}
