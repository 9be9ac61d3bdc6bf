//! `antiscan full`: install dependencies, download the lists, enforce them
//! and make everything survive a reboot.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::enforcer::{
    ChainReconciler, ChainState, FillReport, IpsetManager, SafetyGateResult, UfwIntegrator,
};
use crate::error::AntiscanError;
use crate::fetcher::{Fetcher, NetworkList};
use crate::installer::logging::LoggingSetup;
use crate::installer::{check_root, Installer};
use crate::lock::LockGuard;
use crate::persistence::{Mechanism, PersistenceManager};
use crate::pipeline::{Pipeline, RunReport};
use crate::utils::format_count;

/// State carried from step to step.
#[derive(Debug, Default)]
pub struct RunState {
    pub gate: SafetyGateResult,
    pub fill: FillReport,
    pub chains: Vec<ChainState>,
    pub mechanism: Option<Mechanism>,
}

/// Run the full command
pub async fn run(urls: Vec<String>, enable_logging: bool, config_path: &Path) -> Result<()> {
    check_root()?;

    if urls.is_empty() {
        return Err(
            AntiscanError::Config("at least one --urls value is required".to_string()).into(),
        );
    }

    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let _lock = LockGuard::acquire(&config.paths.lock_file)?;

    let runner = CommandRunner::real();
    let mut state = RunState::default();

    prepare(&runner, &config, &mut state)?;

    let fetcher = Fetcher::new()?;
    let networks = fetcher.download(&urls).await;
    if networks.is_empty() {
        return Err(AntiscanError::NoSubnets.into());
    }

    let report = apply(&runner, &config, &networks, enable_logging, &mut state)?;
    print_summary(&config, &networks, &state, &report, enable_logging);
    Ok(())
}

/// Host checks that must pass before anything is downloaded or changed.
pub fn prepare(runner: &CommandRunner, config: &Config, state: &mut RunState) -> Result<RunReport> {
    Pipeline::new()
        .fatal("ufw safety gate", |s: &mut RunState| {
            s.gate = UfwIntegrator::new(runner, config, false).check_ssh_gate()?;
            Ok(())
        })
        .fatal("dependencies", |_| Installer::new(runner, config).ensure_dependencies())
        .fatal("persistence helper", |_| {
            PersistenceManager::new(runner, config).ensure_helper()
        })
        .run(state)
}

/// Enforce `networks` and persist the result.
///
/// The chain hooks INPUT directly only when UFW is absent. With UFW
/// installed the hook lives in its before-input chain, which UFW itself
/// reaches from INPUT.
pub fn apply(
    runner: &CommandRunner,
    config: &Config,
    networks: &NetworkList,
    enable_logging: bool,
    state: &mut RunState,
) -> Result<RunReport> {
    let ipsets = IpsetManager::new(runner, &config.names);
    let persistence = PersistenceManager::new(runner, config);

    let mut pipeline = Pipeline::new()
        .fatal("setup ipsets", |_: &mut RunState| ipsets.setup())
        .fatal("fill ipsets", |s| {
            s.fill = ipsets.fill(networks);
            Ok(())
        })
        .fatal("setup chains", |s| {
            let link_to_input = !s.gate.installed;
            s.chains =
                ChainReconciler::new(runner, config, enable_logging).setup_chains(link_to_input)?;
            Ok(())
        });

    if enable_logging {
        pipeline =
            pipeline.recoverable("setup logging", |_| LoggingSetup::new(runner, config).setup());
    }

    pipeline
        .recoverable("save ipsets", |_| persistence.save_ipsets())
        .recoverable("ipset restore unit", |_| persistence.install_restore_unit())
        .fatal("save rules", |s| {
            s.mechanism = Some(persistence.save_rules(&s.gate, enable_logging)?);
            Ok(())
        })
        .run(state)
}

fn print_summary(
    config: &Config,
    networks: &NetworkList,
    state: &RunState,
    report: &RunReport,
    enable_logging: bool,
) {
    info!(
        ipv4_added = state.fill.v4.added,
        ipv6_added = state.fill.v6.added,
        errors = state.fill.total_errors(),
        warnings = report.warnings.len(),
        "Installation complete"
    );

    println!(
        "[OK] {} subnets downloaded ({} IPv4, {} IPv6)",
        format_count(networks.len()),
        format_count(networks.ipv4.len()),
        format_count(networks.ipv6.len())
    );
    println!(
        "[OK] ipsets {} / {} filled ({} entries, {} rejected)",
        config.names.set_v4,
        config.names.set_v6,
        format_count(state.fill.total_added()),
        state.fill.total_errors()
    );
    println!("[OK] Chain {} configured for IPv4 and IPv6", config.names.chain);
    if let Some(mechanism) = state.mechanism {
        println!("[OK] Rules persisted via {}", mechanism);
    }
    if enable_logging {
        println!(
            "[OK] Logging enabled, statistics in {}",
            config.paths.aggregate_csv.display()
        );
    }
    for (step, error) in &report.warnings {
        println!("[WARN] {}: {}", step, error);
    }
}
