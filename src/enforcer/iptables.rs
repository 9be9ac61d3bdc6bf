//! iptables/ip6tables chains.
//!
//! [`IptablesCommands`] is one family's view of the packet filter.
//! [`ChainReconciler`] brings the block chain to its desired state:
//! chain present and flushed, hooked at most once, optional LOG rule on
//! top, exactly one DROP rule at the tail. Running it twice leaves the
//! host exactly as running it once.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::rule::{RuleBuilder, RuleSpec, Target};
use super::Family;
use crate::cmd_abstraction::CommandRunner;
use crate::config::{Config, LogRuleConfig, Names};
use crate::error::CommandError;

/// Built-in chain the block chain hooks into when UFW is not managing the host.
pub const INPUT_CHAIN: &str = "INPUT";

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

/// One family's packet filter, driven through `iptables` or `ip6tables`.
pub struct IptablesCommands<'a> {
    runner: &'a CommandRunner,
    family: Family,
}

impl<'a> IptablesCommands<'a> {
    pub fn new(runner: &'a CommandRunner, family: Family) -> Self {
        Self { runner, family }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn cmd(&self) -> &'static str {
        self.family.iptables_cmd()
    }

    pub fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.runner
            .run_quiet(self.cmd(), &["-t", table.as_str(), "-L", chain, "-n"])
    }

    pub fn create_chain(&self, table: Table, chain: &str) -> Result<(), CommandError> {
        debug!(family = %self.family, table = table.as_str(), chain, "Creating chain");
        self.runner.run(self.cmd(), &["-t", table.as_str(), "-N", chain])
    }

    pub fn flush_chain(&self, table: Table, chain: &str) -> Result<(), CommandError> {
        debug!(family = %self.family, table = table.as_str(), chain, "Flushing chain");
        self.runner.run(self.cmd(), &["-t", table.as_str(), "-F", chain])
    }

    pub fn delete_chain(&self, table: Table, chain: &str) -> Result<(), CommandError> {
        debug!(family = %self.family, table = table.as_str(), chain, "Deleting chain");
        self.runner.run(self.cmd(), &["-t", table.as_str(), "-X", chain])
    }

    pub fn rule_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> bool {
        let mut args = vec!["-t", table.as_str(), "-C", chain];
        args.extend(rule.to_args());
        self.runner.run_quiet(self.cmd(), &args)
    }

    pub fn append_rule(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), CommandError> {
        debug!(family = %self.family, chain, rule = %rule, "Appending rule");
        let mut args = vec!["-t", table.as_str(), "-A", chain];
        args.extend(rule.to_args());
        self.runner.run(self.cmd(), &args)
    }

    /// Insert at 1-based `position`; `None` lets iptables pick the head.
    pub fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: Option<u32>,
        rule: &RuleSpec,
    ) -> Result<(), CommandError> {
        debug!(family = %self.family, chain, position, rule = %rule, "Inserting rule");
        let pos = position.map(|p| p.to_string());
        let mut args = vec!["-t", table.as_str(), "-I", chain];
        if let Some(ref pos) = pos {
            args.push(pos);
        }
        args.extend(rule.to_args());
        self.runner.run(self.cmd(), &args)
    }

    pub fn delete_rule(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), CommandError> {
        debug!(family = %self.family, chain, rule = %rule, "Deleting rule");
        let mut args = vec!["-t", table.as_str(), "-D", chain];
        args.extend(rule.to_args());
        self.runner.run(self.cmd(), &args)
    }

    pub fn list_chain(&self, table: Table, chain: &str) -> Result<String, CommandError> {
        self.runner
            .run_captured(self.cmd(), &["-t", table.as_str(), "-L", chain, "-n", "-v"])
    }

    /// Full ruleset dump in iptables-restore format.
    pub fn save(&self) -> Result<String, CommandError> {
        self.runner.run_stdout(self.family.save_cmd(), &[])
    }

    /// Load a ruleset dump through `iptables-restore`.
    pub fn restore(&self, dump: &str) -> Result<(), CommandError> {
        self.runner.run_with_stdin(self.family.restore_cmd(), &[], dump)
    }
}

/// `-j <chain>`: the rule that sends traffic into the block chain.
pub fn hook_rule(chain: &str) -> RuleSpec {
    RuleBuilder::new()
        .jump(Target::Chain(chain.to_string()))
        .build()
}

/// Rate-limited LOG rule for packets sourced from the family's set.
pub fn log_rule(names: &Names, logging: &LogRuleConfig, family: Family) -> RuleSpec {
    RuleBuilder::new()
        .match_set(names.set(family), "src")
        .match_limit(&logging.rate, Some(logging.burst))
        .jump(Target::Log)
        .log_prefix(names.log_prefix(family))
        .log_level(logging.level)
        .build()
}

pub fn drop_rule(names: &Names, family: Family) -> RuleSpec {
    RuleBuilder::new()
        .match_set(names.set(family), "src")
        .jump(Target::Drop)
        .build()
}

/// How traffic reaches the block chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Unhooked,
    /// `-j CHAIN` at position 1 of INPUT
    HookedToInput,
    /// Reached through UFW's before-input chain
    HookedViaUfw,
}

/// Resulting state of one family's block chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub family: Family,
    pub table: Table,
    pub chain: String,
    pub hook: HookState,
    pub log_rule: Option<RuleSpec>,
    pub drop_rule: RuleSpec,
}

pub struct ChainReconciler<'a> {
    runner: &'a CommandRunner,
    config: &'a Config,
    enable_logging: bool,
}

impl<'a> ChainReconciler<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a Config, enable_logging: bool) -> Self {
        Self {
            runner,
            config,
            enable_logging,
        }
    }

    /// Reconcile both families, IPv4 first. The first failure aborts.
    pub fn setup_chains(&self, link_to_input: bool) -> Result<Vec<ChainState>> {
        info!("Setting up iptables chains");
        if !link_to_input {
            info!("UFW is installed, chains will be reached through ufw-before-input");
        }

        let mut states = Vec::with_capacity(Family::ALL.len());
        for family in Family::ALL {
            let state = self
                .reconcile(family, link_to_input)
                .with_context(|| format!("Failed to setup {} chain", family))?;
            states.push(state);
        }

        info!("iptables chains configured");
        Ok(states)
    }

    pub fn reconcile(&self, family: Family, link_to_input: bool) -> Result<ChainState> {
        let ipt = IptablesCommands::new(self.runner, family);
        let names = &self.config.names;
        let chain = names.chain.as_str();
        let table = Table::Filter;

        if ipt.chain_exists(table, chain) {
            info!(chain, family = %family, "Flushing existing chain");
            ipt.flush_chain(table, chain).context("Failed to flush chain")?;
        } else {
            info!(chain, family = %family, "Creating chain");
            ipt.create_chain(table, chain).context("Failed to create chain")?;
        }

        let hook = if link_to_input {
            let jump = hook_rule(chain);
            if !ipt.rule_exists(table, INPUT_CHAIN, &jump) {
                info!(family = %family, "Linking chain to INPUT");
                ipt.insert_rule(table, INPUT_CHAIN, Some(1), &jump)
                    .context("Failed to link chain to INPUT")?;
            }
            HookState::HookedToInput
        } else {
            HookState::HookedViaUfw
        };

        let log = if self.enable_logging {
            let log = log_rule(names, &self.config.logging, family);
            if !ipt.rule_exists(table, chain, &log) {
                info!(family = %family, "Adding LOG rule");
                ipt.insert_rule(table, chain, Some(1), &log)
                    .context("Failed to add LOG rule")?;
            }
            Some(log)
        } else {
            None
        };

        let drop = drop_rule(names, family);
        if !ipt.rule_exists(table, chain, &drop) {
            info!(family = %family, "Adding DROP rule");
            ipt.append_rule(table, chain, &drop)
                .context("Failed to add DROP rule")?;
        }

        Ok(ChainState {
            family,
            table,
            chain: chain.to_string(),
            hook,
            log_rule: log,
            drop_rule: drop,
        })
    }
}
