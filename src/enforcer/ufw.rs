//! UFW coexistence.
//!
//! When UFW is installed it owns the ruleset: it rebuilds its chains from
//! `/etc/ufw/before.rules` on every start. antiscan therefore persists its
//! chain as a marker-delimited section inside those files, reloads UFW, and
//! moves its hook back to the head of `ufw-before-input`.
//!
//! UFW is never switched from inactive to active unless an inbound SSH rule
//! is already configured; otherwise a remote host would lock its operator out.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{error, info, warn};

use super::iptables::{drop_rule, hook_rule, log_rule, IptablesCommands, Table};
use super::Family;
use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::error::{AntiscanError, SafetyGateError};
use crate::installer::templates::{self, MOVE_RULES_UNIT};
use crate::installer::write_unit;

const SSH_FILE_PATTERNS: &[&str] = &["dport 22", "dport ssh"];
const SSH_ADDED_PATTERNS: &[&str] = &["22/tcp", "22", "OpenSSH", "ssh"];

/// What the safety gate saw.
///
/// `ssh_rule_present` is only probed when UFW is installed and inactive;
/// it is `false` otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyGateResult {
    pub installed: bool,
    pub active: bool,
    pub ssh_rule_present: bool,
}

impl SafetyGateResult {
    /// Whether UFW may be (re-)enabled by antiscan.
    pub fn may_enable(&self) -> bool {
        self.active || self.ssh_rule_present
    }

    pub fn check(&self) -> Result<(), SafetyGateError> {
        if self.installed && !self.may_enable() {
            return Err(SafetyGateError::SshNotAllowed);
        }
        Ok(())
    }
}

/// Marker-delimited block inside a UFW before-rules file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSection {
    pub begin: String,
    pub body: Vec<String>,
    pub end: String,
}

/// Result of splicing a section into file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    AlreadyPresent,
    Inserted(String),
    /// No line equal to `COMMIT` to insert before
    NoCommit,
}

impl PersistedSection {
    pub fn render(&self) -> String {
        let mut out = String::from("\n");
        out.push_str(&self.begin);
        out.push('\n');
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.end);
        out.push_str("\n\n");
        out
    }

    /// Exact begin-marker line match.
    pub fn is_present_in(&self, content: &str) -> bool {
        content.lines().any(|l| l.trim_end() == self.begin)
    }

    /// Insert the rendered section before the last `COMMIT` line.
    pub fn inject_into(&self, content: &str) -> Injection {
        if self.is_present_in(content) {
            return Injection::AlreadyPresent;
        }

        let mut offset = 0;
        let mut last_commit = None;
        for line in content.split_inclusive('\n') {
            if line.trim_end() == "COMMIT" {
                last_commit = Some(offset);
            }
            offset += line.len();
        }

        match last_commit {
            Some(at) => {
                let mut out = String::with_capacity(content.len() + 512);
                out.push_str(&content[..at]);
                out.push_str(&self.render());
                out.push_str(&content[at..]);
                Injection::Inserted(out)
            }
            None => Injection::NoCommit,
        }
    }
}

pub struct UfwIntegrator<'a> {
    runner: &'a CommandRunner,
    config: &'a Config,
    enable_logging: bool,
}

impl<'a> UfwIntegrator<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a Config, enable_logging: bool) -> Self {
        Self {
            runner,
            config,
            enable_logging,
        }
    }

    /// UFW binary on PATH.
    pub fn detect(&self) -> bool {
        self.runner.command_exists("ufw")
    }

    /// `ufw status` reports active. Any failure reads as inactive.
    pub fn is_active(&self) -> bool {
        if !self.detect() {
            return false;
        }
        self.runner
            .run_captured_quiet("ufw", &["status"])
            .map(|out| out.contains("Status: active"))
            .unwrap_or(false)
    }

    /// Look for an inbound SSH allow rule: user rule files first, then `ufw show added`.
    pub fn ssh_rule_present(&self) -> bool {
        for family in Family::ALL {
            let path = self.config.paths.user_rules(family);
            if let Ok(content) = fs::read_to_string(path) {
                if SSH_FILE_PATTERNS.iter().any(|p| content.contains(p)) {
                    info!(path = %path.display(), "SSH rule found in UFW user rules");
                    return true;
                }
            }
        }

        if let Some(added) = self.runner.run_captured_quiet("ufw", &["show", "added"]) {
            if SSH_ADDED_PATTERNS.iter().any(|p| added.contains(p)) {
                info!("SSH rule found in 'ufw show added'");
                return true;
            }
        }

        false
    }

    pub fn evaluate_safety_gate(&self) -> SafetyGateResult {
        let installed = self.detect();
        let active = installed && self.is_active();
        let ssh_rule_present = installed && !active && self.ssh_rule_present();
        SafetyGateResult {
            installed,
            active,
            ssh_rule_present,
        }
    }

    /// Evaluate the gate and refuse to go on if enabling UFW would lock out SSH.
    pub fn check_ssh_gate(&self) -> Result<SafetyGateResult> {
        let gate = self.evaluate_safety_gate();
        if gate.installed && !gate.active {
            warn!("UFW is installed but inactive, checking SSH rules before enabling it");
        }
        if let Err(e) = gate.check() {
            error!("UFW has no SSH rule, enabling it would block remote access");
            return Err(e.into());
        }
        if gate.installed && !gate.active {
            info!("SSH rule found in UFW configuration");
        }
        Ok(gate)
    }

    pub fn section(&self, family: Family) -> PersistedSection {
        let names = &self.config.names;
        let chain = names.chain.as_str();

        let mut body = vec![
            "# DO NOT EDIT THIS SECTION MANUALLY".to_string(),
            format!(":{} - [0:0]", chain),
            hook_rule(chain).to_rules_line(names.ufw_input_chain(family)),
        ];
        if self.enable_logging {
            body.push(log_rule(names, &self.config.logging, family).to_rules_line(chain));
        }
        body.push(drop_rule(names, family).to_rules_line(chain));

        PersistedSection {
            begin: names.section_begin.clone(),
            body,
            end: names.section_end.clone(),
        }
    }

    /// Splice the family's section into its before-rules file.
    /// Returns `false` when the section was already there.
    pub fn inject_section(&self, family: Family) -> Result<bool> {
        let path = self.config.paths.before_rules(family);
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read UFW rules file {:?}", path))?;

        match self.section(family).inject_into(&content) {
            Injection::AlreadyPresent => {
                info!(path = %path.display(), "antiscan section already present");
                Ok(false)
            }
            Injection::NoCommit => Err(AntiscanError::MissingCommit(path.display().to_string()).into()),
            Injection::Inserted(updated) => {
                replace_file(path, &updated)?;
                info!(path = %path.display(), family = %family, "Updated UFW before rules");
                Ok(true)
            }
        }
    }

    /// IPv4 failures abort, IPv6 failures are warnings.
    pub fn inject_sections(&self) -> Result<()> {
        self.inject_section(Family::V4)?;
        if let Err(e) = self.inject_section(Family::V6) {
            warn!(error = %format!("{:#}", e), "Failed to update UFW IPv6 rules");
        }
        Ok(())
    }

    /// Restart UFW so it loads the before-rules files.
    ///
    /// Refuses to run when the gate says enabling UFW is unsafe.
    pub fn reload(&self, gate: &SafetyGateResult) -> Result<()> {
        gate.check()?;

        if !gate.active {
            warn!("UFW was inactive, enabling it now (SSH rule verified)");
        }
        info!("Restarting UFW to apply before rules");
        if let Err(e) = self.runner.run("ufw", &["--force", "disable"]) {
            warn!(error = %e, "Failed to disable UFW");
        }
        if let Err(e) = self.runner.run("ufw", &["--force", "enable"]) {
            warn!(error = %e, "Failed to enable UFW");
        }
        Ok(())
    }

    /// Leave exactly one hook into the block chain, at position 1 of the
    /// family's UFW before-input chain.
    pub fn reassert_priority(&self, family: Family) -> Result<()> {
        let ipt = IptablesCommands::new(self.runner, family);
        let ufw_chain = self.config.names.ufw_input_chain(family);
        let hook = hook_rule(&self.config.names.chain);

        while ipt.rule_exists(Table::Filter, ufw_chain, &hook) {
            if ipt.delete_rule(Table::Filter, ufw_chain, &hook).is_err() {
                break;
            }
        }

        ipt.insert_rule(Table::Filter, ufw_chain, Some(1), &hook)
            .with_context(|| format!("Failed to move hook to position 1 of {}", ufw_chain))?;
        info!(chain = ufw_chain, family = %family, "Hook moved to position 1");
        Ok(())
    }

    /// Boot unit that repeats [`reassert_priority`](Self::reassert_priority) after UFW starts.
    pub fn install_priority_unit(&self) -> Result<()> {
        write_unit(
            &self.config.paths,
            MOVE_RULES_UNIT,
            &templates::move_rules_unit(self.config),
        )?;

        if let Err(e) = self.runner.daemon_reload() {
            warn!(error = %e, "Failed to reload systemd daemon");
        }
        self.runner
            .enable_service(MOVE_RULES_UNIT)
            .context("Failed to enable rule priority unit")?;
        Ok(())
    }

    /// Persist the chain through UFW: sections, reload, priority, boot unit.
    pub fn integrate(&self, gate: &SafetyGateResult) -> Result<()> {
        self.inject_sections()?;
        self.reload(gate)?;

        for family in Family::ALL {
            if let Err(e) = self.reassert_priority(family) {
                warn!(error = %format!("{:#}", e), family = %family, "Failed to reassert rule priority");
            }
        }

        if let Err(e) = self.install_priority_unit() {
            warn!(error = %format!("{:#}", e), "Failed to install rule priority unit");
        }

        info!("iptables rules integrated with UFW");
        Ok(())
    }
}

/// Write `<path>.new` with mode 0640 and rename it over `path`.
fn replace_file(path: &Path, content: &str) -> Result<()> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".new");
    let staged = Path::new(&staged);

    fs::write(staged, content).with_context(|| format!("Failed to write {:?}", staged))?;
    fs::set_permissions(staged, fs::Permissions::from_mode(0o640))
        .with_context(|| format!("Failed to set permissions on {:?}", staged))?;
    fs::rename(staged, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::testing::FakeHost;

    const BEFORE_RULES: &str = "*filter\n\
        :ufw-before-input - [0:0]\n\
        -A ufw-before-input -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT\n\
        COMMIT\n";

    const BEFORE6_RULES: &str = "*filter\n\
        :ufw6-before-input - [0:0]\n\
        -A ufw6-before-input -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT\n\
        COMMIT\n";

    struct Scratch {
        _dir: tempfile::TempDir,
        config: Config,
    }

    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths = Paths::rooted_at(dir.path());
        fs::create_dir_all(config.paths.ufw_before_rules.parent().unwrap()).unwrap();
        fs::write(&config.paths.ufw_before_rules, BEFORE_RULES).unwrap();
        fs::write(&config.paths.ufw_before6_rules, BEFORE6_RULES).unwrap();
        Scratch { _dir: dir, config }
    }

    fn section() -> PersistedSection {
        PersistedSection {
            begin: "# BEGIN".to_string(),
            body: vec!["-A X -j DROP".to_string()],
            end: "# END".to_string(),
        }
    }

    #[test]
    fn test_section_render() {
        assert_eq!(section().render(), "\n# BEGIN\n-A X -j DROP\n# END\n\n");
    }

    #[test]
    fn test_inject_before_last_commit() {
        let content = "*nat\nCOMMIT\n*filter\n-A INPUT -j ACCEPT\nCOMMIT\n# trailing\n";
        let Injection::Inserted(out) = section().inject_into(content) else {
            panic!("expected insertion");
        };
        assert_eq!(
            out,
            "*nat\nCOMMIT\n*filter\n-A INPUT -j ACCEPT\n\n# BEGIN\n-A X -j DROP\n# END\n\nCOMMIT\n# trailing\n"
        );
    }

    #[test]
    fn test_inject_is_idempotent() {
        let Injection::Inserted(once) = section().inject_into(BEFORE_RULES) else {
            panic!("expected insertion");
        };
        assert_eq!(section().inject_into(&once), Injection::AlreadyPresent);
        assert_eq!(once.matches("# BEGIN").count(), 1);
    }

    #[test]
    fn test_inject_requires_exact_commit_line() {
        assert_eq!(
            section().inject_into("*filter\n# COMMIT later\nCOMMITTED\n"),
            Injection::NoCommit
        );
        // a commented marker is not the marker
        let content = "## BEGIN\nCOMMIT\n";
        assert!(matches!(section().inject_into(content), Injection::Inserted(_)));
    }

    #[test]
    fn test_section_body_with_logging() {
        let config = Config::default();
        let host = FakeHost::new();
        let runner = host.runner();
        let section = UfwIntegrator::new(&runner, &config, true).section(Family::V4);

        assert_eq!(section.begin, "# SCANNERS-BLOCK chain - managed by antiscan");
        assert_eq!(section.end, "# END SCANNERS-BLOCK");
        assert_eq!(
            section.body,
            vec![
                "# DO NOT EDIT THIS SECTION MANUALLY".to_string(),
                ":SCANNERS-BLOCK - [0:0]".to_string(),
                "-A ufw-before-input -j SCANNERS-BLOCK".to_string(),
                "-A SCANNERS-BLOCK -m set --match-set SCANNERS-BLOCK-V4 src -m limit --limit 10/min \
                 --limit-burst 5 -j LOG --log-prefix \"ANTISCAN-v4: \" --log-level 4"
                    .to_string(),
                "-A SCANNERS-BLOCK -m set --match-set SCANNERS-BLOCK-V4 src -j DROP".to_string(),
            ]
        );

        let v6 = UfwIntegrator::new(&runner, &config, false).section(Family::V6);
        assert_eq!(v6.body.len(), 4);
        assert_eq!(v6.body[2], "-A ufw6-before-input -j SCANNERS-BLOCK");
    }

    #[test]
    fn test_inject_section_twice_yields_one_section() {
        let s = scratch();
        let host = FakeHost::new();
        let runner = host.runner();
        let ufw = UfwIntegrator::new(&runner, &s.config, true);

        assert!(ufw.inject_section(Family::V4).unwrap());
        assert!(!ufw.inject_section(Family::V4).unwrap());

        let content = fs::read_to_string(&s.config.paths.ufw_before_rules).unwrap();
        assert_eq!(content.matches("# SCANNERS-BLOCK chain - managed by antiscan").count(), 1);
        assert!(content.ends_with("# END SCANNERS-BLOCK\n\nCOMMIT\n"));

        let mode = fs::metadata(&s.config.paths.ufw_before_rules).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_inject_sections_v4_fatal_v6_warning() {
        let s = scratch();
        let host = FakeHost::new();
        let runner = host.runner();
        let ufw = UfwIntegrator::new(&runner, &s.config, false);

        fs::remove_file(&s.config.paths.ufw_before6_rules).unwrap();
        assert!(ufw.inject_sections().is_ok());

        fs::write(&s.config.paths.ufw_before_rules, "*filter\n").unwrap();
        let err = ufw.inject_sections().unwrap_err();
        assert!(err.to_string().contains("No COMMIT marker"));
    }

    #[test]
    fn test_gate_aborts_without_ssh_and_never_toggles() {
        let s = scratch();
        let host = FakeHost::new().with_ufw(false);
        let runner = host.runner();
        let ufw = UfwIntegrator::new(&runner, &s.config, false);

        let err = ufw.check_ssh_gate().unwrap_err();
        assert!(err.downcast_ref::<SafetyGateError>().is_some());
        assert!(err.to_string().contains("sudo ufw allow OpenSSH"));

        let gate = ufw.evaluate_safety_gate();
        assert!(ufw.reload(&gate).is_err());
        assert_eq!(host.count_calls("ufw --force"), 0);
        assert!(!host.ufw_active());
    }

    #[test]
    fn test_gate_passes_on_user_rules() {
        let s = scratch();
        fs::write(
            &s.config.paths.ufw_user_rules,
            "### tuple ### allow tcp 22 0.0.0.0/0 any 0.0.0.0/0 in\n\
             -A ufw-user-input -p tcp --dport 22 -j ACCEPT\n",
        )
        .unwrap();
        let host = FakeHost::new().with_ufw(false);
        let runner = host.runner();

        let gate = UfwIntegrator::new(&runner, &s.config, false).check_ssh_gate().unwrap();
        assert_eq!(
            gate,
            SafetyGateResult {
                installed: true,
                active: false,
                ssh_rule_present: true
            }
        );
        // files were conclusive, no need to ask ufw
        assert_eq!(host.count_calls("ufw show added"), 0);
    }

    #[test]
    fn test_gate_passes_on_ufw_show_added() {
        let s = scratch();
        let host = FakeHost::new()
            .with_ufw(false)
            .ufw_added("Added user rules (see 'ufw status' for running firewall):\nufw allow OpenSSH\n");
        let runner = host.runner();

        let gate = UfwIntegrator::new(&runner, &s.config, false).check_ssh_gate().unwrap();
        assert!(gate.ssh_rule_present);
    }

    #[test]
    fn test_gate_not_needed_when_active_or_absent() {
        let s = scratch();

        let host = FakeHost::new().with_ufw(true);
        let runner = host.runner();
        let gate = UfwIntegrator::new(&runner, &s.config, false).check_ssh_gate().unwrap();
        assert!(gate.active && gate.may_enable());
        assert_eq!(host.count_calls("ufw show added"), 0);

        let host = FakeHost::new();
        let runner = host.runner();
        let gate = UfwIntegrator::new(&runner, &s.config, false).check_ssh_gate().unwrap();
        assert_eq!(gate, SafetyGateResult::default());
    }

    #[test]
    fn test_integrate_moves_hook_to_position_one() {
        let s = scratch();
        let host = FakeHost::new()
            .with_ufw(true)
            .ufw_files(&s.config.paths.ufw_before_rules, &s.config.paths.ufw_before6_rules);
        let runner = host.runner();
        let ufw = UfwIntegrator::new(&runner, &s.config, true);

        let gate = ufw.check_ssh_gate().unwrap();
        ufw.integrate(&gate).unwrap();

        for family in Family::ALL {
            let chain = s.config.names.ufw_input_chain(family);
            let rules = host.chain_rules(family, chain);
            assert_eq!(rules[0], "-j SCANNERS-BLOCK");
            assert_eq!(rules.iter().filter(|r| *r == "-j SCANNERS-BLOCK").count(), 1);
            assert_eq!(host.chain_rules(family, "SCANNERS-BLOCK").len(), 2);
        }
        assert!(s.config.paths.unit(MOVE_RULES_UNIT).exists());
        assert_eq!(host.count_calls("systemctl enable antiscan-move-rules.service"), 1);

        // a second run changes nothing in the files or the hook position
        let before = fs::read_to_string(&s.config.paths.ufw_before_rules).unwrap();
        ufw.integrate(&gate).unwrap();
        assert_eq!(fs::read_to_string(&s.config.paths.ufw_before_rules).unwrap(), before);
        let rules = host.chain_rules(Family::V4, "ufw-before-input");
        assert_eq!(rules[0], "-j SCANNERS-BLOCK");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_reassert_collapses_duplicate_hooks() {
        let host = FakeHost::new();
        let runner = host.runner();
        let config = Config::default();
        let ipt = IptablesCommands::new(&runner, Family::V4);
        let hook = hook_rule("SCANNERS-BLOCK");
        let accept = crate::enforcer::RuleBuilder::new()
            .jump(crate::enforcer::Target::Accept)
            .build();

        ipt.create_chain(Table::Filter, "SCANNERS-BLOCK").unwrap();
        ipt.create_chain(Table::Filter, "ufw-before-input").unwrap();
        ipt.append_rule(Table::Filter, "ufw-before-input", &accept).unwrap();
        ipt.append_rule(Table::Filter, "ufw-before-input", &hook).unwrap();
        ipt.append_rule(Table::Filter, "ufw-before-input", &hook).unwrap();

        UfwIntegrator::new(&runner, &config, false)
            .reassert_priority(Family::V4)
            .unwrap();

        assert_eq!(
            host.chain_rules(Family::V4, "ufw-before-input"),
            vec!["-j SCANNERS-BLOCK".to_string(), "-j ACCEPT".to_string()]
        );
    }
}
