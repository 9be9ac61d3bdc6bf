//! Reboot durability of the block sets and the block chain.
//!
//! Sets are always dumped to the ipset config and restored at boot by a
//! oneshot unit. Rules go through UFW when it is installed, otherwise
//! through netfilter-persistent.

use anyhow::{Context, Result};
use std::fs;
use tracing::{info, warn};

use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::enforcer::{Family, IpsetManager, IptablesCommands, SafetyGateResult, UfwIntegrator};
use crate::installer::templates::{self, IPSET_RESTORE_UNIT};
use crate::installer::{write_unit, Distro, Installer};
use crate::utils::write_atomic;

const HELPER: &str = "netfilter-persistent";
const HELPER_PACKAGES: &[&str] = &["netfilter-persistent", "iptables-persistent"];

/// How rules survive a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Ufw,
    NetfilterPersistent,
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Ufw => write!(f, "ufw"),
            Mechanism::NetfilterPersistent => write!(f, "netfilter-persistent"),
        }
    }
}

pub struct PersistenceManager<'a> {
    runner: &'a CommandRunner,
    config: &'a Config,
}

impl<'a> PersistenceManager<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a Config) -> Self {
        Self { runner, config }
    }

    pub fn select(&self) -> Mechanism {
        if self.runner.command_exists("ufw") {
            Mechanism::Ufw
        } else {
            Mechanism::NetfilterPersistent
        }
    }

    /// Install netfilter-persistent on Debian hosts without UFW.
    /// Other distros are left alone.
    pub fn ensure_helper(&self) -> Result<()> {
        let installer = Installer::new(self.runner, self.config);
        if installer.distro() != Distro::Debian {
            return Ok(());
        }
        if self.select() == Mechanism::Ufw {
            info!("UFW detected, netfilter-persistent not needed");
            return Ok(());
        }
        if self.runner.command_exists(HELPER) {
            info!("netfilter-persistent already installed");
            return Ok(());
        }

        info!("Installing netfilter-persistent");
        if let Err(e) = self.runner.run("apt-get", &["update"]) {
            warn!(error = %e, "apt-get update failed");
        }
        installer
            .apt_install_noninteractive(HELPER_PACKAGES)
            .context("Failed to install netfilter-persistent")?;
        info!("netfilter-persistent installed");
        Ok(())
    }

    pub fn save_ipsets(&self) -> Result<()> {
        info!("Saving ipsets");
        let path = &self.config.paths.ipset_conf;
        IpsetManager::new(self.runner, &self.config.names)
            .save_to(path)
            .context("Failed to save ipsets")?;
        info!(path = %path.display(), "ipsets saved");
        Ok(())
    }

    /// Boot unit restoring the saved sets before any rule references them.
    pub fn install_restore_unit(&self) -> Result<()> {
        write_unit(
            &self.config.paths,
            IPSET_RESTORE_UNIT,
            &templates::ipset_restore_unit(self.config),
        )?;
        if let Err(e) = self.runner.daemon_reload() {
            warn!(error = %e, "Failed to reload systemd daemon");
        }
        self.runner
            .enable_service(IPSET_RESTORE_UNIT)
            .context("Failed to enable ipset restore service")?;
        info!("ipset restore service enabled");
        Ok(())
    }

    /// Persist the block chain with whichever mechanism the host has.
    pub fn save_rules(&self, gate: &SafetyGateResult, enable_logging: bool) -> Result<Mechanism> {
        let mechanism = self.select();
        info!(mechanism = %mechanism, "Saving iptables rules");

        match mechanism {
            Mechanism::Ufw => {
                UfwIntegrator::new(self.runner, self.config, enable_logging).integrate(gate)?;
            }
            Mechanism::NetfilterPersistent => self.save_with_netfilter_persistent()?,
        }
        Ok(mechanism)
    }

    fn save_with_netfilter_persistent(&self) -> Result<()> {
        if !self.runner.command_exists(HELPER) {
            anyhow::bail!("netfilter-persistent not found and UFW not installed");
        }

        let dir = &self.config.paths.iptables_dir;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        for family in Family::ALL {
            let dump = IptablesCommands::new(self.runner, family)
                .save()
                .with_context(|| format!("Failed to save {} rules", family))?;
            let path = self.config.paths.saved_rules(family);
            write_atomic(path, &dump, 0o640)
                .with_context(|| format!("Failed to write {:?}", path))?;
            info!(path = %path.display(), family = %family, "Rules saved");
        }

        if let Err(e) = self.runner.run(HELPER, &["save"]) {
            warn!(error = %e, "netfilter-persistent save failed");
        }
        info!("iptables rules saved via netfilter-persistent");
        Ok(())
    }
}
