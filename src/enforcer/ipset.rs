//! ipset address sets.
//!
//! [`IpsetCommands`] maps one method to one `ipset` invocation.
//! [`IpsetManager`] owns the two block sets: it creates or flushes them and
//! fills them from a [`NetworkList`].

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::Family;
use crate::cmd_abstraction::CommandRunner;
use crate::config::Names;
use crate::error::CommandError;
use crate::fetcher::NetworkList;
use crate::utils::{ensure_parent_dir, write_atomic};

/// Fixed capacity of the block sets.
pub const HASH_SIZE: u32 = 1024;
pub const MAX_ELEM: u32 = 65536;

/// Options for `ipset create`.
#[derive(Debug, Clone)]
pub struct CreateSetOptions {
    pub name: String,
    /// Set type, e.g. `hash:net` or `hash:ip`
    pub set_type: String,
    pub family: Option<Family>,
    pub hashsize: Option<u32>,
    pub maxelem: Option<u32>,
    /// Default entry timeout in seconds
    pub timeout: Option<u32>,
    /// Allow per-entry comments
    pub comment: bool,
}

impl CreateSetOptions {
    /// `hash:net` set with the fixed block-set capacity.
    pub fn hash_net(name: &str, family: Family) -> Self {
        Self {
            name: name.to_string(),
            set_type: "hash:net".to_string(),
            family: Some(family),
            hashsize: Some(HASH_SIZE),
            maxelem: Some(MAX_ELEM),
            timeout: None,
            comment: false,
        }
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            self.name.clone(),
            self.set_type.clone(),
        ];
        if let Some(family) = self.family {
            args.push("family".to_string());
            args.push(family.ipset_family().to_string());
        }
        if let Some(hashsize) = self.hashsize {
            args.push("hashsize".to_string());
            args.push(hashsize.to_string());
        }
        if let Some(maxelem) = self.maxelem {
            args.push("maxelem".to_string());
            args.push(maxelem.to_string());
        }
        if let Some(timeout) = self.timeout {
            args.push("timeout".to_string());
            args.push(timeout.to_string());
        }
        if self.comment {
            args.push("comment".to_string());
        }
        args
    }
}

/// Thin wrapper over the `ipset` binary.
pub struct IpsetCommands<'a> {
    runner: &'a CommandRunner,
}

impl<'a> IpsetCommands<'a> {
    pub fn new(runner: &'a CommandRunner) -> Self {
        Self { runner }
    }

    pub fn create(&self, opts: &CreateSetOptions) -> Result<(), CommandError> {
        debug!(set = %opts.name, set_type = %opts.set_type, "Creating ipset");
        let args = opts.to_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run("ipset", &args)
    }

    pub fn destroy(&self, name: &str) -> Result<(), CommandError> {
        self.runner.run("ipset", &["destroy", name])
    }

    pub fn flush(&self, name: &str) -> Result<(), CommandError> {
        self.runner.run("ipset", &["flush", name])
    }

    pub fn add(&self, set: &str, entry: &str) -> Result<(), CommandError> {
        self.runner.run("ipset", &["add", set, entry])
    }

    pub fn add_with_timeout(&self, set: &str, entry: &str, timeout: u32) -> Result<(), CommandError> {
        self.runner
            .run("ipset", &["add", set, entry, "timeout", &timeout.to_string()])
    }

    pub fn add_with_comment(&self, set: &str, entry: &str, comment: &str) -> Result<(), CommandError> {
        self.runner.run("ipset", &["add", set, entry, "comment", comment])
    }

    pub fn del(&self, set: &str, entry: &str) -> Result<(), CommandError> {
        self.runner.run("ipset", &["del", set, entry])
    }

    /// Membership test. A "not in set" answer is `Ok(false)`, not an error.
    pub fn test(&self, set: &str, entry: &str) -> Result<bool, CommandError> {
        let output = self.runner.output("ipset", &["test", set, entry])?;
        if output.success {
            return Ok(true);
        }
        if output.combined().contains("is NOT in set") {
            return Ok(false);
        }
        Err(CommandError::Failed {
            command: format!("ipset test {} {}", set, entry),
            status: match output.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            },
            stderr: output.stderr.trim().to_string(),
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.runner.run_quiet("ipset", &["list", name])
    }

    pub fn list(&self, name: &str) -> Result<String, CommandError> {
        self.runner.run_captured("ipset", &["list", name])
    }

    /// Dump of every set, as `ipset restore` reads it.
    pub fn save(&self) -> Result<String, CommandError> {
        self.runner.run_stdout("ipset", &["save"])
    }

    pub fn restore(&self, path: &Path) -> Result<(), CommandError> {
        let path = path.to_string_lossy();
        self.runner.run("ipset", &["restore", "-exist", "-f", &path])
    }
}

/// Outcome of filling one set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillSummary {
    pub added: usize,
    pub errors: usize,
}

/// Outcome of filling both sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    pub v4: FillSummary,
    pub v6: FillSummary,
}

impl FillReport {
    pub fn get(&self, family: Family) -> FillSummary {
        match family {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        }
    }

    pub fn total_added(&self) -> usize {
        self.v4.added + self.v6.added
    }

    pub fn total_errors(&self) -> usize {
        self.v4.errors + self.v6.errors
    }
}

/// Owner of the per-family block sets.
pub struct IpsetManager<'a> {
    cmds: IpsetCommands<'a>,
    names: &'a Names,
}

impl<'a> IpsetManager<'a> {
    pub fn new(runner: &'a CommandRunner, names: &'a Names) -> Self {
        Self {
            cmds: IpsetCommands::new(runner),
            names,
        }
    }

    /// Ensure both sets exist and are empty.
    pub fn setup(&self) -> Result<()> {
        info!("Setting up ipset sets");
        for family in Family::ALL {
            self.setup_set(family)
                .with_context(|| format!("Failed to setup {} set", family))?;
        }
        Ok(())
    }

    /// Flush the set if it exists, create it otherwise. Never both.
    pub fn setup_set(&self, family: Family) -> Result<()> {
        let name = self.names.set(family);
        if self.cmds.exists(name) {
            info!(set = name, "Flushing existing set");
            self.cmds
                .flush(name)
                .with_context(|| format!("Failed to flush set {}", name))?;
        } else {
            info!(set = name, family = family.ipset_family(), "Creating set");
            self.cmds
                .create(&CreateSetOptions::hash_net(name, family))
                .with_context(|| format!("Failed to create set {}", name))?;
        }
        Ok(())
    }

    /// Add every subnet to its family's set. Individual failures are counted,
    /// never fatal.
    pub fn fill(&self, networks: &NetworkList) -> FillReport {
        info!(
            ipv4_count = networks.ipv4.len(),
            ipv6_count = networks.ipv6.len(),
            "Filling ipset sets"
        );

        let report = FillReport {
            v4: self.fill_set(Family::V4, &networks.ipv4),
            v6: self.fill_set(Family::V6, &networks.ipv6),
        };

        info!(
            ipv4_added = report.v4.added,
            ipv4_errors = report.v4.errors,
            ipv6_added = report.v6.added,
            ipv6_errors = report.v6.errors,
            "ipset sets filled"
        );
        report
    }

    fn fill_set(&self, family: Family, subnets: &[String]) -> FillSummary {
        let set = self.names.set(family);
        let total = subnets.len();
        let mut summary = FillSummary::default();

        for (i, subnet) in subnets.iter().enumerate() {
            match self.cmds.add(set, subnet) {
                Ok(()) => {
                    summary.added += 1;
                    if (i + 1) % 100 == 0 {
                        debug!(progress = i + 1, total, family = %family, "Progress");
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!(subnet = %subnet, set, error = %e, "Failed to add subnet");
                }
            }
        }
        summary
    }

    /// Write the current state of all sets to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Saving ipset configuration");
        let dump = self.cmds.save().context("Failed to dump ipset state")?;
        ensure_parent_dir(path)?;
        write_atomic(path, &dump, 0o644)
            .with_context(|| format!("Failed to save ipset to {:?}", path))
    }
}
