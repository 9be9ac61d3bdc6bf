//! Blocked-connection logging: rsyslog routing, raw log files, rotation,
//! and the systemd timer that drives `antiscan aggregate`.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::templates::{self, AGGREGATE_SERVICE_UNIT, AGGREGATE_TIMER_UNIT};
use super::write_unit;
use crate::cmd_abstraction::CommandRunner;
use crate::config::Config;
use crate::enforcer::Family;
use crate::utils::ensure_parent_dir;

/// Owner and mode of the raw log files.
pub const LOG_OWNER: &str = "syslog:adm";
pub const LOG_MODE: u32 = 0o640;

pub struct LoggingSetup<'a> {
    runner: &'a CommandRunner,
    config: &'a Config,
}

impl<'a> LoggingSetup<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a Config) -> Self {
        Self { runner, config }
    }

    /// Install the whole logging chain. File writes are errors, service
    /// management failures are warnings.
    pub fn setup(&self) -> Result<()> {
        info!("Setting up logging");

        self.write_rsyslog_config().context("Failed to setup rsyslog")?;
        self.create_log_files().context("Failed to create log files")?;
        self.write_logrotate_config()
            .context("Failed to setup logrotate")?;
        self.install_aggregation_timer()
            .context("Failed to setup aggregation timer")?;

        if let Err(e) = self.runner.restart_service("rsyslog") {
            warn!(error = %e, "Failed to restart rsyslog, a manual restart may be needed");
        } else {
            info!("rsyslog restarted");
        }

        let paths = &self.config.paths;
        info!(
            ipv4 = %paths.log_v4.display(),
            ipv6 = %paths.log_v6.display(),
            aggregate = %paths.aggregate_csv.display(),
            rate = %self.config.logging.rate,
            "Logging configured"
        );
        Ok(())
    }

    fn write_rsyslog_config(&self) -> Result<()> {
        let path = &self.config.paths.rsyslog_conf;
        write_file(path, &templates::rsyslog_config(self.config))?;
        info!(path = %path.display(), "rsyslog config created");
        Ok(())
    }

    /// Create missing raw log files owned by syslog with mode 0640.
    fn create_log_files(&self) -> Result<()> {
        for family in Family::ALL {
            let path = self.config.paths.raw_log(family);
            if path.exists() {
                continue;
            }

            ensure_parent_dir(path)?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to create {:?}", path))?;

            restore_log_ownership(self.runner, path);
            info!(file = %path.display(), "Created log file");
        }
        Ok(())
    }

    fn write_logrotate_config(&self) -> Result<()> {
        let path = &self.config.paths.logrotate_conf;
        write_file(path, &templates::logrotate_config(self.config))?;
        info!(path = %path.display(), "logrotate config created");
        Ok(())
    }

    /// Executable the aggregation service runs: the configured path when it
    /// exists, else the running binary.
    fn aggregate_binary(&self) -> Result<PathBuf> {
        let configured = &self.config.paths.binary;
        if configured.is_file() {
            return Ok(configured.clone());
        }

        let current = std::env::current_exe().with_context(|| {
            format!(
                "antiscan binary not found at {:?} and the running executable is unknown; \
                 install it there or set paths.binary",
                configured
            )
        })?;
        warn!(
            configured = %configured.display(),
            using = %current.display(),
            "Configured binary not found, aggregation service uses the current executable"
        );
        Ok(current)
    }

    fn install_aggregation_timer(&self) -> Result<()> {
        let paths = &self.config.paths;
        let binary = self.aggregate_binary()?;
        write_unit(
            paths,
            AGGREGATE_SERVICE_UNIT,
            &templates::aggregate_service_unit(&binary),
        )?;
        write_unit(paths, AGGREGATE_TIMER_UNIT, &templates::aggregate_timer_unit())?;

        if let Err(e) = self.runner.daemon_reload() {
            warn!(error = %e, "Failed to reload systemd daemon");
        }
        if let Err(e) = self.runner.enable_service(AGGREGATE_TIMER_UNIT) {
            warn!(error = %e, "Failed to enable aggregation timer");
        }
        if let Err(e) = self.runner.start_service(AGGREGATE_TIMER_UNIT) {
            warn!(error = %e, "Failed to start aggregation timer");
        }

        info!("Aggregation timer enabled (every 30 seconds)");
        Ok(())
    }
}

/// Best-effort `chown syslog:adm` and chmod 0640 on a raw log file.
pub fn restore_log_ownership(runner: &CommandRunner, path: &Path) {
    let target = path.to_string_lossy();
    if !runner.run_quiet("chown", &[LOG_OWNER, &target]) {
        warn!(file = %path.display(), "Failed to chown log file");
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(LOG_MODE)) {
        warn!(file = %path.display(), error = %e, "Failed to chmod log file");
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
}
