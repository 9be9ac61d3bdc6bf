//! Host preparation: privileges, packages, generated system files.

pub mod logging;
pub mod templates;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::CommandRunner;
use crate::config::{Config, Paths};
use crate::error::AntiscanError;
use crate::utils::ensure_parent_dir;

/// Binaries antiscan cannot run without.
pub const REQUIRED_COMMANDS: &[&str] = &["iptables", "ip6tables", "ipset"];

/// Check if running as root (effective UID == 0)
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(AntiscanError::Permission(
            "antiscan must be run as root (use sudo)".to_string(),
        )
        .into());
    }
    Ok(())
}

/// Package-manager family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Debian,
    RedHat,
    Unknown,
}

impl Distro {
    /// Detect from the release marker files named in `paths`.
    pub fn detect(paths: &Paths) -> Self {
        Self::detect_from(&paths.debian_marker, &paths.redhat_marker)
    }

    pub fn detect_from(debian_marker: &Path, redhat_marker: &Path) -> Self {
        if debian_marker.exists() {
            Distro::Debian
        } else if redhat_marker.exists() {
            Distro::RedHat
        } else {
            Distro::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Distro::Debian => "debian",
            Distro::RedHat => "redhat",
            Distro::Unknown => "unknown",
        }
    }
}

pub struct Installer<'a> {
    runner: &'a CommandRunner,
    distro: Distro,
}

impl<'a> Installer<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a Config) -> Self {
        Self {
            runner,
            distro: Distro::detect(&config.paths),
        }
    }

    pub fn distro(&self) -> Distro {
        self.distro
    }

    /// Install whichever of [`REQUIRED_COMMANDS`] is missing.
    pub fn ensure_dependencies(&self) -> Result<()> {
        info!("Checking dependencies");
        debug!(distro = self.distro.as_str(), "Detected distribution");

        for &cmd in REQUIRED_COMMANDS {
            if self.runner.command_exists(cmd) {
                debug!(command = cmd, "Already installed");
                continue;
            }

            info!(package = cmd, "Installing");
            let installed = self.install_package(cmd);
            match installed {
                Ok(()) => {}
                // stale package index
                Err(_) if cmd == "ipset" && self.distro == Distro::Debian => {
                    warn!("Retrying ipset installation after apt-get update");
                    self.runner
                        .run("apt-get", &["update"])
                        .context("Failed to update apt-get")?;
                    self.install_package(cmd)
                        .with_context(|| format!("Failed to install {}", cmd))?;
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to install {}", cmd)),
            }
            info!(package = cmd, "Installed");
        }

        info!("All dependencies satisfied");
        Ok(())
    }

    pub fn install_package(&self, package: &str) -> Result<()> {
        debug!(package, distro = self.distro.as_str(), "Installing package");
        match self.distro {
            Distro::Debian => self.runner.run("apt-get", &["install", "-y", package])?,
            Distro::RedHat => self.runner.run("yum", &["install", "-y", package])?,
            Distro::Unknown => {
                return Err(AntiscanError::UnsupportedDistro(package.to_string()).into())
            }
        }
        Ok(())
    }

    /// Non-interactive `apt-get install` of several packages.
    pub fn apt_install_noninteractive(&self, packages: &[&str]) -> Result<()> {
        let mut args = vec!["DEBIAN_FRONTEND=noninteractive", "apt-get", "install", "-y"];
        args.extend_from_slice(packages);
        self.runner.run("env", &args)?;
        Ok(())
    }
}

/// Write a unit file into the systemd directory and return its path.
pub fn write_unit(paths: &Paths, name: &str, content: &str) -> Result<std::path::PathBuf> {
    let path = paths.unit(name);
    ensure_parent_dir(&path)?;
    fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;
    info!(path = %path.display(), "Created systemd unit");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    fn scratch_config(dir: &Path, distro: Distro) -> Config {
        let mut config = Config::default();
        config.paths = Paths::rooted_at(dir);
        let marker = match distro {
            Distro::Debian => Some(&config.paths.debian_marker),
            Distro::RedHat => Some(&config.paths.redhat_marker),
            Distro::Unknown => None,
        };
        if let Some(marker) = marker {
            ensure_parent_dir(marker).unwrap();
            fs::write(marker, "12.5\n").unwrap();
        }
        config
    }

    #[test]
    fn test_check_root_matches_euid() {
        let euid = unsafe { libc::geteuid() };
        assert_eq!(check_root().is_ok(), euid == 0);
    }

    #[test]
    fn test_detect_distro() {
        let dir = tempfile::tempdir().unwrap();
        let debian = dir.path().join("debian_version");
        let redhat = dir.path().join("redhat-release");

        assert_eq!(Distro::detect_from(&debian, &redhat), Distro::Unknown);
        fs::write(&redhat, "").unwrap();
        assert_eq!(Distro::detect_from(&debian, &redhat), Distro::RedHat);
        fs::write(&debian, "").unwrap();
        assert_eq!(Distro::detect_from(&debian, &redhat), Distro::Debian);
    }

    #[test]
    fn test_ensure_dependencies_nothing_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path(), Distro::Debian);
        let host = FakeHost::new();
        let runner = host.runner();

        Installer::new(&runner, &config).ensure_dependencies().unwrap();
        assert_eq!(host.count_calls("apt-get"), 0);
    }

    #[test]
    fn test_ensure_dependencies_installs_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path(), Distro::RedHat);
        let host = FakeHost::new().without_binary("ip6tables");
        let runner = host.runner();

        Installer::new(&runner, &config).ensure_dependencies().unwrap();
        assert_eq!(host.calls(), vec!["yum install -y ip6tables".to_string()]);
    }

    #[test]
    fn test_ipset_install_retries_after_update_on_debian() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path(), Distro::Debian);
        let host = FakeHost::new()
            .without_binary("ipset")
            .fail_once("apt-get install -y ipset");
        let runner = host.runner();

        Installer::new(&runner, &config).ensure_dependencies().unwrap();
        assert_eq!(
            host.calls(),
            vec![
                "apt-get install -y ipset".to_string(),
                "apt-get update".to_string(),
                "apt-get install -y ipset".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_distro_requires_manual_install() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path(), Distro::Unknown);
        let host = FakeHost::new().without_binary("iptables");
        let runner = host.runner();

        let err = Installer::new(&runner, &config).ensure_dependencies().unwrap_err();
        assert!(format!("{:#}", err).contains("please install iptables manually"));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_write_unit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(dir.path());
        let path = write_unit(&paths, "x.service", "[Unit]\n").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "[Unit]\n");
    }
}
