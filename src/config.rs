//! Configuration management for antiscan.
//!
//! Every fixed name and path the tool touches lives here so that tests can
//! point the whole run at a temporary directory. A missing config file means
//! "use the defaults"; a present one is parsed and validated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::enforcer::Family;

/// Default location of the optional config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/antiscan/config.yaml";

/// iptables rejects chain names longer than this.
const MAX_CHAIN_NAME_LEN: usize = 28;

/// ipset rejects set names longer than this.
const MAX_SET_NAME_LEN: usize = 31;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chain, set, prefix and marker names
    pub names: Names,

    /// Filesystem locations
    pub paths: Paths,

    /// LOG rule rate limiting
    pub logging: LogRuleConfig,

    /// WHOIS enrichment for the aggregate table
    pub whois: WhoisConfig,
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let n = &self.names;

        if n.chain.is_empty() {
            anyhow::bail!("names.chain must not be empty");
        }
        if n.chain.len() > MAX_CHAIN_NAME_LEN {
            anyhow::bail!(
                "Chain name '{}' is too long ({} > {} characters)",
                n.chain,
                n.chain.len(),
                MAX_CHAIN_NAME_LEN
            );
        }

        for set in [&n.set_v4, &n.set_v6] {
            if set.is_empty() {
                anyhow::bail!("Set names must not be empty");
            }
            if set.len() > MAX_SET_NAME_LEN {
                anyhow::bail!(
                    "Set name '{}' is too long ({} > {} characters)",
                    set,
                    set.len(),
                    MAX_SET_NAME_LEN
                );
            }
        }
        if n.set_v4 == n.set_v6 {
            anyhow::bail!("IPv4 and IPv6 set names must differ, both are '{}'", n.set_v4);
        }

        for (field, value) in [
            ("names.log_prefix_v4", &n.log_prefix_v4),
            ("names.log_prefix_v6", &n.log_prefix_v6),
            ("names.section_begin", &n.section_begin),
            ("names.section_end", &n.section_end),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
        }

        if self.logging.burst == 0 {
            anyhow::bail!("logging.burst must be greater than zero");
        }
        if !self.logging.rate.contains('/') {
            anyhow::bail!(
                "Invalid logging.rate '{}'. Use format like '10/min'",
                self.logging.rate
            );
        }

        if self.whois.timeout_secs == 0 {
            anyhow::bail!("whois.timeout_secs must be greater than zero");
        }
        if self.whois.server.is_empty() {
            anyhow::bail!("whois.server must not be empty");
        }

        Ok(())
    }
}

/// Names of the firewall objects antiscan owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Names {
    pub chain: String,
    pub set_v4: String,
    pub set_v6: String,
    pub log_prefix_v4: String,
    pub log_prefix_v6: String,
    pub ufw_input_v4: String,
    pub ufw_input_v6: String,
    pub section_begin: String,
    pub section_end: String,
}

impl Default for Names {
    fn default() -> Self {
        Self {
            chain: "SCANNERS-BLOCK".to_string(),
            set_v4: "SCANNERS-BLOCK-V4".to_string(),
            set_v6: "SCANNERS-BLOCK-V6".to_string(),
            log_prefix_v4: "ANTISCAN-v4: ".to_string(),
            log_prefix_v6: "ANTISCAN-v6: ".to_string(),
            ufw_input_v4: "ufw-before-input".to_string(),
            ufw_input_v6: "ufw6-before-input".to_string(),
            section_begin: "# SCANNERS-BLOCK chain - managed by antiscan".to_string(),
            section_end: "# END SCANNERS-BLOCK".to_string(),
        }
    }
}

impl Names {
    pub fn set(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.set_v4,
            Family::V6 => &self.set_v6,
        }
    }

    pub fn log_prefix(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.log_prefix_v4,
            Family::V6 => &self.log_prefix_v6,
        }
    }

    /// The UFW chain that jumps into ours when UFW manages the host.
    pub fn ufw_input_chain(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.ufw_input_v4,
            Family::V6 => &self.ufw_input_v6,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub ufw_user_rules: PathBuf,
    pub ufw_user6_rules: PathBuf,
    pub ufw_before_rules: PathBuf,
    pub ufw_before6_rules: PathBuf,
    pub ipset_conf: PathBuf,
    pub iptables_dir: PathBuf,
    pub rules_v4: PathBuf,
    pub rules_v6: PathBuf,
    pub systemd_dir: PathBuf,
    pub rsyslog_conf: PathBuf,
    pub logrotate_conf: PathBuf,
    pub log_v4: PathBuf,
    pub log_v6: PathBuf,
    pub aggregate_csv: PathBuf,
    pub whois_cache: PathBuf,
    pub lock_file: PathBuf,
    pub aggregate_lock_file: PathBuf,
    pub debian_marker: PathBuf,
    pub redhat_marker: PathBuf,
    /// Binary invoked by the aggregation unit
    pub binary: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            ufw_user_rules: PathBuf::from("/etc/ufw/user.rules"),
            ufw_user6_rules: PathBuf::from("/etc/ufw/user6.rules"),
            ufw_before_rules: PathBuf::from("/etc/ufw/before.rules"),
            ufw_before6_rules: PathBuf::from("/etc/ufw/before6.rules"),
            ipset_conf: PathBuf::from("/etc/ipset.conf"),
            iptables_dir: PathBuf::from("/etc/iptables"),
            rules_v4: PathBuf::from("/etc/iptables/rules.v4"),
            rules_v6: PathBuf::from("/etc/iptables/rules.v6"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            rsyslog_conf: PathBuf::from("/etc/rsyslog.d/10-iptables-scanners.conf"),
            logrotate_conf: PathBuf::from("/etc/logrotate.d/iptables-scanners"),
            log_v4: PathBuf::from("/var/log/iptables-scanners-ipv4.log"),
            log_v6: PathBuf::from("/var/log/iptables-scanners-ipv6.log"),
            aggregate_csv: PathBuf::from("/var/log/iptables-scanners-aggregate.csv"),
            whois_cache: PathBuf::from("/tmp/antiscan-whois-cache.txt"),
            lock_file: PathBuf::from("/run/antiscan.lock"),
            aggregate_lock_file: PathBuf::from("/run/antiscan-aggregate.lock"),
            debian_marker: PathBuf::from("/etc/debian_version"),
            redhat_marker: PathBuf::from("/etc/redhat-release"),
            binary: PathBuf::from("/usr/local/bin/antiscan"),
        }
    }
}

impl Paths {
    pub fn raw_log(&self, family: Family) -> &Path {
        match family {
            Family::V4 => &self.log_v4,
            Family::V6 => &self.log_v6,
        }
    }

    pub fn user_rules(&self, family: Family) -> &Path {
        match family {
            Family::V4 => &self.ufw_user_rules,
            Family::V6 => &self.ufw_user6_rules,
        }
    }

    pub fn before_rules(&self, family: Family) -> &Path {
        match family {
            Family::V4 => &self.ufw_before_rules,
            Family::V6 => &self.ufw_before6_rules,
        }
    }

    pub fn saved_rules(&self, family: Family) -> &Path {
        match family {
            Family::V4 => &self.rules_v4,
            Family::V6 => &self.rules_v6,
        }
    }

    pub fn unit(&self, name: &str) -> PathBuf {
        self.systemd_dir.join(name)
    }

    /// Redirect every path under `root`, keeping the absolute layout.
    /// Used to run the whole pipeline against a scratch directory.
    pub fn rooted_at(root: &Path) -> Self {
        let d = Self::default();
        let re = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            ufw_user_rules: re(&d.ufw_user_rules),
            ufw_user6_rules: re(&d.ufw_user6_rules),
            ufw_before_rules: re(&d.ufw_before_rules),
            ufw_before6_rules: re(&d.ufw_before6_rules),
            ipset_conf: re(&d.ipset_conf),
            iptables_dir: re(&d.iptables_dir),
            rules_v4: re(&d.rules_v4),
            rules_v6: re(&d.rules_v6),
            systemd_dir: re(&d.systemd_dir),
            rsyslog_conf: re(&d.rsyslog_conf),
            logrotate_conf: re(&d.logrotate_conf),
            log_v4: re(&d.log_v4),
            log_v6: re(&d.log_v6),
            aggregate_csv: re(&d.aggregate_csv),
            whois_cache: re(&d.whois_cache),
            lock_file: re(&d.lock_file),
            aggregate_lock_file: re(&d.aggregate_lock_file),
            debian_marker: re(&d.debian_marker),
            redhat_marker: re(&d.redhat_marker),
            binary: d.binary,
        }
    }
}

/// Rate limit applied to the LOG rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRuleConfig {
    pub rate: String,
    pub burst: u32,
    /// Syslog level passed to `--log-level`
    pub level: u8,
}

impl Default for LogRuleConfig {
    fn default() -> Self {
        Self {
            rate: "10/min".to_string(),
            burst: 5,
            level: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhoisConfig {
    /// host:port of the WHOIS server
    pub server: String,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            server: "whois.ripe.net:43".to_string(),
            timeout_secs: 3,
            cache_ttl_secs: 24 * 60 * 60,
        }
    }
}
