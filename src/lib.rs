//! # antiscan - block known Internet scanners on Linux hosts
//!
//! Downloads lists of scanner subnets, loads them into two ipset sets (one
//! per address family), drops matching traffic from a dedicated iptables
//! chain and makes the result survive a reboot, either through UFW or
//! through netfilter-persistent. Optionally logs blocked packets and folds
//! the logs into a per-address table enriched with WHOIS data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap)                                                 │
//! │    └── Commands: full, aggregate                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── names, paths, LOG rate limit, WHOIS                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline                                                   │
//! │    └── Fatal / Recoverable steps of the full run            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Fetcher (reqwest + rustls)                                 │
//! │    └── Newline-delimited CIDR lists, deduplicated           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer                                                   │
//! │    ├── IpsetManager       (hash:net sets)                   │
//! │    ├── ChainReconciler    (block chain, INPUT hook)         │
//! │    └── UfwIntegrator      (safety gate, before-rules)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Persistence  (UFW or netfilter-persistent, ipset restore)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Aggregate    (raw logs → WHOIS → counter table)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use antiscan::cmd_abstraction::CommandRunner;
//! use antiscan::config::Config;
//! use antiscan::enforcer::{ChainReconciler, IpsetManager};
//! use antiscan::fetcher::Fetcher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/antiscan/config.yaml")?;
//!     let runner = CommandRunner::real();
//!
//!     let networks = Fetcher::new()?
//!         .download(&["https://example.org/scanners.txt".to_string()])
//!         .await;
//!
//!     let ipsets = IpsetManager::new(&runner, &config.names);
//!     ipsets.setup()?;
//!     ipsets.fill(&networks);
//!
//!     ChainReconciler::new(&runner, &config, false).setup_chains(true)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`aggregate`] - Log intake, WHOIS enrichment and the counter table
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution behind a trait
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - ipset, iptables and UFW management
//! - [`error`] - Typed errors
//! - [`fetcher`] - HTTP client for downloading source lists
//! - [`installer`] - Dependencies, systemd units, logging setup
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`persistence`] - Reboot durability of sets and rules
//! - [`pipeline`] - Ordered fatal/recoverable steps
//! - [`utils`] - Common utility functions

pub mod aggregate;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod fetcher;
pub mod installer;
pub mod lock;
pub mod persistence;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
pub mod testing;

pub use cli::{Cli, Commands};
pub use config::Config;
