//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "antiscan")]
#[command(author, version, about = "Block known Internet scanners with ipset and iptables")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download the scanner lists, block them and make the rules persistent
    Full {
        /// Source list URLs (comma-separated or repeated)
        #[arg(short = 'u', long, value_delimiter = ',', required = true, num_args = 1..)]
        urls: Vec<String>,

        /// Log blocked packets and schedule the aggregation timer
        #[arg(short = 'l', long)]
        enable_logging: bool,
    },

    /// Fold new log entries into the aggregate table (run by the timer)
    Aggregate,
}
