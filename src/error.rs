//! Error types for antiscan.

use thiserror::Error;

/// Failure of a single external command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to execute '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("command '{command}' failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Refusal to activate UFW without an inbound SSH rule.
#[derive(Error, Debug)]
pub enum SafetyGateError {
    #[error(
        "SSH is not allowed in UFW - installation aborted to prevent server lockout\n\
         \n\
         Step 1: allow SSH in UFW with ONE of:\n\
         \x20 sudo ufw allow 22/tcp\n\
         \x20 sudo ufw allow OpenSSH\n\
         \x20 sudo ufw allow ssh\n\
         Verify the rule with:\n\
         \x20 sudo ufw show added\n\
         \n\
         Step 2: run the installation again:\n\
         \x20 sudo antiscan full --urls <URL>\n\
         \n\
         Alternative: if UFW is not needed, remove it and antiscan will manage iptables directly:\n\
         \x20 sudo apt remove --purge ufw"
    )]
    SshNotAllowed,
}

/// Domain errors raised by the firewall and aggregation layers.
#[derive(Error, Debug)]
pub enum AntiscanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("No COMMIT marker found in {0}")]
    MissingCommit(String),

    #[error("Unsupported distribution: please install {0} manually")]
    UnsupportedDistro(String),

    #[error("No subnets were downloaded from any source")]
    NoSubnets,

    #[error("Another antiscan run holds the lock {0}")]
    Locked(String),
}
