//! Firewall enforcement: ipset sets, iptables chains and UFW integration.
//!
//! Everything here talks to the kernel tools through
//! [`CommandRunner`](crate::cmd_abstraction::CommandRunner), never through
//! `std::process` directly.

pub mod ipset;
pub mod iptables;
pub mod rule;
pub mod ufw;

pub use ipset::{CreateSetOptions, FillReport, IpsetCommands, IpsetManager};
pub use iptables::{ChainReconciler, ChainState, HookState, IptablesCommands, Table};
pub use rule::{RuleBuilder, RuleSpec, Target};
pub use ufw::{PersistedSection, SafetyGateResult, UfwIntegrator};

use std::fmt;

/// IP address family. Every firewall object antiscan owns exists once per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Both families, IPv4 first.
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn iptables_cmd(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    pub fn save_cmd(self) -> &'static str {
        match self {
            Family::V4 => "iptables-save",
            Family::V6 => "ip6tables-save",
        }
    }

    pub fn restore_cmd(self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }

    /// Value of ipset's `family` option.
    pub fn ipset_family(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }

    /// Short tag used in the aggregate table (`v4`, `v6`).
    pub fn tag(self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "v4" => Some(Family::V4),
            "v6" => Some(Family::V6),
            _ => None,
        }
    }

    /// Classify a source-list entry. Anything containing `:` is IPv6.
    pub fn of_subnet(subnet: &str) -> Self {
        if subnet.contains(':') {
            Family::V6
        } else {
            Family::V4
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}
