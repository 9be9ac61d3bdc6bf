//! Rule descriptors.
//!
//! A [`RuleSpec`] is the ordered token list that follows `-A CHAIN` on an
//! iptables command line. Two rules are the same rule exactly when their
//! token sequences are equal; `iptables -C` is asked with those tokens and
//! nothing else.

use std::fmt;

/// Jump target of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject,
    Log,
    Return,
    /// Jump to a user-defined chain
    Chain(String),
}

impl Target {
    pub fn as_str(&self) -> &str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Reject => "REJECT",
            Target::Log => "LOG",
            Target::Return => "RETURN",
            Target::Chain(name) => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered token sequence describing one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Borrowed tokens, ready to be spliced into an argument list.
    pub fn to_args(&self) -> Vec<&str> {
        self.0.iter().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as an iptables-restore line (`-A CHAIN tok...`).
    ///
    /// Tokens containing whitespace are double-quoted so that
    /// `--log-prefix "ANTISCAN-v4: "` keeps its trailing space.
    pub fn to_rules_line(&self, chain: &str) -> String {
        let mut line = format!("-A {}", chain);
        for token in &self.0 {
            line.push(' ');
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                line.push('"');
                line.push_str(token);
                line.push('"');
            } else {
                line.push_str(token);
            }
        }
        line
    }
}

impl<'a> FromIterator<&'a str> for RuleSpec {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        RuleSpec(iter.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Fluent accumulator producing a [`RuleSpec`].
///
/// No validation is done beyond keeping the order callers use: match
/// modules first with their options, then the target, then target options.
#[derive(Debug, Clone, Default)]
pub struct RuleBuilder {
    spec: Vec<String>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, tokens: &[&str]) -> Self {
        self.spec.extend(tokens.iter().map(|t| t.to_string()));
        self
    }

    pub fn protocol(self, proto: &str) -> Self {
        self.push(&["-p", proto])
    }

    pub fn source(self, addr: &str) -> Self {
        self.push(&["-s", addr])
    }

    pub fn destination(self, addr: &str) -> Self {
        self.push(&["-d", addr])
    }

    pub fn source_port(self, port: &str) -> Self {
        self.push(&["--sport", port])
    }

    pub fn destination_port(self, port: &str) -> Self {
        self.push(&["--dport", port])
    }

    pub fn in_interface(self, iface: &str) -> Self {
        self.push(&["-i", iface])
    }

    pub fn out_interface(self, iface: &str) -> Self {
        self.push(&["-o", iface])
    }

    /// Generic `-m <module> <options...>`.
    pub fn matching(self, module: &str, options: &[&str]) -> Self {
        self.push(&["-m", module]).push(options)
    }

    /// `-m set --match-set <name> <direction>` where direction is `src` or `dst`.
    pub fn match_set(self, name: &str, direction: &str) -> Self {
        self.push(&["-m", "set", "--match-set", name, direction])
    }

    /// `-m limit --limit <rate> [--limit-burst <burst>]`.
    pub fn match_limit(self, rate: &str, burst: Option<u32>) -> Self {
        let b = self.push(&["-m", "limit", "--limit", rate]);
        match burst {
            Some(burst) => b.push(&["--limit-burst", &burst.to_string()]),
            None => b,
        }
    }

    pub fn match_state(self, states: &[&str]) -> Self {
        self.push(&["-m", "state", "--state", &states.join(",")])
    }

    pub fn match_conntrack(self, states: &[&str]) -> Self {
        self.push(&["-m", "conntrack", "--ctstate", &states.join(",")])
    }

    pub fn comment(self, text: &str) -> Self {
        self.push(&["-m", "comment", "--comment", text])
    }

    pub fn jump(self, target: Target) -> Self {
        self.push(&["-j", target.as_str()])
    }

    pub fn log_prefix(self, prefix: &str) -> Self {
        self.push(&["--log-prefix", prefix])
    }

    pub fn log_level(self, level: u8) -> Self {
        self.push(&["--log-level", &level.to_string()])
    }

    pub fn build(self) -> RuleSpec {
        RuleSpec(self.spec)
    }
}
