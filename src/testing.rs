//! Stateful fake of the host's firewall tooling for unit tests.
//!
//! [`FakeHost`] interprets the subset of `iptables`, `ipset`, `ufw` and
//! `*-save` invocations antiscan issues and keeps the resulting chains and
//! sets in memory, so reconciliation can be run twice and compared.
//! Every other known binary succeeds without effect.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cmd_abstraction::{CommandExecutor, CommandOutput, CommandRunner};
use crate::enforcer::{Family, RuleSpec};

const DEFAULT_BINARIES: &[&str] = &[
    "iptables",
    "ip6tables",
    "iptables-save",
    "ip6tables-save",
    "iptables-restore",
    "ip6tables-restore",
    "ipset",
    "systemctl",
    "chown",
    "env",
    "apt-get",
    "yum",
    "netfilter-persistent",
];

const BUILTIN_CHAINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];
const BUILTIN_TARGETS: &[&str] = &["ACCEPT", "DROP", "REJECT", "LOG", "RETURN"];

type ChainKey = (Family, String, String);

#[derive(Debug, Clone)]
struct FakeSet {
    family: Family,
    create_line: String,
    members: Vec<String>,
}

#[derive(Debug, Default)]
struct UfwState {
    active: bool,
    added: String,
    files: Option<(PathBuf, PathBuf)>,
}

#[derive(Debug, Default)]
struct HostState {
    binaries: HashSet<String>,
    calls: Vec<String>,
    stdin_inputs: Vec<String>,
    fail_on: Vec<String>,
    fail_once: Vec<String>,
    chains: BTreeMap<ChainKey, Vec<Vec<String>>>,
    sets: BTreeMap<String, FakeSet>,
    ufw: UfwState,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        success: true,
        code: Some(0),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        success: false,
        code: Some(1),
    }
}

fn key(family: Family, table: &str, chain: &str) -> ChainKey {
    (family, table.to_string(), chain.to_string())
}

/// Split an iptables-restore line, honouring double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

fn valid_entry(entry: &str, family: Family) -> bool {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let (matches_family, max_prefix) = match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => (family == Family::V4, 32),
        Ok(IpAddr::V6(_)) => (family == Family::V6, 128),
        Err(_) => return false,
    };
    let prefix_ok = match prefix {
        None => true,
        Some(p) => p.parse::<u8>().map(|p| p <= max_prefix).unwrap_or(false),
    };
    matches_family && prefix_ok
}

impl HostState {
    fn with_builtin_chains() -> Self {
        let mut state = HostState::default();
        for family in Family::ALL {
            for chain in BUILTIN_CHAINS {
                state.chains.insert(key(family, "filter", chain), Vec::new());
            }
        }
        state
    }

    fn injected_failure(&mut self, rendered: &str) -> bool {
        if let Some(pos) = self.fail_once.iter().position(|p| rendered.starts_with(p.as_str())) {
            self.fail_once.remove(pos);
            return true;
        }
        self.fail_on.iter().any(|p| rendered.starts_with(p.as_str()))
    }

    fn dispatch(&mut self, cmd: &str, args: &[String]) -> CommandOutput {
        match cmd {
            "iptables" => self.iptables(Family::V4, args),
            "ip6tables" => self.iptables(Family::V6, args),
            "iptables-save" => ok(self.render_save(Family::V4)),
            "ip6tables-save" => ok(self.render_save(Family::V6)),
            "ipset" => self.ipset(args),
            "ufw" => self.ufw(args),
            _ => ok(""),
        }
    }

    fn iptables(&mut self, family: Family, args: &[String]) -> CommandOutput {
        let mut rest = args;
        let mut table = "filter";
        if rest.first().map(String::as_str) == Some("-t") {
            let Some(t) = rest.get(1) else {
                return fail("option \"-t\" requires an argument");
            };
            table = t.as_str();
            rest = &rest[2..];
        }

        let (Some(op), Some(chain)) = (rest.first(), rest.get(1)) else {
            return fail("no command specified");
        };
        let k = key(family, table, chain);
        let spec: Vec<String> = rest[2..].to_vec();
        let missing = || fail("iptables: No chain/target/match by that name.");

        match op.as_str() {
            "-N" => {
                if self.chains.contains_key(&k) {
                    return fail("iptables: Chain already exists.");
                }
                self.chains.insert(k, Vec::new());
                ok("")
            }
            "-F" => match self.chains.get_mut(&k) {
                Some(rules) => {
                    rules.clear();
                    ok("")
                }
                None => missing(),
            },
            "-X" => {
                let empty = match self.chains.get(&k) {
                    Some(rules) => rules.is_empty(),
                    None => return missing(),
                };
                if !empty {
                    return fail("iptables: Directory not empty.");
                }
                self.chains.remove(&k);
                ok("")
            }
            "-L" => match self.chains.get(&k) {
                Some(rules) => {
                    let mut out = format!("Chain {} ({} rules)\n", chain, rules.len());
                    for rule in rules {
                        out.push_str(&rule.join(" "));
                        out.push('\n');
                    }
                    ok(out)
                }
                None => missing(),
            },
            "-C" => match self.chains.get(&k) {
                Some(rules) if rules.contains(&spec) => ok(""),
                _ => fail("iptables: Bad rule (does a matching rule exist in that chain?)."),
            },
            "-D" => match self.chains.get_mut(&k) {
                Some(rules) => match rules.iter().position(|r| *r == spec) {
                    Some(pos) => {
                        rules.remove(pos);
                        ok("")
                    }
                    None => fail("iptables: Bad rule (does a matching rule exist in that chain?)."),
                },
                None => missing(),
            },
            "-A" | "-I" => {
                let explicit = spec.first().and_then(|t| t.parse::<usize>().ok());
                let (position, spec) = match (op.as_str(), explicit) {
                    ("-I", Some(pos)) => (Some(pos), spec[1..].to_vec()),
                    ("-I", None) => (Some(1), spec),
                    _ => (None, spec),
                };

                if let Some(target) = spec.iter().position(|t| t == "-j").and_then(|i| spec.get(i + 1)) {
                    let known = BUILTIN_TARGETS.contains(&target.as_str())
                        || self.chains.contains_key(&key(family, table, target));
                    if !known {
                        return fail(format!(
                            "iptables v1.8.9 (nf_tables): Chain '{}' does not exist",
                            target
                        ));
                    }
                }

                let Some(rules) = self.chains.get_mut(&k) else {
                    return missing();
                };
                match position {
                    Some(pos) => {
                        let at = pos.saturating_sub(1).min(rules.len());
                        rules.insert(at, spec);
                    }
                    None => rules.push(spec),
                }
                ok("")
            }
            other => fail(format!("unknown option \"{}\"", other)),
        }
    }

    fn render_save(&self, family: Family) -> String {
        let mut tables: BTreeMap<&str, Vec<(&str, &Vec<Vec<String>>)>> = BTreeMap::new();
        for ((f, table, chain), rules) in &self.chains {
            if *f == family {
                tables.entry(table.as_str()).or_default().push((chain.as_str(), rules));
            }
        }

        let mut out = String::new();
        for (table, chains) in tables {
            out.push_str(&format!("*{}\n", table));
            for (chain, _) in &chains {
                let policy = if BUILTIN_CHAINS.contains(chain) { "ACCEPT" } else { "-" };
                out.push_str(&format!(":{} {} [0:0]\n", chain, policy));
            }
            for (chain, rules) in &chains {
                for rule in rules.iter() {
                    let spec: RuleSpec = rule.iter().map(String::as_str).collect();
                    out.push_str(&spec.to_rules_line(chain));
                    out.push('\n');
                }
            }
            out.push_str("COMMIT\n");
        }
        out
    }

    fn ipset(&mut self, args: &[String]) -> CommandOutput {
        let Some(op) = args.first() else {
            return fail("No command specified");
        };
        let name = args.get(1).cloned().unwrap_or_default();
        let no_set = || fail("ipset v7.19: The set with the given name does not exist");

        match op.as_str() {
            "create" => {
                if self.sets.contains_key(&name) {
                    return fail("ipset v7.19: Set cannot be created: set with the same name already exists");
                }
                let family = match args.iter().position(|a| a == "family").and_then(|i| args.get(i + 1)) {
                    Some(f) if f == "inet6" => Family::V6,
                    _ => Family::V4,
                };
                self.sets.insert(
                    name,
                    FakeSet {
                        family,
                        create_line: args.join(" "),
                        members: Vec::new(),
                    },
                );
                ok("")
            }
            "destroy" => match self.sets.remove(&name) {
                Some(_) => ok(""),
                None => no_set(),
            },
            "flush" => match self.sets.get_mut(&name) {
                Some(set) => {
                    set.members.clear();
                    ok("")
                }
                None => no_set(),
            },
            "add" => {
                let entry = args.get(2).cloned().unwrap_or_default();
                let Some(set) = self.sets.get_mut(&name) else {
                    return no_set();
                };
                if !valid_entry(&entry, set.family) {
                    return fail(format!("ipset v7.19: Syntax error: '{}' is invalid as number", entry));
                }
                if set.members.contains(&entry) {
                    return fail("ipset v7.19: Element cannot be added to the set: it's already added");
                }
                set.members.push(entry);
                ok("")
            }
            "del" => {
                let entry = args.get(2).cloned().unwrap_or_default();
                let Some(set) = self.sets.get_mut(&name) else {
                    return no_set();
                };
                match set.members.iter().position(|m| *m == entry) {
                    Some(pos) => {
                        set.members.remove(pos);
                        ok("")
                    }
                    None => fail("ipset v7.19: Element cannot be deleted from the set: it's not added"),
                }
            }
            "test" => {
                let entry = args.get(2).cloned().unwrap_or_default();
                let Some(set) = self.sets.get(&name) else {
                    return no_set();
                };
                if set.members.contains(&entry) {
                    ok(format!("{} is in set {}.\n", entry, name))
                } else {
                    fail(format!("{} is NOT in set {}.\n", entry, name))
                }
            }
            "list" => match self.sets.get(&name) {
                Some(set) => {
                    let mut out = format!(
                        "Name: {}\nType: hash:net\nNumber of entries: {}\nMembers:\n",
                        name,
                        set.members.len()
                    );
                    for member in &set.members {
                        out.push_str(member);
                        out.push('\n');
                    }
                    ok(out)
                }
                None => no_set(),
            },
            "save" => {
                let mut out = String::new();
                for (name, set) in &self.sets {
                    out.push_str(&set.create_line);
                    out.push('\n');
                    for member in &set.members {
                        out.push_str(&format!("add {} {}\n", name, member));
                    }
                }
                ok(out)
            }
            "restore" => ok(""),
            other => fail(format!("ipset v7.19: Unknown argument: `{}'", other)),
        }
    }

    fn ufw(&mut self, args: &[String]) -> CommandOutput {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["status", ..] => {
                let status = if self.ufw.active { "active" } else { "inactive" };
                ok(format!("Status: {}\n", status))
            }
            ["--force", "enable"] => {
                self.drop_ufw_chains();
                self.ufw.active = true;
                self.load_ufw_files();
                ok("Firewall is active and enabled on system startup\n")
            }
            ["--force", "disable"] => {
                self.drop_ufw_chains();
                self.ufw.active = false;
                ok("Firewall stopped and disabled on system startup\n")
            }
            ["show", "added"] => ok(self.ufw.added.clone()),
            _ => ok(""),
        }
    }

    fn drop_ufw_chains(&mut self) {
        self.chains.retain(|(_, _, chain), _| !chain.starts_with("ufw"));
    }

    /// Mimic UFW loading its before-rules files: declarations first, then rules.
    fn load_ufw_files(&mut self) {
        let files = self.ufw.files.clone();
        for family in Family::ALL {
            let path = files.as_ref().map(|(v4, v6)| match family {
                Family::V4 => v4.clone(),
                Family::V6 => v6.clone(),
            });
            let before_input = match family {
                Family::V4 => "ufw-before-input",
                Family::V6 => "ufw6-before-input",
            };
            self.chains.insert(key(family, "filter", before_input), Vec::new());

            let Some(content) = path.and_then(|p| std::fs::read_to_string(p).ok()) else {
                continue;
            };
            for line in content.lines() {
                if let Some(decl) = line.strip_prefix(':') {
                    if let Some(chain) = decl.split_whitespace().next() {
                        self.chains.insert(key(family, "filter", chain), Vec::new());
                    }
                }
            }
            for line in content.lines() {
                let tokens = tokenize(line);
                if tokens.len() >= 2 && tokens[0] == "-A" {
                    self.chains
                        .entry(key(family, "filter", &tokens[1]))
                        .or_default()
                        .push(tokens[2..].to_vec());
                }
            }
        }
    }
}

struct FakeExecutor {
    state: Arc<Mutex<HostState>>,
}

impl FakeExecutor {
    fn run(&self, cmd: &str, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        let mut state = self.state.lock().map_err(|_| anyhow!("fake host poisoned"))?;
        let rendered = if args.is_empty() {
            cmd.to_string()
        } else {
            format!("{} {}", cmd, args.join(" "))
        };
        state.calls.push(rendered.clone());
        if let Some(input) = stdin {
            state.stdin_inputs.push(input.to_string());
        }

        if !state.binaries.contains(cmd) {
            return Err(anyhow!("No such file or directory (os error 2)"));
        }
        if state.injected_failure(&rendered) {
            return Ok(fail(format!("{}: injected failure", cmd)));
        }
        Ok(state.dispatch(cmd, args))
    }
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        self.run(cmd, args, None)
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput> {
        self.run(cmd, args, Some(stdin))
    }

    fn command_exists(&self, cmd: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.binaries.contains(cmd))
            .unwrap_or(false)
    }
}

/// In-memory host. Clones share state.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let mut state = HostState::with_builtin_chains();
        state.binaries = DEFAULT_BINARIES.iter().map(|b| b.to_string()).collect();
        state.ufw.added = "Added user rules (see 'ufw status' for running firewall):\n(None)\n".to_string();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn runner(&self) -> CommandRunner {
        CommandRunner::new(Box::new(FakeExecutor {
            state: Arc::clone(&self.state),
        }))
    }

    /// Install UFW, active or not.
    pub fn with_ufw(self, active: bool) -> Self {
        {
            let mut state = self.lock();
            state.binaries.insert("ufw".to_string());
            state.ufw.active = active;
        }
        self
    }

    /// Output of `ufw show added`.
    pub fn ufw_added(self, text: &str) -> Self {
        self.lock().ufw.added = text.to_string();
        self
    }

    /// Before-rules files UFW loads on enable.
    pub fn ufw_files(self, v4: &Path, v6: &Path) -> Self {
        self.lock().ufw.files = Some((v4.to_path_buf(), v6.to_path_buf()));
        self
    }

    pub fn without_binary(self, name: &str) -> Self {
        self.lock().binaries.remove(name);
        self
    }

    /// Every command whose rendered form starts with `prefix` fails.
    pub fn fail_on(self, prefix: &str) -> Self {
        self.lock().fail_on.push(prefix.to_string());
        self
    }

    /// The next command starting with `prefix` fails, later ones succeed.
    pub fn fail_once(self, prefix: &str) -> Self {
        self.lock().fail_once.push(prefix.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn stdin_inputs(&self) -> Vec<String> {
        self.lock().stdin_inputs.clone()
    }

    /// Rules of a filter-table chain, tokens joined by spaces.
    pub fn chain_rules(&self, family: Family, chain: &str) -> Vec<String> {
        self.lock()
            .chains
            .get(&key(family, "filter", chain))
            .map(|rules| rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, family: Family, chain: &str) -> bool {
        self.lock().chains.contains_key(&key(family, "filter", chain))
    }

    /// Every chain of every table with its rules, for before/after comparison.
    pub fn snapshot_rules(&self) -> BTreeMap<(Family, String, String), Vec<String>> {
        self.lock()
            .chains
            .iter()
            .map(|(k, rules)| (k.clone(), rules.iter().map(|r| r.join(" ")).collect()))
            .collect()
    }

    pub fn set_exists(&self, name: &str) -> bool {
        self.lock().sets.contains_key(name)
    }

    pub fn set_members(&self, name: &str) -> Vec<String> {
        self.lock()
            .sets
            .get(name)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn ufw_active(&self) -> bool {
        self.lock().ufw.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keeps_quoted_spaces() {
        assert_eq!(
            tokenize(r#"-A X -j LOG --log-prefix "ANTISCAN-v4: " --log-level 4"#),
            vec!["-A", "X", "-j", "LOG", "--log-prefix", "ANTISCAN-v4: ", "--log-level", "4"]
        );
    }

    #[test]
    fn test_valid_entry() {
        assert!(valid_entry("1.2.3.0/24", Family::V4));
        assert!(valid_entry("1.2.3.4", Family::V4));
        assert!(!valid_entry("1.2.3.0/33", Family::V4));
        assert!(!valid_entry("2001:db8::/32", Family::V4));
        assert!(valid_entry("2001:db8::/32", Family::V6));
        assert!(!valid_entry("bogus", Family::V6));
    }

    #[test]
    fn test_unknown_binary_fails_to_spawn() {
        let host = FakeHost::new();
        let runner = host.runner();
        assert!(runner.run("nft", &["list", "ruleset"]).is_err());
        assert!(!runner.command_exists("ufw"));
        assert_eq!(host.calls(), vec!["nft list ruleset".to_string()]);
    }
}
