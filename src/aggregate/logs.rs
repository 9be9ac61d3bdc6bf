//! Raw kernel log intake: grab-and-truncate and per-address hit counting.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::cmd_abstraction::CommandRunner;
use crate::enforcer::Family;
use crate::installer::logging::restore_log_ownership;

/// Hits for one source address within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub count: u64,
    /// First field of the last matching line (the syslog timestamp)
    pub last_seen: String,
}

/// Source address → hits, for one family.
pub type LogBatch = BTreeMap<String, Hit>;

/// Read the whole log and truncate it in place, then restore owner and mode
/// so rsyslog keeps writing to it. A missing file yields an empty string.
/// Invalid UTF-8 is replaced, not rejected.
pub fn grab_and_truncate(runner: &CommandRunner, path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }

    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let content = String::from_utf8_lossy(&bytes).into_owned();
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to truncate {:?}", path))?;
    restore_log_ownership(runner, path);

    Ok(content)
}

fn is_address_char(c: char, family: Family) -> bool {
    match family {
        Family::V4 => c.is_ascii_digit() || c == '.',
        Family::V6 => c.is_ascii_hexdigit() || c == ':',
    }
}

/// Source address of a kernel LOG line (`... SRC=1.2.3.4 DST=...`).
pub fn extract_source(line: &str, family: Family) -> Option<&str> {
    let start = line.find("SRC=")? + "SRC=".len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !is_address_char(c, family))
        .unwrap_or(rest.len());
    let addr = &rest[..end];
    (!addr.is_empty()).then_some(addr)
}

/// Count hits per source address over the lines carrying `prefix`.
pub fn parse_log(content: &str, prefix: &str, family: Family) -> LogBatch {
    let prefix = prefix.trim();
    let mut batch = LogBatch::new();

    for line in content.lines().filter(|l| l.contains(prefix)) {
        let Some(addr) = extract_source(line, family) else {
            continue;
        };
        let timestamp = line.split_whitespace().next().unwrap_or_default().to_string();

        batch
            .entry(addr.to_string())
            .and_modify(|hit| {
                hit.count += 1;
                hit.last_seen = timestamp.clone();
            })
            .or_insert(Hit {
                count: 1,
                last_seen: timestamp,
            });
    }

    batch
}
