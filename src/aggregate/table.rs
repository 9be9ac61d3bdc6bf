//! The durable per-address counter table.
//!
//! One `|`-separated line per (family, address), sorted by count descending.

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::whois::{IpInfo, UNKNOWN};
use crate::enforcer::Family;
use crate::utils::{ensure_parent_dir, write_atomic};

pub const HEADER: &str = "IP_TYPE|IP_ADDRESS|ASN|NETNAME|COUNT|LAST_SEEN";

const TABLE_MODE: u32 = 0o640;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRecord {
    pub family: Family,
    pub address: String,
    pub asn: String,
    pub netname: String,
    pub count: u64,
    pub last_seen: String,
}

impl AggregateRecord {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        let [tag, address, asn, netname, count, last_seen] = fields.as_slice() else {
            return None;
        };
        Some(Self {
            family: Family::from_tag(tag)?,
            address: address.to_string(),
            asn: asn.to_string(),
            netname: netname.to_string(),
            count: count.trim().parse().ok()?,
            last_seen: last_seen.to_string(),
        })
    }

    fn render(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.family.tag(),
            self.address,
            self.asn,
            self.netname,
            self.count,
            self.last_seen
        )
    }
}

/// New hits for one address, from one aggregation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub family: Family,
    pub address: String,
    pub count: u64,
    pub last_seen: String,
    /// `None` when no usable resolution was obtained this cycle
    pub info: Option<IpInfo>,
}

/// Keyed accumulator over [`AggregateRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateTable {
    records: BTreeMap<(Family, String), AggregateRecord>,
}

impl AggregateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse table content. The first line is the header; lines that do not
    /// have six fields are skipped; repeated keys are summed.
    pub fn parse(content: &str) -> Self {
        let mut table = Self::new();
        for record in content.lines().skip(1).filter_map(AggregateRecord::parse) {
            let key = (record.family, record.address.clone());
            match table.records.get_mut(&key) {
                Some(existing) => {
                    existing.count += record.count;
                    existing.asn = record.asn;
                    existing.netname = record.netname;
                    existing.last_seen = record.last_seen;
                }
                None => {
                    table.records.insert(key, record);
                }
            }
        }
        table
    }

    /// Load from disk; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    /// Add a batch entry: counts sum, last-seen is replaced, ASN and netname
    /// are each replaced only by a freshly resolved value.
    pub fn merge(&mut self, entry: BatchEntry) {
        let key = (entry.family, entry.address.clone());
        match self.records.get_mut(&key) {
            Some(record) => {
                record.count += entry.count;
                record.last_seen = entry.last_seen;
                if let Some(info) = entry.info {
                    if info.asn != UNKNOWN {
                        record.asn = info.asn;
                    }
                    if info.netname != UNKNOWN {
                        record.netname = info.netname;
                    }
                }
            }
            None => {
                let info = entry.info.unwrap_or_else(IpInfo::unknown);
                self.records.insert(
                    key,
                    AggregateRecord {
                        family: entry.family,
                        address: entry.address,
                        asn: info.asn,
                        netname: info.netname,
                        count: entry.count,
                        last_seen: entry.last_seen,
                    },
                );
            }
        }
    }

    pub fn get(&self, family: Family, address: &str) -> Option<&AggregateRecord> {
        self.records.get(&(family, address.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_hits(&self) -> u64 {
        self.records.values().map(|r| r.count).sum()
    }

    /// Records by count descending; ties by family then address.
    pub fn sorted(&self) -> Vec<&AggregateRecord> {
        let mut records: Vec<&AggregateRecord> = self.records.values().collect();
        records.sort_by(|a, b| match b.count.cmp(&a.count) {
            Ordering::Equal => (a.family, &a.address).cmp(&(b.family, &b.address)),
            other => other,
        });
        records
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(HEADER.len() + 1 + self.records.len() * 64);
        out.push_str(HEADER);
        out.push('\n');
        for record in self.sorted() {
            out.push_str(&record.render());
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        write_atomic(path, &self.render(), TABLE_MODE)
    }
}

/// Create the table file with only the header when it does not exist yet.
pub fn ensure_table(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    AggregateTable::new().save(path)?;
    Ok(true)
}

/// Fail unless `path` can be replaced by [`AggregateTable::save`].
pub fn check_writable(path: &Path) -> Result<()> {
    if path.is_dir() {
        anyhow::bail!("{:?} is a directory", path);
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Directory {:?} is not writable", parent))?;
    Ok(())
}

/// Whether an address still lacks any resolution in the table.
pub fn is_unresolved(record: &AggregateRecord) -> bool {
    record.asn == UNKNOWN && record.netname == UNKNOWN
}
