//! ASN and netname enrichment through WHOIS, with a file-backed TTL cache.
//!
//! Cache lines are `ip|asn|netname|unix_ts`. Lines that do not parse, or
//! that are older than the TTL, are treated as absent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::utils::{ensure_parent_dir, write_atomic};

pub const UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    pub asn: String,
    pub netname: String,
}

impl IpInfo {
    pub fn unknown() -> Self {
        Self {
            asn: UNKNOWN.to_string(),
            netname: UNKNOWN.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.asn == UNKNOWN && self.netname == UNKNOWN
    }
}

/// Raw WHOIS query.
#[async_trait]
pub trait WhoisResolver: Send + Sync {
    async fn query(&self, ip: &str) -> Result<String>;
}

/// Plain TCP WHOIS client (port 43 protocol).
pub struct TcpWhois {
    server: String,
}

impl TcpWhois {
    /// `server` is `host:port`.
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
        }
    }
}

#[async_trait]
impl WhoisResolver for TcpWhois {
    async fn query(&self, ip: &str) -> Result<String> {
        let mut stream = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("Failed to connect to {}", self.server))?;
        stream.write_all(format!("{}\r\n", ip).as_bytes()).await?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .context("Failed to read WHOIS response")?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Value of the first line starting with `key` (case-insensitive).
fn first_field(response: &str, key: &str) -> Option<String> {
    response
        .lines()
        .find(|line| {
            line.get(..key.len())
                .map(|head| head.eq_ignore_ascii_case(key))
                .unwrap_or(false)
        })
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

/// Extract ASN (from `origin:`) and netname (from `netname:`).
/// A non-numeric origin reads as unknown.
pub fn parse_whois(response: &str) -> IpInfo {
    let asn = first_field(response, "origin:")
        .map(|raw| {
            let digits = match raw.get(..2) {
                Some(head) if head.eq_ignore_ascii_case("AS") => &raw[2..],
                _ => raw.as_str(),
            };
            digits.to_string()
        })
        .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .map(|digits| format!("AS{}", digits))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let netname = first_field(response, "netname:").unwrap_or_else(|| UNKNOWN.to_string());

    IpInfo { asn, netname }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    ip: String,
    info: IpInfo,
    cached_at: u64,
}

impl CacheEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('|');
        let (ip, asn, netname, ts) = (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
        if fields.next().is_some() || ip.is_empty() {
            return None;
        }
        Some(Self {
            ip: ip.to_string(),
            info: IpInfo {
                asn: asn.to_string(),
                netname: netname.to_string(),
            },
            cached_at: ts.trim().parse().ok()?,
        })
    }

    fn render(&self) -> String {
        format!("{}|{}|{}|{}\n", self.ip, self.info.asn, self.info.netname, self.cached_at)
    }
}

/// Keyed WHOIS results with a staleness window.
pub struct WhoisCache {
    path: PathBuf,
    ttl: u64,
    entries: Vec<CacheEntry>,
}

impl WhoisCache {
    /// Load the cache file, dropping expired and malformed lines.
    /// The file is rewritten when anything was dropped.
    pub fn load(path: &Path, ttl: Duration, now: u64) -> Result<Self> {
        let ttl = ttl.as_secs();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };

        let total = content.lines().filter(|l| !l.trim().is_empty()).count();
        let entries: Vec<CacheEntry> = content
            .lines()
            .filter_map(CacheEntry::parse)
            .filter(|e| !is_expired(e.cached_at, ttl, now))
            .collect();

        let cache = Self {
            path: path.to_path_buf(),
            ttl,
            entries,
        };
        if cache.entries.len() != total {
            debug!(kept = cache.entries.len(), total, "Compacting WHOIS cache");
            cache.persist()?;
        }
        Ok(cache)
    }

    /// First non-expired entry for `ip`.
    pub fn get(&self, ip: &str, now: u64) -> Option<&IpInfo> {
        self.entries
            .iter()
            .find(|e| e.ip == ip && !is_expired(e.cached_at, self.ttl, now))
            .map(|e| &e.info)
    }

    /// Record a result in memory and append it to the file.
    pub fn insert(&mut self, ip: &str, info: IpInfo, now: u64) -> Result<()> {
        let entry = CacheEntry {
            ip: ip.to_string(),
            info,
            cached_at: now,
        };

        ensure_parent_dir(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {:?}", self.path))?;
        file.write_all(entry.render().as_bytes())?;

        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let content: String = self.entries.iter().map(CacheEntry::render).collect();
        write_atomic(&self.path, &content, 0o644)
    }
}

fn is_expired(cached_at: u64, ttl: u64, now: u64) -> bool {
    now.saturating_sub(cached_at) >= ttl
}

/// Cache-first resolution of (ASN, netname).
pub struct IpInfoLookup<R> {
    resolver: R,
    cache: WhoisCache,
    timeout: Duration,
    queries: usize,
}

impl<R: WhoisResolver> IpInfoLookup<R> {
    pub fn new(resolver: R, cache: WhoisCache, timeout: Duration) -> Self {
        Self {
            resolver,
            cache,
            timeout,
            queries: 0,
        }
    }

    /// Never fails: a lookup error or timeout yields UNKNOWN, which is cached too.
    pub async fn lookup(&mut self, ip: &str, now: u64) -> IpInfo {
        if let Some(info) = self.cache.get(ip, now) {
            debug!(ip, asn = %info.asn, "WHOIS cache hit");
            return info.clone();
        }

        self.queries += 1;
        let info = match tokio::time::timeout(self.timeout, self.resolver.query(ip)).await {
            Ok(Ok(response)) => parse_whois(&response),
            Ok(Err(e)) => {
                debug!(ip, error = %e, "WHOIS lookup failed");
                IpInfo::unknown()
            }
            Err(_) => {
                debug!(ip, timeout_secs = self.timeout.as_secs(), "WHOIS lookup timed out");
                IpInfo::unknown()
            }
        };

        if let Err(e) = self.cache.insert(ip, info.clone(), now) {
            warn!(ip, error = %format!("{:#}", e), "Failed to update WHOIS cache");
        }
        info
    }

    /// External queries issued so far.
    pub fn queries(&self) -> usize {
        self.queries
    }
}
