//! HTTP fetcher for scanner subnet lists.

use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::enforcer::Family;
use crate::utils::format_count;

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size per list file (10 MB)
const MAX_LIST_SIZE: usize = 10 * 1024 * 1024;

/// Subnets to block, split by family. Each subnet appears once across all
/// sources, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct NetworkList {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    seen: HashSet<String>,
}

impl NetworkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one subnet. Returns `false` if it was already present.
    pub fn push(&mut self, subnet: &str) -> bool {
        if !self.seen.insert(subnet.to_string()) {
            return false;
        }
        match Family::of_subnet(subnet) {
            Family::V4 => self.ipv4.push(subnet.to_string()),
            Family::V6 => self.ipv6.push(subnet.to_string()),
        }
        true
    }

    /// Add every entry of a source list, returning how many were new.
    pub fn extend_from_source(&mut self, content: &str) -> usize {
        parse_source_list(content)
            .into_iter()
            .filter(|subnet| self.push(subnet))
            .count()
    }

    pub fn subnets(&self, family: Family) -> &[String] {
        match family {
            Family::V4 => &self.ipv4,
            Family::V6 => &self.ipv6,
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> FromIterator<&'a str> for NetworkList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut list = NetworkList::new();
        for subnet in iter {
            list.push(subnet);
        }
        list
    }
}

/// Parse a newline-delimited subnet list: entries are trimmed, blank and
/// `#` lines are skipped. Entries are not validated here; the set engine
/// rejects malformed ones.
pub fn parse_source_list(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

/// HTTP client for fetching lists
pub struct Fetcher {
    client: Client,
    max_retries: u32,
}

impl Fetcher {
    /// Create a new fetcher with default settings
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("antiscan/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Number of attempts per URL (at least one).
    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts.max(1);
        self
    }

    /// Download every URL in order. A URL that cannot be fetched is logged
    /// and skipped.
    pub async fn download(&self, urls: &[String]) -> NetworkList {
        info!(url_count = urls.len(), "Downloading subnet lists");

        let mut networks = NetworkList::new();
        for (i, url) in urls.iter().enumerate() {
            info!(index = i + 1, total = urls.len(), url = %url, "Downloading subnet list");

            let content = match self.fetch_with_retry(url).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(url = %url, error = %format!("{:#}", e), "Failed to download, skipping");
                    continue;
                }
            };

            let added = networks.extend_from_source(&content);
            info!(url = %url, added, "Subnet list downloaded");
        }

        info!(
            ipv4_count = networks.ipv4.len(),
            ipv6_count = networks.ipv6.len(),
            "Download complete - {} subnets",
            format_count(networks.len())
        );
        networks
    }

    /// Fetch content with retry logic and size validation
    async fn fetch_with_retry(&self, url: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                debug!("Retry {} after {}ms for {}", attempt, delay, url);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        if let Some(content_length) = response.content_length() {
                            if content_length as usize > MAX_LIST_SIZE {
                                anyhow::bail!(
                                    "Response too large: {} bytes (max: {} bytes)",
                                    content_length,
                                    MAX_LIST_SIZE
                                );
                            }
                        }

                        let body = response
                            .text()
                            .await
                            .context("Failed to read response body")?;

                        if body.len() > MAX_LIST_SIZE {
                            anyhow::bail!(
                                "Downloaded content too large: {} bytes (max: {} bytes)",
                                body.len(),
                                MAX_LIST_SIZE
                            );
                        }

                        return Ok(body);
                    }
                    last_error = Some(anyhow::anyhow!("HTTP {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}
