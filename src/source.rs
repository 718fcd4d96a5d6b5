//! Where proxy lists come from.

use crate::error::SourceError;
use crate::proxy::{ProxyEntry, Scheme};

use async_trait::async_trait;
use futures::future;
use log::{info, warn};
use reqwest::Client;
use std::collections::HashSet;

/// A provider of fresh proxy lists.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ProxyEntry>, SourceError>;
}

/// A fixed list, mostly useful for tests and pinned deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    entries: Vec<ProxyEntry>,
}

impl StaticSource {
    pub fn new(entries: Vec<ProxyEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl ProxySource for StaticSource {
    async fn fetch(&self) -> Result<Vec<ProxyEntry>, SourceError> {
        Ok(self.entries.clone())
    }
}

/// Plain-text proxy lists fetched from URLs or read from files.
///
/// One proxy per line: `[scheme://]host:port [country] [anonymous|elite|transparent]`.
/// Lines starting with `#` are comments.
#[derive(Debug, Clone)]
pub struct ListSource {
    sources: Vec<String>,
    client: Client,
}

impl ListSource {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            client: Client::new(),
        }
    }

    async fn fetch_one(&self, source: &str) -> Result<Vec<ProxyEntry>, SourceError> {
        let content = if source.starts_with("http") {
            let response = self.client.get(source).send().await?.error_for_status()?;
            response.text().await?
        } else {
            tokio::fs::read_to_string(source).await?
        };
        Ok(parse_proxy_list(&content))
    }
}

#[async_trait]
impl ProxySource for ListSource {
    /// Fetch all sources concurrently. Fails only if every source failed.
    async fn fetch(&self) -> Result<Vec<ProxyEntry>, SourceError> {
        let results = future::join_all(self.sources.iter().map(|s| self.fetch_one(s))).await;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut last_error = None;
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(found) => {
                    info!("Fetched {} proxies from {}", found.len(), source);
                    entries.extend(found.into_iter().filter(|e| seen.insert(e.address.clone())));
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", source, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if entries.is_empty() => Err(e),
            _ => Ok(entries),
        }
    }
}

/// Parse a text proxy list. Lines that are not HTTP(S) proxies are skipped.
pub fn parse_proxy_list(content: &str) -> Vec<ProxyEntry> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ProxyEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let target = tokens.next()?;
    let (schemes, address) = match target.split_once("://") {
        Some((scheme, rest)) => (vec![Scheme::parse(scheme)?], rest),
        None => (vec![Scheme::Http, Scheme::Https], target),
    };
    let address = address.trim_end_matches('/');
    if !address.contains(':') {
        return None;
    }

    let mut entry = ProxyEntry::new(address).schemes(schemes);
    for token in tokens {
        match token.to_ascii_lowercase().as_str() {
            "anonymous" | "elite" => entry.anonymous = true,
            "transparent" => entry.anonymous = false,
            code if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
                entry.country_code = code.to_string();
            }
            _ => {}
        }
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_list() {
        let content = "\
# free proxies
10.0.0.1:8080 US elite
http://10.0.0.2:3128 de transparent
socks5://10.0.0.3:1080
not-a-proxy

https://10.0.0.4:443/
";
        let entries = parse_proxy_list(content);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].address, "10.0.0.1:8080");
        assert_eq!(entries[0].country_code, "us");
        assert!(entries[0].anonymous);
        assert_eq!(entries[0].schemes.len(), 2);

        assert_eq!(entries[1].address, "10.0.0.2:3128");
        assert_eq!(entries[1].country_code, "de");
        assert!(!entries[1].anonymous);
        assert!(entries[1].schemes.contains(&Scheme::Http));
        assert!(!entries[1].schemes.contains(&Scheme::Https));

        assert_eq!(entries[2].address, "10.0.0.4:443");
        assert!(entries[2].country_code.is_empty());
    }

    #[tokio::test]
    async fn test_list_source_reads_files() {
        let path = std::env::temp_dir().join(format!("proxy-list-{}.txt", std::process::id()));
        tokio::fs::write(&path, "10.0.0.1:8080 us\n10.0.0.1:8080 us\n10.0.0.2:8080 us\n")
            .await
            .unwrap();

        let source = ListSource::new(vec![
            path.to_string_lossy().into_owned(),
            "/nonexistent/proxy-list.txt".to_string(),
        ]);
        let entries = source.fetch().await.unwrap();
        assert_eq!(entries.len(), 2);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_source_fails_when_every_source_fails() {
        let source = ListSource::new(vec!["/nonexistent/proxy-list.txt".to_string()]);
        assert!(matches!(source.fetch().await, Err(SourceError::Io(_))));
    }
}
