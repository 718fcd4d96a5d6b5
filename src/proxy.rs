//! Proxy representation and status.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

/// Health status of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyStatus {
    /// Not proven alive or dead yet; eligible for selection.
    Unchecked,
    /// Last real use through this proxy was clean.
    Alive,
    /// Banned or failing; skipped until reanimated.
    Dead,
}

/// Protocol a proxy can carry traffic for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Parse a scheme name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a freshly fetched proxy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    /// Endpoint identifier, e.g. `"10.0.0.1:8080"`.
    pub address: String,
    pub anonymous: bool,
    pub schemes: BTreeSet<Scheme>,
    /// Lowercase ISO country code, empty when the source does not say.
    pub country_code: String,
}

impl ProxyEntry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            anonymous: false,
            schemes: [Scheme::Http, Scheme::Https].into_iter().collect(),
            country_code: String::new(),
        }
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn schemes(mut self, schemes: impl IntoIterator<Item = Scheme>) -> Self {
        self.schemes = schemes.into_iter().collect();
        self
    }

    pub fn country(mut self, code: impl Into<String>) -> Self {
        self.country_code = code.into().to_ascii_lowercase();
        self
    }
}

/// State the pool keeps for one proxy endpoint.
///
/// Records are only mutated by [`ProxyPoolManager`](crate::manager::ProxyPoolManager);
/// callers receive clones.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    address: String,
    /// The current status of the proxy.
    pub status: ProxyStatus,
    /// When the proxy was last handed out, `None` if never.
    pub last_used: Option<Instant>,
    /// Failures since the proxy was last seen alive.
    pub failed_attempts: u32,
    pub anonymous: bool,
    pub schemes: BTreeSet<Scheme>,
    pub country_code: String,
    /// Pool-wide pick sequence number of the last use, 0 if never used.
    pub(crate) last_pick: u64,
}

impl ProxyRecord {
    /// Create an UNCHECKED record from a source entry.
    pub fn from_entry(entry: ProxyEntry) -> Self {
        Self {
            address: entry.address,
            status: ProxyStatus::Unchecked,
            last_used: None,
            failed_attempts: 0,
            anonymous: entry.anonymous,
            schemes: entry.schemes,
            country_code: entry.country_code,
            last_pick: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host part of the address, used to group proxies into download slots.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.address,
        }
    }

    /// Proxy URL to route a request for `target` through this proxy.
    pub fn proxy_url(&self, target: Option<Scheme>) -> String {
        let scheme = target
            .filter(|s| self.schemes.contains(s))
            .or_else(|| self.schemes.iter().next().copied())
            .unwrap_or(Scheme::Http);
        format!("{}://{}", scheme, self.address)
    }

    /// Whether the record may be handed out by selection.
    pub fn is_eligible(&self) -> bool {
        self.status != ProxyStatus::Dead
    }

    /// Refresh source metadata from a newer list entry; health state is kept.
    pub(crate) fn update_metadata(&mut self, entry: &ProxyEntry) {
        self.anonymous = entry.anonymous;
        self.schemes = entry.schemes.clone();
        self.country_code = entry.country_code.clone();
    }
}
