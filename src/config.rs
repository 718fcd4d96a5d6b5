//! Configuration for the proxy pool.

use crate::error::ConfigError;
use crate::pool::ProxyFilter;
use crate::proxy::Scheme;

use std::collections::BTreeSet;
use std::time::Duration;

/// Identifier of the built-in ban detection policy.
pub const DEFAULT_BAN_POLICY: &str = "default";

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Turns the whole mechanism on or off.
    pub enabled: bool,
    /// Source URLs or file paths to fetch proxy lists from.
    pub sources: Vec<String>,
    /// Only select anonymous proxies.
    pub filter_anonymous: bool,
    /// Schemes a selected proxy must support.
    pub filter_schemes: BTreeSet<Scheme>,
    /// Country a selected proxy must be located in, `None` for any.
    pub filter_country: Option<String>,
    /// Interval between background refreshes of the proxy list.
    pub refresh_interval: Duration,
    /// Interval between health summaries in the log.
    pub stats_log_interval: Duration,
    /// Stop handing out proxies for good once the pool runs dry.
    pub close_on_exhaustion: bool,
    /// Trigger an immediate refresh when the pool runs dry.
    pub force_refresh_on_exhaustion: bool,
    /// Clear DEAD marks after every scheduled refresh.
    pub reanimate_on_refresh: bool,
    /// Default number of proxy-attributable retries per logical request.
    pub page_retry_budget: usize,
    /// Allow one final attempt without a proxy after the budget is spent.
    pub direct_fallback_enabled: bool,
    /// Identifier of the ban detection policy to load.
    pub ban_policy: String,
    /// Maximum requests per second per proxy host.
    pub max_requests_per_second: f64,
    /// Timeout for a single proxied attempt.
    pub request_timeout: Duration,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// The selection filter described by the `filter_*` options.
    pub fn filter(&self) -> ProxyFilter {
        ProxyFilter {
            anonymous_only: self.filter_anonymous,
            schemes: self.filter_schemes.clone(),
            country: self.filter_country.clone(),
        }
    }

    /// Reject settings the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter_schemes.is_empty() {
            return Err(ConfigError::NoSchemes);
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("refresh_interval"));
        }
        if self.stats_log_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("stats_log_interval"));
        }
        let rate = self.max_requests_per_second;
        if rate.is_nan() || rate <= 0.0 {
            return Err(ConfigError::InvalidRate(rate.to_string()));
        }
        Ok(())
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfigBuilder {
    enabled: Option<bool>,
    sources: Vec<String>,
    filter_anonymous: Option<bool>,
    filter_schemes: Option<BTreeSet<Scheme>>,
    filter_country: Option<Option<String>>,
    refresh_interval: Option<Duration>,
    stats_log_interval: Option<Duration>,
    close_on_exhaustion: Option<bool>,
    force_refresh_on_exhaustion: Option<bool>,
    reanimate_on_refresh: Option<bool>,
    page_retry_budget: Option<usize>,
    direct_fallback_enabled: Option<bool>,
    ban_policy: Option<String>,
    max_requests_per_second: Option<f64>,
    request_timeout: Option<Duration>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            enabled: None,
            sources: Vec::new(),
            filter_anonymous: None,
            filter_schemes: None,
            filter_country: None,
            refresh_interval: None,
            stats_log_interval: None,
            close_on_exhaustion: None,
            force_refresh_on_exhaustion: None,
            reanimate_on_refresh: None,
            page_retry_budget: None,
            direct_fallback_enabled: None,
            ban_policy: None,
            max_requests_per_second: None,
            request_timeout: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the source URLs or file paths to fetch proxy lists from.
    pub fn sources(mut self, sources: Vec<impl Into<String>>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter_anonymous(mut self, anonymous: bool) -> Self {
        self.filter_anonymous = Some(anonymous);
        self
    }

    pub fn filter_schemes(mut self, schemes: impl IntoIterator<Item = Scheme>) -> Self {
        self.filter_schemes = Some(schemes.into_iter().collect());
        self
    }

    /// Restrict selection to one country; `None` accepts any country.
    pub fn filter_country(mut self, code: Option<&str>) -> Self {
        self.filter_country = Some(code.map(|c| c.to_ascii_lowercase()));
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn stats_log_interval(mut self, interval: Duration) -> Self {
        self.stats_log_interval = Some(interval);
        self
    }

    pub fn close_on_exhaustion(mut self, close: bool) -> Self {
        self.close_on_exhaustion = Some(close);
        self
    }

    pub fn force_refresh_on_exhaustion(mut self, force: bool) -> Self {
        self.force_refresh_on_exhaustion = Some(force);
        self
    }

    pub fn reanimate_on_refresh(mut self, reanimate: bool) -> Self {
        self.reanimate_on_refresh = Some(reanimate);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn page_retry_budget(mut self, budget: usize) -> Self {
        self.page_retry_budget = Some(budget);
        self
    }

    pub fn direct_fallback_enabled(mut self, enabled: bool) -> Self {
        self.direct_fallback_enabled = Some(enabled);
        self
    }

    pub fn ban_policy(mut self, name: impl Into<String>) -> Self {
        self.ban_policy = Some(name.into());
        self
    }

    /// Set the maximum requests per second per proxy host.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            enabled: self.enabled.unwrap_or(true),
            sources: self.sources,
            filter_anonymous: self.filter_anonymous.unwrap_or(false),
            filter_schemes: self
                .filter_schemes
                .unwrap_or_else(|| [Scheme::Http, Scheme::Https].into_iter().collect()),
            filter_country: self.filter_country.unwrap_or_else(|| Some("us".to_string())),
            refresh_interval: self.refresh_interval.unwrap_or(Duration::from_secs(900)),
            stats_log_interval: self.stats_log_interval.unwrap_or(Duration::from_secs(30)),
            close_on_exhaustion: self.close_on_exhaustion.unwrap_or(false),
            force_refresh_on_exhaustion: self.force_refresh_on_exhaustion.unwrap_or(false),
            reanimate_on_refresh: self.reanimate_on_refresh.unwrap_or(false),
            page_retry_budget: self.page_retry_budget.unwrap_or(5),
            direct_fallback_enabled: self.direct_fallback_enabled.unwrap_or(false),
            ban_policy: self
                .ban_policy
                .unwrap_or_else(|| DEFAULT_BAN_POLICY.to_string()),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
