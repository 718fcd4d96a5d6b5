//! Ban detection: deciding whether an outcome is the proxy's fault.

use crate::config::DEFAULT_BAN_POLICY;
use crate::error::ConfigError;
use crate::request::{FailureKind, FetchFailure, RequestContext};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Statuses that never count as a ban on their own.
pub const NOT_BAN_STATUSES: [u16; 5] = [200, 301, 302, 404, 500];

/// Body markers of interception pages served by broken proxies.
pub const BANNED_MARKERS: [&str; 2] = ["captive portal", "session expired"];

/// Classification of an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The proxy is blocked or broken.
    Ban,
    /// The proxy worked.
    Clean,
    /// No opinion; leave the proxy's health alone.
    Unknown,
}

/// Decides whether an outcome should be blamed on the proxy.
///
/// Both methods default to the built-in heuristics, so an implementation can
/// override either one alone. Implementations must be stateless.
pub trait BanDetectionPolicy: Send + Sync {
    fn response_is_ban(&self, request: &RequestContext, response: &http::Response<Bytes>) -> Verdict {
        default_response_verdict(request, response)
    }

    fn exception_is_ban(&self, request: &RequestContext, failure: &FetchFailure) -> Verdict {
        default_exception_verdict(request, failure)
    }
}

/// The built-in heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBanPolicy;

impl BanDetectionPolicy for DefaultBanPolicy {}

/// Ban on an unexpected status, an empty body or an interception page.
pub fn default_response_verdict(
    _request: &RequestContext,
    response: &http::Response<Bytes>,
) -> Verdict {
    if !NOT_BAN_STATUSES.contains(&response.status().as_u16()) {
        return Verdict::Ban;
    }
    let body = response.body();
    if body.is_empty() || BANNED_MARKERS.iter().any(|m| contains_ignore_case(body, m)) {
        return Verdict::Ban;
    }
    Verdict::Clean
}

/// Any transport failure is the proxy's fault unless the request was ignored.
pub fn default_exception_verdict(_request: &RequestContext, failure: &FetchFailure) -> Verdict {
    match failure.kind {
        FailureKind::Ignored => Verdict::Unknown,
        _ => Verdict::Ban,
    }
}

fn contains_ignore_case(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Named policies the `ban_policy` option can refer to.
#[derive(Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn BanDetectionPolicy>>,
}

impl PolicyRegistry {
    /// A registry holding only the built-in policy under `"default"`.
    pub fn new() -> Self {
        let mut policies: HashMap<String, Arc<dyn BanDetectionPolicy>> = HashMap::new();
        policies.insert(DEFAULT_BAN_POLICY.to_string(), Arc::new(DefaultBanPolicy));
        Self { policies }
    }

    pub fn register(mut self, name: impl Into<String>, policy: Arc<dyn BanDetectionPolicy>) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BanDetectionPolicy>, ConfigError> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPolicy(name.to_string()))
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
