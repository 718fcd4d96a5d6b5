//! Per logical request state carried through dispatch and completion.

use crate::manager::ProxyLease;
use crate::policy::BanDetectionPolicy;
use crate::proxy::Scheme;

use bytes::Bytes;
use http::Method;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Which proxy, if any, a request goes through.
#[derive(Debug, Default)]
pub enum ProxyAssignment {
    /// The pool picks one on dispatch.
    #[default]
    Unassigned,
    /// Checked out from the pool for the current attempt.
    Pool(ProxyLease),
    /// Pinned by the caller; never overridden.
    Explicit(String),
    /// No proxy, either by caller request or as a direct fallback.
    Direct,
}

/// Where a logical request stands in the rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    New,
    Proxied,
    ResolvedClean,
    RetryWithNewProxy,
    FinalizedPageFailure,
    DirectFallback,
}

/// Rotation bookkeeping for one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttemptState {
    /// Proxies already tried for this request; excluded from selection.
    pub tried_addresses: HashSet<String>,
    /// Proxy-attributable attempts consumed so far.
    pub attempts_used: usize,
    pub retry_budget: usize,
    pub phase: AttemptPhase,
}

impl RequestAttemptState {
    pub fn new(retry_budget: usize) -> Self {
        Self {
            tried_addresses: HashSet::new(),
            attempts_used: 0,
            retry_budget,
            phase: AttemptPhase::New,
        }
    }

    pub fn budget_left(&self) -> bool {
        self.attempts_used < self.retry_budget
    }
}

/// Caller-supplied override, read from the request's `http::Extensions`.
#[derive(Clone, Default)]
pub struct ProxyOverride {
    /// `Some(None)` forces a direct request, `Some(Some(url))` pins a proxy.
    pub proxy: Option<Option<String>>,
    pub retry_budget: Option<usize>,
    /// Ban policy of the job that issued the request.
    pub ban_policy: Option<Arc<dyn BanDetectionPolicy>>,
}

impl ProxyOverride {
    pub fn no_proxy() -> Self {
        Self {
            proxy: Some(None),
            ..Self::default()
        }
    }

    pub fn proxy(url: impl Into<String>) -> Self {
        Self {
            proxy: Some(Some(url.into())),
            ..Self::default()
        }
    }

    pub fn retry_budget(mut self, budget: usize) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn ban_policy(mut self, policy: Arc<dyn BanDetectionPolicy>) -> Self {
        self.ban_policy = Some(policy);
        self
    }
}

impl fmt::Debug for ProxyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOverride")
            .field("proxy", &self.proxy)
            .field("retry_budget", &self.retry_budget)
            .field("ban_policy", &self.ban_policy.is_some())
            .finish()
    }
}

/// Context of one logical request across all of its attempts.
pub struct RequestContext {
    pub method: Method,
    pub url: Url,
    pub(crate) proxy: ProxyAssignment,
    pub(crate) retry_budget: Option<usize>,
    pub(crate) policy: Option<Arc<dyn BanDetectionPolicy>>,
    pub(crate) attempt: Option<RequestAttemptState>,
    /// Outcome of the banned attempt a retry is replacing.
    pub(crate) last_outcome: Option<Outcome>,
}

impl RequestContext {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            proxy: ProxyAssignment::Unassigned,
            retry_budget: None,
            policy: None,
            attempt: None,
            last_outcome: None,
        }
    }

    /// Pin a proxy URL for this request.
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = ProxyAssignment::Explicit(proxy_url.into());
        self
    }

    /// Send this request without any proxy.
    pub fn without_proxy(mut self) -> Self {
        self.proxy = ProxyAssignment::Direct;
        self
    }

    pub fn with_retry_budget(mut self, budget: usize) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn BanDetectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn apply_override(&mut self, over: &ProxyOverride) {
        match &over.proxy {
            Some(Some(url)) => self.proxy = ProxyAssignment::Explicit(url.clone()),
            Some(None) => self.proxy = ProxyAssignment::Direct,
            None => {}
        }
        if over.retry_budget.is_some() {
            self.retry_budget = over.retry_budget;
        }
        if let Some(policy) = &over.ban_policy {
            self.policy = Some(Arc::clone(policy));
        }
    }

    pub fn proxy(&self) -> &ProxyAssignment {
        &self.proxy
    }

    pub fn attempt(&self) -> Option<&RequestAttemptState> {
        self.attempt.as_ref()
    }

    pub fn target_scheme(&self) -> Option<Scheme> {
        Scheme::parse(self.url.scheme())
    }

    /// Address of the pool proxy assigned to the current attempt.
    pub fn pool_address(&self) -> Option<&str> {
        match &self.proxy {
            ProxyAssignment::Pool(lease) => Some(lease.address()),
            _ => None,
        }
    }

    /// Proxy URL for the current attempt, `None` to go direct.
    pub fn proxy_url(&self) -> Option<String> {
        match &self.proxy {
            ProxyAssignment::Pool(lease) => Some(lease.record().proxy_url(self.target_scheme())),
            ProxyAssignment::Explicit(url) => Some(url.clone()),
            ProxyAssignment::Unassigned | ProxyAssignment::Direct => None,
        }
    }

    /// Proxy host the current attempt is throttled under.
    pub fn slot(&self) -> Option<String> {
        match &self.proxy {
            ProxyAssignment::Pool(lease) => Some(lease.record().host().to_string()),
            ProxyAssignment::Explicit(url) => Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string)),
            ProxyAssignment::Unassigned | ProxyAssignment::Direct => None,
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("proxy", &self.proxy)
            .field("attempt", &self.attempt)
            .field("last_status", &self.last_outcome.as_ref().and_then(Outcome::status))
            .finish()
    }
}

/// Coarse class of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Timeout,
    Body,
    /// The request was dropped on purpose downstream.
    Ignored,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::Ignored => "ignored",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request attempt that ended without a response.
#[derive(Debug, Error)]
#[error("{kind} failure: {message}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
    #[source]
    source: Option<reqwest::Error>,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn into_source(self) -> Option<reqwest::Error> {
        self.source
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_connect() {
            FailureKind::Connect
        } else if err.is_body() || err.is_decode() {
            FailureKind::Body
        } else {
            FailureKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// How an attempt ended.
#[derive(Debug)]
pub enum Outcome {
    Response(http::Response<Bytes>),
    Failure(FetchFailure),
}

impl Outcome {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Response(response) => Some(response.status().as_u16()),
            Self::Failure(_) => None,
        }
    }
}
