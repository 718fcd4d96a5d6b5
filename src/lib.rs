//! # rotating-proxy-pool
//!
//! A ban-aware rotating proxy pool middleware for reqwest crawlers.
//!
//! Every outgoing request is assigned the least recently used healthy proxy.
//! Once it completes, a [`BanDetectionPolicy`] decides whether the outcome is the
//! proxy's fault. Banned proxies are marked dead and the request is retried
//! through another one, up to a per-request budget; after that the last result
//! is returned as an ordinary page failure, or one direct attempt is made.

pub mod config;
pub mod error;
pub mod interceptor;
pub mod manager;
pub mod middleware;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod scheduler;
pub mod source;
mod slots;
mod stats;

pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use error::{ConfigError, ExhaustedError, PageRetryExceeded, SourceError};
pub use interceptor::{CompletionDecision, DispatchDecision, Interceptor, PageFailure};
pub use manager::{ProxyLease, ProxyPoolManager};
pub use middleware::ProxyPoolMiddleware;
pub use policy::{BanDetectionPolicy, DefaultBanPolicy, PolicyRegistry, Verdict};
pub use pool::{PoolStats, ProxyFilter, ProxyPool};
pub use proxy::{ProxyEntry, ProxyRecord, ProxyStatus, Scheme};
pub use request::{
    AttemptPhase, FailureKind, FetchFailure, Outcome, ProxyAssignment, ProxyOverride,
    RequestAttemptState, RequestContext,
};
pub use scheduler::PoolScheduler;
pub use source::{ListSource, ProxySource, StaticSource};
pub use stats::BanStats;
