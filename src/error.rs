//! Error types for the rotating-proxy-pool crate.

use thiserror::Error;

/// Error returned when the pool cannot hand out a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExhaustedError {
    /// No ALIVE or UNCHECKED proxy matches the filters, even after reanimation.
    #[error("No proxy available in pool for the requested filters")]
    NoMatch,
    /// The pool was closed after running dry with `close_on_exhaustion` set.
    #[error("Proxy pool closed after exhaustion")]
    Closed,
}

/// Terminal classification of a logical request whose proxy retries ran out,
/// either by spending the budget or by running out of untried proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Gave up after {attempts} attempts with different proxies")]
pub struct PageRetryExceeded {
    /// Number of proxy-attributable attempts consumed.
    pub attempts: usize,
}

/// Error raised while fetching a proxy list from a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to fetch proxy list: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to read proxy list: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy source returned no entries")]
    Empty,
}

/// Error returned for an unusable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Scheme filter must allow at least one of http/https")]
    NoSchemes,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("max_requests_per_second must be positive, got {0}")]
    InvalidRate(String),

    #[error("Unknown ban policy: {0}")]
    UnknownPolicy(String),
}
