//! The rotation state machine that ties selection, ban detection and retries
//! together.
//!
//! Both hooks are plain functions of their inputs: [`Interceptor::on_dispatch`]
//! assigns a proxy, [`Interceptor::on_complete`] classifies the outcome and says
//! whether to pass it on, re-dispatch or give up.

use crate::error::{ConfigError, ExhaustedError, PageRetryExceeded};
use crate::manager::ProxyPoolManager;
use crate::policy::{BanDetectionPolicy, PolicyRegistry, Verdict};
use crate::pool::ProxyFilter;
use crate::request::{AttemptPhase, Outcome, ProxyAssignment, RequestAttemptState, RequestContext};

use log::{debug, warn};
use std::sync::Arc;

/// What to do with a request about to be sent.
#[derive(Debug)]
pub enum DispatchDecision {
    /// Send it, with whatever proxy assignment it now carries.
    Continue(RequestContext),
    /// No proxy can be assigned and no fallback applies.
    Reject(ExhaustedError),
    /// A retry found no proxy left to try; the banned attempt's outcome is
    /// the page's result.
    Finalize(PageFailure),
}

/// What to do once an attempt finished.
#[derive(Debug)]
pub enum CompletionDecision {
    /// Hand the outcome to the caller unchanged.
    Continue(Outcome),
    /// Dispatch the request again.
    Retry(RequestContext),
    /// The retry budget is spent; the last outcome is the page's result.
    Finalize(PageFailure),
}

/// Terminal result of a request that ran out of proxy retries.
#[derive(Debug)]
pub struct PageFailure {
    pub outcome: Outcome,
    pub error: PageRetryExceeded,
}

/// Assigns proxies to requests and rotates them on bans.
pub struct Interceptor {
    manager: Arc<ProxyPoolManager>,
    policy: Arc<dyn BanDetectionPolicy>,
    filter: ProxyFilter,
    retry_budget: usize,
    direct_fallback: bool,
}

impl Interceptor {
    pub fn new(manager: Arc<ProxyPoolManager>, policy: Arc<dyn BanDetectionPolicy>) -> Self {
        let config = &manager.config;
        Self {
            filter: config.filter(),
            retry_budget: config.page_retry_budget,
            direct_fallback: config.direct_fallback_enabled,
            policy,
            manager,
        }
    }

    /// Build with the policy named by the manager's `ban_policy` option.
    pub fn from_registry(
        manager: Arc<ProxyPoolManager>,
        registry: &PolicyRegistry,
    ) -> Result<Self, ConfigError> {
        let policy = registry.resolve(&manager.config.ban_policy)?;
        Ok(Self::new(manager, policy))
    }

    pub fn manager(&self) -> &Arc<ProxyPoolManager> {
        &self.manager
    }

    /// Per-job policy first, then the configured one.
    fn policy_for<'a>(&'a self, request: &'a RequestContext) -> &'a dyn BanDetectionPolicy {
        request.policy.as_deref().unwrap_or(self.policy.as_ref())
    }

    pub fn on_dispatch(&self, mut request: RequestContext) -> DispatchDecision {
        if !matches!(request.proxy, ProxyAssignment::Unassigned) {
            return DispatchDecision::Continue(request);
        }

        let last = request.last_outcome.take();
        let filter = self.filter.narrowed_to(request.target_scheme());
        let budget = request.retry_budget.unwrap_or(self.retry_budget);
        let attempt = request
            .attempt
            .get_or_insert_with(|| RequestAttemptState::new(budget));

        match self.manager.select(&filter, &attempt.tried_addresses) {
            Ok(lease) => {
                debug!(
                    "[ProxyChosen] {} for {} (attempt {})",
                    lease.address(),
                    request.url,
                    attempt.attempts_used + 1
                );
                attempt.phase = AttemptPhase::Proxied;
                request.proxy = ProxyAssignment::Pool(lease);
                DispatchDecision::Continue(request)
            }
            Err(ExhaustedError::NoMatch) if self.direct_fallback => {
                warn!("No proxies available for {}, trying with host IP", request.url);
                attempt.phase = AttemptPhase::DirectFallback;
                request.proxy = ProxyAssignment::Direct;
                DispatchDecision::Continue(request)
            }
            Err(e) => match last {
                Some(outcome) => {
                    debug!(
                        "No untried proxy left for {} ({}), giving up after {} attempts",
                        request.url, e, attempt.attempts_used
                    );
                    attempt.phase = AttemptPhase::FinalizedPageFailure;
                    DispatchDecision::Finalize(PageFailure {
                        outcome,
                        error: PageRetryExceeded {
                            attempts: attempt.attempts_used,
                        },
                    })
                }
                None => DispatchDecision::Reject(e),
            },
        }
    }

    pub fn on_complete(&self, mut request: RequestContext, outcome: Outcome) -> CompletionDecision {
        let address = match &request.proxy {
            ProxyAssignment::Pool(lease) => lease.address().to_string(),
            // Caller-pinned, direct and fallback attempts are never rotated.
            _ => return CompletionDecision::Continue(outcome),
        };

        let policy = self.policy_for(&request);
        let verdict = match &outcome {
            Outcome::Response(response) => policy.response_is_ban(&request, response),
            Outcome::Failure(failure) => policy.exception_is_ban(&request, failure),
        };

        let budget = request.retry_budget.unwrap_or(self.retry_budget);
        let attempt = request
            .attempt
            .get_or_insert_with(|| RequestAttemptState::new(budget));

        match verdict {
            Verdict::Clean => {
                self.manager.mark_alive(&address);
                attempt.phase = AttemptPhase::ResolvedClean;
                CompletionDecision::Continue(outcome)
            }
            Verdict::Unknown => {
                attempt.phase = AttemptPhase::ResolvedClean;
                CompletionDecision::Continue(outcome)
            }
            Verdict::Ban => {
                let reason = self.record_ban(&outcome);
                self.manager.mark_dead(&address, &reason);
                attempt.tried_addresses.insert(address);
                attempt.attempts_used += 1;

                if attempt.budget_left() {
                    debug!(
                        "Retrying {} with another proxy (failed {} times, max retries: {})",
                        request.url, attempt.attempts_used, attempt.retry_budget
                    );
                    attempt.phase = AttemptPhase::RetryWithNewProxy;
                    request.proxy = ProxyAssignment::Unassigned;
                    request.last_outcome = Some(outcome);
                    return CompletionDecision::Retry(request);
                }

                let attempts = attempt.attempts_used;
                debug!(
                    "Gave up retrying {} (failed {} times with different proxies)",
                    request.url, attempts
                );
                if self.direct_fallback {
                    debug!("Trying {} with host IP", request.url);
                    attempt.phase = AttemptPhase::DirectFallback;
                    request.proxy = ProxyAssignment::Direct;
                    return CompletionDecision::Retry(request);
                }

                attempt.phase = AttemptPhase::FinalizedPageFailure;
                CompletionDecision::Finalize(PageFailure {
                    outcome,
                    error: PageRetryExceeded { attempts },
                })
            }
        }
    }

    fn record_ban(&self, outcome: &Outcome) -> String {
        let stats = self.manager.ban_stats();
        match outcome {
            Outcome::Response(response) => {
                let status = response.status().as_u16();
                stats.record_status(status);
                if response.body().is_empty() {
                    stats.record_empty();
                    format!("status {}, empty body", status)
                } else {
                    format!("status {}", status)
                }
            }
            Outcome::Failure(failure) => {
                stats.record_error(failure.kind.as_str());
                failure.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyPoolConfig;
    use crate::proxy::{ProxyEntry, ProxyStatus};
    use bytes::Bytes;
    use http::Method;
    use url::Url;

    fn interceptor(budget: usize, addresses: &[&str]) -> Interceptor {
        let config = ProxyPoolConfig::builder().page_retry_budget(budget).build();
        let entries = addresses
            .iter()
            .map(|a| ProxyEntry::new(*a).country("us"))
            .collect();
        let manager = Arc::new(ProxyPoolManager::with_entries(config, entries));
        Interceptor::from_registry(manager, &PolicyRegistry::new()).unwrap()
    }

    fn request() -> RequestContext {
        RequestContext::new(Method::GET, Url::parse("http://example.com/").unwrap())
    }

    fn response(status: u16) -> Outcome {
        let mut response = http::Response::new(Bytes::from_static(b"<html>ok</html>"));
        *response.status_mut() = http::StatusCode::from_u16(status).unwrap();
        Outcome::Response(response)
    }

    fn dispatched(interceptor: &Interceptor, request: RequestContext) -> RequestContext {
        match interceptor.on_dispatch(request) {
            DispatchDecision::Continue(request) => request,
            other => panic!("dispatch not continued: {:?}", other),
        }
    }

    #[test]
    fn test_clean_response_marks_alive() {
        let interceptor = interceptor(5, &["a:1"]);
        let request = dispatched(&interceptor, request());
        assert_eq!(request.attempt().unwrap().phase, AttemptPhase::Proxied);

        match interceptor.on_complete(request, response(404)) {
            CompletionDecision::Continue(outcome) => assert_eq!(outcome.status(), Some(404)),
            other => panic!("unexpected decision: {:?}", other),
        }
        let record = interceptor.manager().record("a:1").unwrap();
        assert_eq!(record.status, ProxyStatus::Alive);
    }

    #[test]
    fn test_ban_rotates_to_another_proxy() {
        let interceptor = interceptor(5, &["a:1", "b:1"]);
        let request = dispatched(&interceptor, request());
        let first = request.pool_address().unwrap().to_string();

        let retry = match interceptor.on_complete(request, response(403)) {
            CompletionDecision::Retry(request) => request,
            other => panic!("unexpected decision: {:?}", other),
        };
        let state = retry.attempt().unwrap();
        assert_eq!(state.attempts_used, 1);
        assert_eq!(state.phase, AttemptPhase::RetryWithNewProxy);
        assert!(state.tried_addresses.contains(&first));
        assert_eq!(
            interceptor.manager().record(&first).unwrap().status,
            ProxyStatus::Dead
        );

        let retry = dispatched(&interceptor, retry);
        assert_ne!(retry.pool_address().unwrap(), first);
        assert_eq!(retry.attempt().unwrap().attempts_used, 1);
    }

    #[test]
    fn test_retry_without_untried_proxy_keeps_last_response() {
        let interceptor = interceptor(5, &["a:1"]);
        let request = dispatched(&interceptor, request());

        let retry = match interceptor.on_complete(request, response(403)) {
            CompletionDecision::Retry(request) => request,
            other => panic!("unexpected decision: {:?}", other),
        };
        match interceptor.on_dispatch(retry) {
            DispatchDecision::Finalize(failure) => {
                assert_eq!(failure.outcome.status(), Some(403));
                assert_eq!(failure.error.attempts, 1);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        // The pool as a whole ran dry, so the banned proxy was reanimated for
        // other requests, but this one never went back to it.
        assert_eq!(interceptor.manager().stats().dead, 0);
    }

    #[test]
    fn test_explicit_proxy_is_left_alone() {
        let interceptor = interceptor(5, &["a:1"]);
        let request = dispatched(&interceptor, request().with_proxy("http://10.9.9.9:8080"));
        assert!(matches!(request.proxy(), ProxyAssignment::Explicit(_)));
        assert!(request.attempt().is_none());

        assert!(matches!(
            interceptor.on_complete(request, response(403)),
            CompletionDecision::Continue(_)
        ));
        assert_eq!(interceptor.manager().stats().dead, 0);
    }
}
