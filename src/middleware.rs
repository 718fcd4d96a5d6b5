//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::interceptor::{CompletionDecision, DispatchDecision, Interceptor, PageFailure};
use crate::manager::ProxyPoolManager;
use crate::policy::PolicyRegistry;
use crate::request::{FetchFailure, Outcome, ProxyOverride, RequestContext};
use crate::scheduler::PoolScheduler;
use crate::source::{ListSource, ProxySource};

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that routes requests through a rotating pool of proxies.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    interceptor: Arc<Interceptor>,
    scheduler: Arc<Mutex<Option<PoolScheduler>>>,
}

impl ProxyPoolMiddleware {
    /// Create the middleware, loading proxies from `config.sources`.
    pub async fn new(config: ProxyPoolConfig) -> Result<Self> {
        let source = Arc::new(ListSource::new(config.sources.clone()));
        Self::with_source(config, source, &PolicyRegistry::new()).await
    }

    /// Create the middleware with a custom list source and policy registry.
    ///
    /// The first list is loaded before this returns; background refresh and
    /// stats tasks are started on the current runtime.
    pub async fn with_source(
        config: ProxyPoolConfig,
        source: Arc<dyn ProxySource>,
        registry: &PolicyRegistry,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::Middleware(anyhow!(e)))?;

        let enabled = config.enabled;
        let manager = Arc::new(ProxyPoolManager::new(config));
        let interceptor = Interceptor::from_registry(Arc::clone(&manager), registry)
            .map_err(|e| Error::Middleware(anyhow!(e)))?;

        let scheduler = if enabled {
            match manager.refresh_from(source.as_ref()).await {
                Ok(_) => {
                    let stats = manager.stats();
                    info!("Proxy pool initialized with {} proxies", stats.total);
                }
                Err(e) => warn!("Initial proxy list fetch failed: {}", e),
            }
            Some(PoolScheduler::spawn(Arc::clone(&manager), source))
        } else {
            info!("Proxy pool disabled, requests go out directly");
            None
        };

        Ok(Self {
            interceptor: Arc::new(interceptor),
            scheduler: Arc::new(Mutex::new(scheduler)),
        })
    }

    pub fn manager(&self) -> &Arc<ProxyPoolManager> {
        self.interceptor.manager()
    }

    /// Stop the background tasks. Requests still in flight are not waited for.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    async fn execute(&self, ctx: &RequestContext, request: reqwest::Request) -> Outcome {
        if let Some(slot) = ctx.slot() {
            self.manager().slots().until_ready(&slot).await;
        }

        let mut builder =
            reqwest::Client::builder().timeout(self.manager().config.request_timeout);
        builder = match ctx.proxy_url() {
            Some(url) => match reqwest::Proxy::all(&url) {
                Ok(proxy) => builder.proxy(proxy),
                Err(e) => {
                    warn!("Failed to create proxy from {}: {}", url, e);
                    return Outcome::Failure(FetchFailure::from(e));
                }
            },
            None => builder.no_proxy(),
        };
        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => return Outcome::Failure(FetchFailure::from(e)),
        };

        let response = match client.execute(request).await {
            Ok(response) => response,
            Err(e) => return Outcome::Failure(FetchFailure::from(e)),
        };
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        match response.bytes().await {
            Ok(body) => {
                let mut buffered = http::Response::new(body);
                *buffered.status_mut() = status;
                *buffered.version_mut() = version;
                *buffered.headers_mut() = headers;
                Outcome::Response(buffered)
            }
            Err(e) => Outcome::Failure(FetchFailure::from(e)),
        }
    }
}

fn into_result(outcome: Outcome) -> Result<reqwest::Response> {
    match outcome {
        Outcome::Response(response) => Ok(reqwest::Response::from(response)),
        Outcome::Failure(failure) => {
            let message = failure.to_string();
            match failure.into_source() {
                Some(e) => Err(Error::Reqwest(e)),
                None => Err(Error::Middleware(anyhow!(message))),
            }
        }
    }
}

/// Surface the last attempt of a page that ran out of proxies, marked with
/// [`PageRetryExceeded`](crate::error::PageRetryExceeded) when it is a response.
fn finalize(failure: PageFailure, url: &url::Url) -> Result<reqwest::Response> {
    warn!("{} for {}", failure.error, url);
    let mut result = into_result(failure.outcome);
    if let Ok(response) = result.as_mut() {
        response.extensions_mut().insert(failure.error);
    }
    result
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<reqwest::Response> {
        if !self.manager().config.enabled {
            return next.run(req, extensions).await;
        }

        let mut ctx = RequestContext::new(req.method().clone(), req.url().clone());
        if let Some(over) = extensions.get::<ProxyOverride>() {
            ctx.apply_override(over);
        }

        loop {
            ctx = match self.interceptor.on_dispatch(ctx) {
                DispatchDecision::Continue(ctx) => ctx,
                DispatchDecision::Finalize(failure) => return finalize(failure, req.url()),
                DispatchDecision::Reject(e) => {
                    let stats = self.manager().stats();
                    warn!("No proxy available. Total: {}, Alive: {}", stats.total, stats.alive);
                    return Err(Error::Middleware(anyhow!(e)));
                }
            };

            let attempt = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                ))
            })?;
            let outcome = self.execute(&ctx, attempt).await;

            match self.interceptor.on_complete(ctx, outcome) {
                CompletionDecision::Continue(outcome) => return into_result(outcome),
                CompletionDecision::Retry(next_ctx) => ctx = next_ctx,
                CompletionDecision::Finalize(failure) => return finalize(failure, req.url()),
            }
        }
    }
}
