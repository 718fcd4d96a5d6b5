//! Per proxy host throttling. Proxies sharing a host share one slot.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

pub struct SlotLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl SlotLimiter {
    pub fn new(max_rps: f64) -> Self {
        let burst = NonZeroU32::new(max_rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(burst)),
        }
    }

    /// Wait until `host` may send another request.
    pub async fn until_ready(&self, host: &str) {
        self.limiter.until_key_ready(&host.to_string()).await;
    }

    /// Forget hosts whose slot has fully replenished.
    ///
    /// Proxy lists churn on every refresh, so without this the map only grows.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    #[cfg(test)]
    fn try_acquire(&self, host: &str) -> bool {
        self.limiter.check_key(&host.to_string()).is_ok()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.limiter.len()
    }
}
