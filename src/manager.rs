//! The pool manager: sole owner of proxy health state.

use crate::config::ProxyPoolConfig;
use crate::error::{ExhaustedError, SourceError};
use crate::pool::{MergeSummary, PoolStats, ProxyFilter, ProxyPool};
use crate::proxy::{ProxyEntry, ProxyRecord, ProxyStatus};
use crate::slots::SlotLimiter;
use crate::source::ProxySource;
use crate::stats::BanStats;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct PoolState {
    pool: ProxyPool,
    /// Set once the pool ran dry with `close_on_exhaustion`.
    closed: bool,
}

/// A proxy checked out for one attempt.
///
/// While a lease is alive, a refresh that drops the proxy from the list only
/// retires it; the record is evicted when the last lease goes away.
pub struct ProxyLease {
    record: ProxyRecord,
    state: Weak<Mutex<PoolState>>,
}

impl ProxyLease {
    pub fn record(&self) -> &ProxyRecord {
        &self.record
    }

    pub fn address(&self) -> &str {
        self.record.address()
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().pool.release(self.record.address());
        }
    }
}

impl fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyLease").field(&self.record.address()).finish()
    }
}

/// Owns the proxy pool and serializes every mutation of it.
pub struct ProxyPoolManager {
    state: Arc<Mutex<PoolState>>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    refresh_requested: Notify,
    ban_stats: BanStats,
    slots: SlotLimiter,
}

impl ProxyPoolManager {
    /// Create a manager with an empty pool.
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self::with_entries(config, Vec::new())
    }

    /// Create a manager whose pool starts with `entries`, all UNCHECKED.
    pub fn with_entries(config: ProxyPoolConfig, entries: Vec<ProxyEntry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                pool: ProxyPool::from_entries(entries),
                closed: false,
            })),
            slots: SlotLimiter::new(config.max_requests_per_second),
            config,
            refresh_requested: Notify::new(),
            ban_stats: BanStats::new(),
        }
    }

    /// Check out the least recently used eligible proxy matching `filter`.
    ///
    /// When nothing matches, the exhaustion policy runs under the same lock:
    /// close the pool, or request a refresh, reanimate DEAD proxies and try
    /// once more. A pool that still has eligible proxies outside `exclude` is
    /// not exhausted; that case returns [`ExhaustedError::NoMatch`] untouched.
    pub fn select(
        &self,
        filter: &ProxyFilter,
        exclude: &HashSet<String>,
    ) -> Result<ProxyLease, ExhaustedError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ExhaustedError::Closed);
        }

        if let Some(record) = state.pool.pick(filter, exclude, Instant::now()) {
            return Ok(self.lease(record));
        }

        // Only this request's tried proxies stand in the way; the pool itself
        // is not exhausted.
        if !exclude.is_empty() && state.pool.has_eligible(filter) {
            debug!("Every eligible proxy was already tried by this request");
            return Err(ExhaustedError::NoMatch);
        }

        let stats = state.pool.stats();
        if self.config.close_on_exhaustion {
            state.closed = true;
            warn!(
                "No alive proxies left ({} total, {} dead), closing the pool",
                stats.total, stats.dead
            );
            return Err(ExhaustedError::Closed);
        }

        warn!("No proxies available. Total: {}, Dead: {}", stats.total, stats.dead);
        if self.config.force_refresh_on_exhaustion {
            info!("Requesting immediate proxy refresh");
            self.refresh_requested.notify_one();
        }

        let reanimated = state.pool.reanimate_all();
        if reanimated > 0 {
            info!("Reanimated {} dead proxies", reanimated);
        }

        match state.pool.pick(filter, exclude, Instant::now()) {
            Some(record) => Ok(self.lease(record)),
            None => Err(ExhaustedError::NoMatch),
        }
    }

    fn lease(&self, record: ProxyRecord) -> ProxyLease {
        ProxyLease {
            record,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Mark a proxy as banned. Idempotent for an already DEAD proxy.
    pub fn mark_dead(&self, address: &str, reason: &str) {
        let previous = self.state.lock().pool.mark_dead(address);
        match previous {
            Some(ProxyStatus::Dead) => {}
            Some(old) => warn!("Proxy {} marked dead ({}): {:?} -> Dead", address, reason, old),
            None => debug!("Ignoring dead mark for unknown proxy {}", address),
        }
    }

    /// Mark a proxy as working, clearing its failure count.
    pub fn mark_alive(&self, address: &str) {
        let previous = self.state.lock().pool.mark_alive(address);
        match previous {
            Some(ProxyStatus::Alive) => {}
            Some(old) => debug!("Proxy {} status changed: {:?} -> Alive", address, old),
            None => debug!("Ignoring alive mark for unknown proxy {}", address),
        }
    }

    /// Make every DEAD proxy eligible again. Returns how many were revived.
    pub fn reanimate_all(&self) -> usize {
        let count = self.state.lock().pool.reanimate_all();
        if count > 0 {
            info!("Reanimated {} dead proxies", count);
        }
        count
    }

    /// Merge a freshly fetched list into the pool.
    pub fn refresh(&self, entries: Vec<ProxyEntry>) -> MergeSummary {
        let summary = self.state.lock().pool.merge(entries);
        self.slots.prune();
        info!(
            "Proxy list refreshed: {} added, {} kept, {} removed, {} pending removal",
            summary.added, summary.kept, summary.removed, summary.deferred
        );
        summary
    }

    /// Fetch from `source` and merge. On error the pool is left untouched.
    pub async fn refresh_from(&self, source: &dyn ProxySource) -> Result<MergeSummary, SourceError> {
        let entries = source.fetch().await?;
        if entries.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(self.refresh(entries))
    }

    /// Lift a closed pool back into service.
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        if state.closed {
            state.closed = false;
            info!("Proxy pool reopened");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    pub fn record(&self, address: &str) -> Option<ProxyRecord> {
        self.state.lock().pool.get(address).cloned()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<ProxyRecord> {
        self.state.lock().pool.records().cloned().collect()
    }

    pub fn ban_stats(&self) -> &BanStats {
        &self.ban_stats
    }

    /// Per proxy host request throttle.
    pub(crate) fn slots(&self) -> &SlotLimiter {
        &self.slots
    }

    /// Resolves when an exhausted `select` asked for an out-of-band refresh.
    pub async fn refresh_requested(&self) {
        self.refresh_requested.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: ProxyPoolConfig, addresses: &[&str]) -> ProxyPoolManager {
        let entries = addresses
            .iter()
            .map(|a| ProxyEntry::new(*a).country("us"))
            .collect();
        ProxyPoolManager::with_entries(config, entries)
    }

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_select_never_returns_dead() {
        let manager = manager(ProxyPoolConfig::default(), &["a:1", "b:1"]);
        manager.mark_dead("a:1", "test");
        for _ in 0..10 {
            let lease = manager.select(&ProxyFilter::any(), &none()).unwrap();
            assert_eq!(lease.address(), "b:1");
        }
    }

    #[test]
    fn test_dead_then_alive_round_trip() {
        let manager = manager(ProxyPoolConfig::default(), &["a:1"]);
        manager.mark_dead("a:1", "403");
        manager.mark_dead("a:1", "403");
        let record = manager.record("a:1").unwrap();
        assert_eq!(record.status, ProxyStatus::Dead);
        assert_eq!(record.failed_attempts, 1);

        manager.mark_alive("a:1");
        let record = manager.record("a:1").unwrap();
        assert_eq!(record.status, ProxyStatus::Alive);
        assert_eq!(record.failed_attempts, 0);
    }

    #[test]
    fn test_exhaustion_reanimates_and_retries_once() {
        let manager = manager(ProxyPoolConfig::default(), &["a:1", "b:1"]);
        manager.mark_dead("a:1", "test");
        manager.mark_dead("b:1", "test");

        let lease = manager.select(&ProxyFilter::any(), &none()).unwrap();
        assert!(["a:1", "b:1"].contains(&lease.address()));
        let stats = manager.stats();
        assert_eq!(stats.dead, 0);
        assert_eq!(stats.unchecked, 2);
    }

    #[test]
    fn test_exhaustion_fails_when_reanimation_does_not_help() {
        let manager = manager(ProxyPoolConfig::default(), &["a:1"]);
        let exclude: HashSet<String> = ["a:1".to_string()].into_iter().collect();
        assert_eq!(
            manager.select(&ProxyFilter::any(), &exclude).err(),
            Some(ExhaustedError::NoMatch)
        );
        assert!(!manager.is_closed());
    }

    #[test]
    fn test_close_on_exhaustion_is_permanent() {
        let config = ProxyPoolConfig::builder().close_on_exhaustion(true).build();
        let manager = manager(config, &["a:1"]);
        manager.mark_dead("a:1", "test");

        assert_eq!(
            manager.select(&ProxyFilter::any(), &none()).err(),
            Some(ExhaustedError::Closed)
        );
        assert!(manager.is_closed());
        assert_eq!(manager.stats().dead, 1);

        manager.mark_alive("a:1");
        assert_eq!(
            manager.select(&ProxyFilter::any(), &none()).err(),
            Some(ExhaustedError::Closed)
        );

        manager.reopen();
        assert!(manager.select(&ProxyFilter::any(), &none()).is_ok());
    }

    #[test]
    fn test_exclusions_alone_do_not_exhaust_the_pool() {
        let tried: HashSet<String> = ["a:1".to_string()].into_iter().collect();

        // a:1 was banned and reanimated, b:1 is dead: a:1 is still eligible.
        let config = ProxyPoolConfig::builder().close_on_exhaustion(true).build();
        let closing = manager(config, &["a:1", "b:1"]);
        closing.mark_dead("b:1", "test");
        assert_eq!(
            closing.select(&ProxyFilter::any(), &tried).err(),
            Some(ExhaustedError::NoMatch)
        );
        assert!(!closing.is_closed());
        assert_eq!(closing.select(&ProxyFilter::any(), &none()).unwrap().address(), "a:1");

        // With default flags the request's own ban stays in place.
        let reviving = manager(ProxyPoolConfig::default(), &["a:1", "b:1"]);
        reviving.mark_dead("a:1", "test");
        reviving.mark_dead("b:1", "test");
        reviving.mark_alive("b:1");
        let tried: HashSet<String> = ["b:1".to_string()].into_iter().collect();
        assert_eq!(
            reviving.select(&ProxyFilter::any(), &tried).err(),
            Some(ExhaustedError::NoMatch)
        );
        assert_eq!(reviving.record("a:1").unwrap().status, ProxyStatus::Dead);
        assert_eq!(reviving.stats().dead, 1);
    }

    #[tokio::test]
    async fn test_force_refresh_signals_scheduler() {
        let config = ProxyPoolConfig::builder()
            .force_refresh_on_exhaustion(true)
            .build();
        let manager = manager(config, &["a:1"]);
        manager.mark_dead("a:1", "test");

        assert!(manager.select(&ProxyFilter::any(), &none()).is_ok());
        tokio::time::timeout(std::time::Duration::from_secs(1), manager.refresh_requested())
            .await
            .expect("refresh was not requested");
    }

    #[test]
    fn test_lease_drop_completes_deferred_eviction() {
        let manager = manager(ProxyPoolConfig::default(), &["a:1"]);
        let lease = manager.select(&ProxyFilter::any(), &none()).unwrap();

        let summary = manager.refresh(vec![ProxyEntry::new("b:1").country("us")]);
        assert_eq!(summary.deferred, 1);
        assert!(manager.record("a:1").is_some());

        drop(lease);
        assert!(manager.record("a:1").is_none());
        assert_eq!(manager.stats().total, 1);
    }
}
