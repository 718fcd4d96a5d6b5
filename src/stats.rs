//! Ban counters, keyed the way they show up in the periodic summary.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Thread-safe counters for observed bans.
#[derive(Debug, Default)]
pub struct BanStats {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl BanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: impl Into<String>) {
        *self.counters.lock().entry(key.into()).or_insert(0) += 1;
    }

    pub fn record_status(&self, status: u16) {
        self.inc(format!("bans/status/{}", status));
    }

    pub fn record_empty(&self) {
        self.inc("bans/empty");
    }

    pub fn record_error(&self, kind: &str) {
        self.inc(format!("bans/error/{}", kind));
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with("bans/status/") || key.starts_with("bans/error/"))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}
