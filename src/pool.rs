//! In-memory proxy pool: records keyed by address, selection-time filters and
//! least-recently-used picking.

use crate::proxy::{ProxyEntry, ProxyRecord, ProxyStatus, Scheme};

use rand::seq::IndexedRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

/// Selection-time view over the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFilter {
    /// Only hand out anonymous proxies.
    pub anonymous_only: bool,
    /// Proxy must support at least one of these schemes.
    pub schemes: BTreeSet<Scheme>,
    /// Required country code, `None` for any.
    pub country: Option<String>,
}

impl ProxyFilter {
    /// A filter that matches every record.
    pub fn any() -> Self {
        Self {
            anonymous_only: false,
            schemes: [Scheme::Http, Scheme::Https].into_iter().collect(),
            country: None,
        }
    }

    pub fn matches(&self, record: &ProxyRecord) -> bool {
        if self.anonymous_only && !record.anonymous {
            return false;
        }
        if !record.schemes.iter().any(|s| self.schemes.contains(s)) {
            return false;
        }
        match &self.country {
            Some(code) => record.country_code.eq_ignore_ascii_case(code),
            None => true,
        }
    }

    /// Restrict the filter to `scheme` when it is already allowed.
    pub fn narrowed_to(&self, scheme: Option<Scheme>) -> Self {
        let mut narrowed = self.clone();
        if let Some(scheme) = scheme {
            if self.schemes.contains(&scheme) {
                narrowed.schemes = [scheme].into_iter().collect();
            }
        }
        narrowed
    }
}

impl Default for ProxyFilter {
    fn default() -> Self {
        Self::any()
    }
}

/// Counts per status, as logged by the periodic health summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub alive: usize,
    pub unchecked: usize,
    pub dead: usize,
    /// Dropped by a refresh but still referenced by in-flight attempts.
    pub retired: usize,
}

/// Outcome of merging a fetched list into the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub kept: usize,
    pub removed: usize,
    /// Missing from the list but still in use; evicted on release.
    pub deferred: usize,
}

/// The full collection of proxy records.
#[derive(Debug, Default)]
pub struct ProxyPool {
    records: HashMap<String, ProxyRecord>,
    picks: u64,
    in_flight: HashMap<String, usize>,
    retired: HashSet<String>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from entries; duplicate addresses collapse to the first one.
    pub fn from_entries(entries: impl IntoIterator<Item = ProxyEntry>) -> Self {
        let mut pool = Self::new();
        for entry in entries {
            pool.records
                .entry(entry.address.clone())
                .or_insert_with(|| ProxyRecord::from_entry(entry));
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&ProxyRecord> {
        self.records.get(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &ProxyRecord> {
        self.records.values()
    }

    pub fn is_retired(&self, address: &str) -> bool {
        self.retired.contains(address)
    }

    pub fn in_flight(&self, address: &str) -> usize {
        self.in_flight.get(address).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.records.len(),
            retired: self.retired.len(),
            ..PoolStats::default()
        };
        for record in self.records.values() {
            match record.status {
                ProxyStatus::Alive => stats.alive += 1,
                ProxyStatus::Unchecked => stats.unchecked += 1,
                ProxyStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }

    fn candidates<'a>(
        &'a self,
        filter: &'a ProxyFilter,
        exclude: &'a HashSet<String>,
    ) -> impl Iterator<Item = &'a ProxyRecord> + 'a {
        self.records
            .values()
            .filter(|r| r.is_eligible())
            .filter(move |r| !self.retired.contains(r.address()))
            .filter(move |r| !exclude.contains(r.address()))
            .filter(move |r| filter.matches(r))
    }

    /// Whether any record matching `filter` could be picked, ignoring exclusions.
    pub fn has_eligible(&self, filter: &ProxyFilter) -> bool {
        self.candidates(filter, &HashSet::new()).next().is_some()
    }

    /// Pick the least recently used eligible record, stamp it and count it in flight.
    ///
    /// Ties (typically never-used records) are broken at random.
    pub(crate) fn pick(
        &mut self,
        filter: &ProxyFilter,
        exclude: &HashSet<String>,
        now: Instant,
    ) -> Option<ProxyRecord> {
        let candidates: Vec<&ProxyRecord> = self.candidates(filter, exclude).collect();

        let oldest = candidates.iter().map(|r| r.last_pick).min()?;
        let tied: Vec<&ProxyRecord> = candidates
            .into_iter()
            .filter(|r| r.last_pick == oldest)
            .collect();
        let address = tied.choose(&mut rand::rng())?.address().to_string();

        self.picks += 1;
        *self.in_flight.entry(address.clone()).or_insert(0) += 1;
        let record = self.records.get_mut(&address)?;
        record.last_used = Some(now);
        record.last_pick = self.picks;
        Some(record.clone())
    }

    /// Returns the previous status, `None` for an unknown address.
    pub(crate) fn mark_dead(&mut self, address: &str) -> Option<ProxyStatus> {
        let record = self.records.get_mut(address)?;
        let previous = record.status;
        if previous != ProxyStatus::Dead {
            record.status = ProxyStatus::Dead;
            record.failed_attempts += 1;
        }
        Some(previous)
    }

    pub(crate) fn mark_alive(&mut self, address: &str) -> Option<ProxyStatus> {
        let record = self.records.get_mut(address)?;
        let previous = record.status;
        record.status = ProxyStatus::Alive;
        record.failed_attempts = 0;
        Some(previous)
    }

    /// Move every DEAD record back to UNCHECKED. Returns how many moved.
    pub(crate) fn reanimate_all(&mut self) -> usize {
        let mut count = 0;
        for record in self.records.values_mut() {
            if record.status == ProxyStatus::Dead {
                record.status = ProxyStatus::Unchecked;
                count += 1;
            }
        }
        count
    }

    /// Merge a fetched list: new addresses join as UNCHECKED, known ones keep
    /// their health, missing ones are evicted or retired while in flight.
    pub(crate) fn merge(&mut self, entries: Vec<ProxyEntry>) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut fresh = HashSet::with_capacity(entries.len());

        for entry in entries {
            if !fresh.insert(entry.address.clone()) {
                continue;
            }
            self.retired.remove(&entry.address);
            match self.records.get_mut(&entry.address) {
                Some(record) => {
                    record.update_metadata(&entry);
                    summary.kept += 1;
                }
                None => {
                    self.records
                        .insert(entry.address.clone(), ProxyRecord::from_entry(entry));
                    summary.added += 1;
                }
            }
        }

        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|address| !fresh.contains(*address))
            .cloned()
            .collect();
        for address in stale {
            if self.in_flight(&address) > 0 {
                if self.retired.insert(address) {
                    summary.deferred += 1;
                }
            } else {
                self.records.remove(&address);
                summary.removed += 1;
            }
        }

        summary
    }

    /// Drop one in-flight reference; evicts a retired record once unused.
    pub(crate) fn release(&mut self, address: &str) {
        if let Some(count) = self.in_flight.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(address);
                if self.retired.remove(address) {
                    self.records.remove(address);
                }
            }
        }
    }
}
