//! In-memory spending cache with TTL, trends and stats.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{DAY_MS, HOUR_MS, WEEK_MS};
use crate::ledger::{EventKind, LedgerEvent};

/// Trend bucket granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendWindow {
    /// One-hour buckets, retained for 7 days.
    Hourly,
    /// One-day buckets, retained for 30 days.
    Daily,
    /// One-week buckets, retained for 52 weeks.
    Weekly,
}

impl TrendWindow {
    const fn bucket_ms(self) -> i64 {
        match self {
            Self::Hourly => HOUR_MS,
            Self::Daily => DAY_MS,
            Self::Weekly => WEEK_MS,
        }
    }

    const fn retention_ms(self) -> i64 {
        match self {
            Self::Hourly => 7 * DAY_MS,
            Self::Daily => 30 * DAY_MS,
            Self::Weekly => 52 * WEEK_MS,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpendingCacheConfig {
    /// Sliding TTL per entry; the window the cache is authoritative for.
    pub ttl_ms: i64,

    /// Maximum number of principal entries.
    pub max_entries: usize,
}

impl Default for SpendingCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DAY_MS,
            max_entries: 10_000,
        }
    }
}

/// Counters for monitoring, mirrored into logs by the metrics consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Window queries answered from memory.
    pub hit_count: u64,
    /// Window queries that fell through to the store.
    pub miss_count: u64,
    /// Entries evicted by the size bound.
    pub eviction_count: u64,
    /// Entries dropped by explicit invalidation.
    pub invalidation_count: u64,
}

/// Point-in-time view of one principal's cached spending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingEntrySnapshot {
    /// Running total since the entry was created, minor units.
    pub total_spent_minor: i64,

    /// Number of events inside the 24 h window.
    pub window_event_count: usize,

    /// Sum of costs inside the 24 h window, minor units.
    pub window_sum_minor: i64,
}

#[derive(Debug, Default)]
struct Entry {
    total_spent_minor: i64,
    /// (ts_ms, event_id) -> cost; time-ordered, pruned to the TTL window.
    events: BTreeMap<(i64, i64), i64>,
    trends: HashMap<TrendWindow, BTreeMap<i64, i64>>,
    /// Sliding expiry; refreshed on reads and writes.
    expires_at_ms: i64,
    last_touched_ms: i64,
}

impl Entry {
    fn prune(&mut self, now_ms: i64, ttl_ms: i64) {
        let horizon = now_ms - ttl_ms;
        self.events = self.events.split_off(&(horizon, i64::MIN));
        for window in [TrendWindow::Hourly, TrendWindow::Daily, TrendWindow::Weekly] {
            if let Some(buckets) = self.trends.get_mut(&window) {
                let keep_from = now_ms - window.retention_ms();
                *buckets = buckets.split_off(&keep_from);
            }
        }
    }
}

/// Fast running totals and sorted event streams per principal.
///
/// Writes from the ledger writer are best-effort; the cache never fails an
/// append. Reads outside the TTL window report a miss and the caller falls
/// through to the store.
pub struct SpendingCache {
    config: SpendingCacheConfig,
    entries: RwLock<HashMap<Uuid, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl SpendingCache {
    /// Creates a cache with the given configuration.
    #[must_use]
    pub fn new(config: SpendingCacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Records a metering event. Non-metering events and events without a
    /// cost are ignored.
    pub fn record_metering(&self, event: &LedgerEvent, now_ms: i64) {
        if event.body.kind != EventKind::Metering {
            return;
        }
        let Some(cost) = event.body.cost_minor_units else {
            return;
        };
        self.record_cost(event.body.principal_id, event.ts_ms, event.event_id, cost, now_ms);
    }

    /// Records a cost sample directly (used by the metrics consumer, which
    /// sees bus events before they have ledger ids; `seq` only needs to be
    /// unique within the principal's stream).
    pub fn record_cost(&self, principal_id: Uuid, ts_ms: i64, seq: i64, cost: i64, now_ms: i64) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.config.max_entries && !entries.contains_key(&principal_id) {
            self.evict_one(&mut entries);
        }
        let entry = entries.entry(principal_id).or_default();
        entry.total_spent_minor = entry.total_spent_minor.saturating_add(cost);
        entry.events.insert((ts_ms, seq), cost);
        for window in [TrendWindow::Hourly, TrendWindow::Daily, TrendWindow::Weekly] {
            let bucket = ts_ms - ts_ms.rem_euclid(window.bucket_ms());
            let buckets = entry.trends.entry(window).or_default();
            let slot = buckets.entry(bucket).or_insert(0);
            *slot = slot.saturating_add(cost);
        }
        entry.expires_at_ms = now_ms + self.config.ttl_ms;
        entry.last_touched_ms = now_ms;
        entry.prune(now_ms, self.config.ttl_ms);
    }

    /// Sums cached costs over `[from_ms, to_ms)` if the window lies inside
    /// the cache horizon and the entry is live; `None` otherwise (miss).
    #[must_use]
    pub fn sum_window(
        &self,
        principal_id: Uuid,
        from_ms: i64,
        to_ms: i64,
        now_ms: i64,
    ) -> Option<i64> {
        if from_ms < now_ms - self.config.ttl_ms {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&principal_id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.expires_at_ms <= now_ms {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let sum = entry
            .events
            .range((from_ms, i64::MIN)..(to_ms, i64::MIN))
            .map(|(_, cost)| cost)
            .sum();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(sum)
    }

    /// Returns the trend buckets for a principal, oldest first.
    #[must_use]
    pub fn trend(
        &self,
        principal_id: Uuid,
        window: TrendWindow,
    ) -> Vec<(i64, i64)> {
        let entries = self.entries.read().unwrap();
        entries
            .get(&principal_id)
            .and_then(|entry| entry.trends.get(&window))
            .map(|buckets| buckets.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    /// Average spend per hourly bucket over the trailing 7 days, excluding
    /// the bucket containing `now_ms`. Returns `None` when there is no
    /// history to average.
    #[must_use]
    pub fn hourly_average_7d(&self, principal_id: Uuid, now_ms: i64) -> Option<i64> {
        let current_bucket = now_ms - now_ms.rem_euclid(HOUR_MS);
        let entries = self.entries.read().unwrap();
        let buckets = entries.get(&principal_id)?.trends.get(&TrendWindow::Hourly)?;
        let history: Vec<i64> = buckets
            .range((current_bucket - 7 * DAY_MS)..current_bucket)
            .map(|(_, v)| *v)
            .collect();
        if history.is_empty() {
            return None;
        }
        Some(history.iter().sum::<i64>() / history.len() as i64)
    }

    /// Spend in the hourly bucket containing `now_ms`.
    #[must_use]
    pub fn current_hour_spend(&self, principal_id: Uuid, now_ms: i64) -> i64 {
        let bucket = now_ms - now_ms.rem_euclid(HOUR_MS);
        let entries = self.entries.read().unwrap();
        entries
            .get(&principal_id)
            .and_then(|entry| entry.trends.get(&TrendWindow::Hourly))
            .and_then(|buckets| buckets.get(&bucket))
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of a principal's cached state, if present and live.
    #[must_use]
    pub fn snapshot(&self, principal_id: Uuid, now_ms: i64) -> Option<SpendingEntrySnapshot> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&principal_id)?;
        if entry.expires_at_ms <= now_ms {
            return None;
        }
        Some(SpendingEntrySnapshot {
            total_spent_minor: entry.total_spent_minor,
            window_event_count: entry.events.len(),
            window_sum_minor: entry.events.values().sum(),
        })
    }

    /// Drops a principal's entry. Idempotent.
    pub fn invalidate(&self, principal_id: Uuid) {
        let mut entries = self.entries.write().unwrap();
        if entries.remove(&principal_id).is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Clears the whole cache.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap();
        let dropped = entries.len() as u64;
        entries.clear();
        self.invalidations.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Returns monitoring counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
            invalidation_count: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn evict_one(&self, entries: &mut HashMap<Uuid, Entry>) {
        // Oldest-touched entry goes first; expired entries sort oldest.
        if let Some(victim) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_touched_ms)
            .map(|(id, _)| *id)
        {
            entries.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
