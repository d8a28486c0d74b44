//! Spending totals: hot cache plus authoritative store fallback.
//!
//! The cache is authoritative only for the trailing 24 hours. Queries whose
//! window lies fully inside that horizon are served from memory; fully
//! outside goes to the store; a straddling window is split exactly at the
//! boundary (cache for `[boundary, t1)`, store for `[t0, boundary)`) and
//! summed — never overlapped.

mod cache;

pub use cache::{
    CacheStats, SpendingCache, SpendingCacheConfig, SpendingEntrySnapshot, TrendWindow,
};

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::DAY_MS;
use crate::store::{SqliteStore, StoreError};

/// Hybrid read path over the cache and the store.
pub struct SpendingTracker {
    cache: Arc<SpendingCache>,
    store: Arc<SqliteStore>,
}

impl SpendingTracker {
    /// Creates a tracker over the given cache and store.
    #[must_use]
    pub fn new(cache: Arc<SpendingCache>, store: Arc<SqliteStore>) -> Self {
        Self { cache, store }
    }

    /// Returns the cache handle.
    #[must_use]
    pub fn cache(&self) -> &Arc<SpendingCache> {
        &self.cache
    }

    /// Sums metering costs for `principal_id` over `[from_ms, to_ms)`,
    /// evaluated at `now_ms`.
    ///
    /// # Errors
    ///
    /// Propagates store errors; a cache miss is not an error, it falls
    /// through to the store.
    pub fn sum_spending(
        &self,
        principal_id: Uuid,
        from_ms: i64,
        to_ms: i64,
        now_ms: i64,
    ) -> Result<i64, StoreError> {
        if from_ms >= to_ms {
            return Ok(0);
        }
        let boundary = now_ms - DAY_MS;

        if from_ms >= boundary {
            // Fully inside the cache horizon.
            return match self.cache.sum_window(principal_id, from_ms, to_ms, now_ms) {
                Some(sum) => Ok(sum),
                None => self.store.sum_metering_costs(principal_id, from_ms, to_ms),
            };
        }
        if to_ms <= boundary {
            // Fully outside the cache horizon.
            return self.store.sum_metering_costs(principal_id, from_ms, to_ms);
        }

        // Straddling: split at the boundary, no overlap.
        let older = self
            .store
            .sum_metering_costs(principal_id, from_ms, boundary)?;
        let recent = match self.cache.sum_window(principal_id, boundary, to_ms, now_ms) {
            Some(sum) => sum,
            None => self.store.sum_metering_costs(principal_id, boundary, to_ms)?,
        };
        Ok(older + recent)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::Signer;
    use crate::ledger::{EventBody, EventKind};
    use crate::principal::Principal;

    fn tracker_with_events() -> (SpendingTracker, Uuid, i64) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cache = Arc::new(SpendingCache::new(SpendingCacheConfig::default()));
        let principal_id = Uuid::new_v4();
        store
            .insert_principal(
                &Principal::new(
                    principal_id,
                    Signer::generate().public_key_bytes(),
                    "agent",
                    "ops",
                    None,
                    0,
                )
                .unwrap(),
            )
            .unwrap();

        let now_ms = 10 * DAY_MS;
        // Two old events (only in the store) and two recent ones (store +
        // cache), exercising each side of the boundary.
        let costs = [
            (now_ms - 3 * DAY_MS, 100),
            (now_ms - 2 * DAY_MS, 200),
            (now_ms - DAY_MS / 2, 40),
            (now_ms - DAY_MS / 4, 60),
        ];
        for (ts, cost) in costs {
            let mut body = EventBody::new(principal_id, EventKind::Metering);
            body.cost_minor_units = Some(cost);
            body.currency = Some("USD".to_string());
            body.metadata = json!(null);
            let event = store.append_event(0, &body, ts).unwrap();
            if ts >= now_ms - DAY_MS {
                cache.record_metering(&event, now_ms);
            }
        }

        (SpendingTracker::new(cache, store), principal_id, now_ms)
    }

    #[test]
    fn fully_recent_window_served_by_cache() {
        let (tracker, principal_id, now_ms) = tracker_with_events();
        let sum = tracker
            .sum_spending(principal_id, now_ms - DAY_MS, now_ms, now_ms)
            .unwrap();
        assert_eq!(sum, 100);
        assert_eq!(tracker.cache().stats().hit_count, 1);
    }

    #[test]
    fn fully_old_window_served_by_store() {
        let (tracker, principal_id, now_ms) = tracker_with_events();
        let sum = tracker
            .sum_spending(principal_id, now_ms - 4 * DAY_MS, now_ms - DAY_MS, now_ms)
            .unwrap();
        assert_eq!(sum, 300);
        assert_eq!(tracker.cache().stats().hit_count, 0);
    }

    #[test]
    fn straddling_window_splits_at_boundary() {
        let (tracker, principal_id, now_ms) = tracker_with_events();
        let sum = tracker
            .sum_spending(principal_id, now_ms - 4 * DAY_MS, now_ms, now_ms)
            .unwrap();
        assert_eq!(sum, 400);
    }

    #[test]
    fn cache_miss_falls_through_to_store() {
        let (tracker, principal_id, now_ms) = tracker_with_events();
        tracker.cache().invalidate(principal_id);
        let sum = tracker
            .sum_spending(principal_id, now_ms - DAY_MS, now_ms, now_ms)
            .unwrap();
        assert_eq!(sum, 100);
        assert!(tracker.cache().stats().miss_count >= 1);
    }

    #[test]
    fn empty_window_is_zero() {
        let (tracker, principal_id, now_ms) = tracker_with_events();
        assert_eq!(
            tracker
                .sum_spending(principal_id, now_ms, now_ms, now_ms)
                .unwrap(),
            0
        );
    }
}
