//! Read-through caches for the evaluation hot path.
//!
//! Both caches are read-mostly, TTL-bounded, LRU-capped and never
//! authoritative: a miss falls through to the store, and a hit still gets
//! its validity window and revocation state re-checked by the engine.
//! Explicit invalidation on revoke and policy-change events keeps the TTL
//! an upper bound, not the consistency mechanism.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mandate::{Mandate, RevocationListener};
use crate::policy::AuthorityPolicy;

/// Cache bounds and TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    /// Entry TTL; never configure above 60 s, revocation latency rides
    /// on it when explicit invalidation misses.
    pub ttl_ms: i64,

    /// Maximum cached mandate chains.
    pub max_chains: usize,

    /// Maximum cached policies.
    pub max_policies: usize,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_chains: 10_000,
            max_policies: 10_000,
        }
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCacheStats {
    /// Lookups answered from memory.
    pub hit_count: u64,
    /// Lookups that fell through.
    pub miss_count: u64,
    /// Entries dropped by the size bound.
    pub eviction_count: u64,
    /// Entries dropped by explicit invalidation.
    pub invalidation_count: u64,
}

struct TtlEntry<T> {
    value: T,
    expires_at_ms: i64,
    last_touched_ms: i64,
}

struct TtlMap<K, V> {
    entries: HashMap<K, TtlEntry<V>>,
    max_entries: usize,
}

impl<K: std::hash::Hash + Eq + Copy, V: Clone> TtlMap<K, V> {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    fn get(&mut self, key: &K, now_ms: i64) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.expires_at_ms > now_ms => {
                entry.last_touched_ms = now_ms;
                Some(entry.value.clone())
            },
            Some(_) => {
                self.entries.remove(key);
                None
            },
            None => None,
        }
    }

    /// Returns true if the insert evicted another entry.
    fn put(&mut self, key: K, value: V, now_ms: i64, ttl_ms: i64) -> bool {
        let mut evicted = false;
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_touched_ms)
                .map(|(k, _)| *k)
            {
                self.entries.remove(&victim);
                evicted = true;
            }
        }
        self.entries.insert(
            key,
            TtlEntry {
                value,
                expires_at_ms: now_ms + ttl_ms,
                last_touched_ms: now_ms,
            },
        );
        evicted
    }
}

/// Shared caches for resolved mandate chains and active policies.
pub struct EvaluatorCaches {
    config: AuthCacheConfig,
    chains: RwLock<TtlMap<Uuid, Vec<Mandate>>>,
    policies: RwLock<TtlMap<Uuid, AuthorityPolicy>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl EvaluatorCaches {
    /// Creates caches with the given bounds.
    #[must_use]
    pub fn new(config: AuthCacheConfig) -> Self {
        let chains = TtlMap::new(config.max_chains);
        let policies = TtlMap::new(config.max_policies);
        Self {
            config,
            chains: RwLock::new(chains),
            policies: RwLock::new(policies),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cached chain for a mandate (leaf first), if live.
    #[must_use]
    pub fn get_chain(&self, mandate_id: Uuid, now_ms: i64) -> Option<Vec<Mandate>> {
        let result = self.chains.write().unwrap().get(&mandate_id, now_ms);
        self.count(result.is_some());
        result
    }

    /// Caches a resolved chain under the leaf mandate id.
    pub fn put_chain(&self, mandate_id: Uuid, chain: Vec<Mandate>, now_ms: i64) {
        let evicted =
            self.chains
                .write()
                .unwrap()
                .put(mandate_id, chain, now_ms, self.config.ttl_ms);
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cached active policy for a principal, if live.
    #[must_use]
    pub fn get_policy(&self, principal_id: Uuid, now_ms: i64) -> Option<AuthorityPolicy> {
        let result = self.policies.write().unwrap().get(&principal_id, now_ms);
        self.count(result.is_some());
        result
    }

    /// Caches a principal's active policy.
    pub fn put_policy(&self, policy: AuthorityPolicy, now_ms: i64) {
        let evicted = self.policies.write().unwrap().put(
            policy.principal_id,
            policy,
            now_ms,
            self.config.ttl_ms,
        );
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops every cached chain that contains `mandate_id` anywhere in it
    /// (a revoked ancestor poisons all descendant chains).
    pub fn invalidate_mandate(&self, mandate_id: Uuid) {
        let mut chains = self.chains.write().unwrap();
        let doomed: Vec<Uuid> = chains
            .entries
            .iter()
            .filter(|(_, entry)| entry.value.iter().any(|m| m.mandate_id == mandate_id))
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            chains.entries.remove(&key);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops a principal's cached policy.
    pub fn invalidate_policy(&self, principal_id: Uuid) {
        if self
            .policies
            .write()
            .unwrap()
            .entries
            .remove(&principal_id)
            .is_some()
        {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns monitoring counters.
    #[must_use]
    pub fn stats(&self) -> AuthCacheStats {
        AuthCacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
            invalidation_count: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for EvaluatorCaches {
    fn default() -> Self {
        Self::new(AuthCacheConfig::default())
    }
}

impl RevocationListener for EvaluatorCaches {
    fn mandate_revoked(&self, mandate_id: Uuid) {
        self.invalidate_mandate(mandate_id);
    }

    fn policy_changed(&self, principal_id: Uuid) {
        self.invalidate_policy(principal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::RevocationState;
    use crate::scope::ResourcePattern;

    fn mandate(id: Uuid, parent: Option<Uuid>) -> Mandate {
        Mandate {
            mandate_id: id,
            issuer_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            resources: vec![ResourcePattern::parse("a:b:c").unwrap()],
            actions: vec!["call".to_string()],
            not_before_ms: 0,
            not_after_ms: 1_000,
            parent_mandate_id: parent,
            depth: parent.map_or(0, |_| 1),
            intent_hash: None,
            signature: Vec::new(),
            created_ms: 0,
            revocation: RevocationState::Active,
        }
    }

    #[test]
    fn chain_hits_until_ttl() {
        let caches = EvaluatorCaches::new(AuthCacheConfig {
            ttl_ms: 100,
            ..AuthCacheConfig::default()
        });
        let leaf = Uuid::new_v4();
        caches.put_chain(leaf, vec![mandate(leaf, None)], 0);

        assert!(caches.get_chain(leaf, 50).is_some());
        assert!(caches.get_chain(leaf, 100).is_none());
        assert_eq!(caches.stats().hit_count, 1);
        assert_eq!(caches.stats().miss_count, 1);
    }

    #[test]
    fn revoking_ancestor_drops_descendant_chains() {
        let caches = EvaluatorCaches::default();
        let root_id = Uuid::new_v4();
        let leaf_id = Uuid::new_v4();
        let chain = vec![mandate(leaf_id, Some(root_id)), mandate(root_id, None)];
        caches.put_chain(leaf_id, chain, 0);

        caches.mandate_revoked(root_id);
        assert!(caches.get_chain(leaf_id, 1).is_none());
        assert_eq!(caches.stats().invalidation_count, 1);
    }

    #[test]
    fn policy_change_invalidates() {
        let caches = EvaluatorCaches::default();
        let principal_id = Uuid::new_v4();
        caches.put_policy(
            AuthorityPolicy {
                policy_id: Uuid::new_v4(),
                principal_id,
                resources: vec![ResourcePattern::parse("a:*:*").unwrap()],
                actions: vec!["call".to_string()],
                max_validity_ms: 1_000,
                max_delegation_depth: 1,
                allow_delegation: false,
                active: true,
                version: 1,
                created_ms: 0,
            },
            0,
        );
        assert!(caches.get_policy(principal_id, 1).is_some());
        caches.policy_changed(principal_id);
        assert!(caches.get_policy(principal_id, 2).is_none());
    }

    #[test]
    fn lru_bound_evicts_oldest() {
        let caches = EvaluatorCaches::new(AuthCacheConfig {
            ttl_ms: 10_000,
            max_chains: 2,
            max_policies: 2,
        });
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        caches.put_chain(a, vec![mandate(a, None)], 0);
        caches.put_chain(b, vec![mandate(b, None)], 1);
        caches.put_chain(c, vec![mandate(c, None)], 2);

        assert!(caches.get_chain(a, 3).is_none());
        assert!(caches.get_chain(c, 3).is_some());
        assert_eq!(caches.stats().eviction_count, 1);
    }
}
