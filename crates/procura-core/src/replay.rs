//! Replay and recovery: rebuild derived state from the event log.
//!
//! Replay stops the consumers (the deployment drives them; they are
//! step-based workers, so "stopped" simply means not stepped), rebuilds
//! the spending cache by playing ledger events through the normal
//! recording path, and verifies every sealed Merkle batch over the
//! replayed range before consumers may resume. An integrity failure halts
//! the pipeline with a report naming the first bad batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::crypto::hashes_equal;
use crate::ledger::{EventKind, LedgerEvent};
use crate::merkle::MerkleTree;
use crate::spending::SpendingCache;
use crate::store::{Snapshot, SqliteStore, StoreError};

/// Where a replay starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStart {
    /// Replay every event with `event_id >= offset`.
    FromOffset(i64),

    /// Restore from the latest snapshot and replay the tail after it.
    FromLatestSnapshot,
}

/// Replay errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplayError {
    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `FromLatestSnapshot` requested but the partition has none.
    #[error("no snapshot exists for partition {partition}")]
    NoSnapshot {
        /// The partition without a snapshot.
        partition: i32,
    },

    /// Merkle verification failed over the reconstructed range. The
    /// pipeline must not resume.
    #[error(
        "integrity failure in partition {partition}, batch {batch_id} \
         (events {first_event_id}..={last_event_id}): {detail}"
    )]
    IntegrityFailure {
        /// Partition of the bad batch.
        partition: i32,
        /// The bad batch.
        batch_id: i64,
        /// First event covered.
        first_event_id: i64,
        /// Last event covered.
        last_event_id: i64,
        /// What failed.
        detail: String,
    },
}

/// Outcome of a completed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    /// Partition replayed.
    pub partition: i32,

    /// First event id replayed.
    pub start_event_id: i64,

    /// Last event id replayed (0 when the range was empty).
    pub end_event_id: i64,

    /// Number of events played through the handlers.
    pub events_replayed: u64,

    /// Snapshot the replay started from, if any.
    pub snapshot_id: Option<i64>,

    /// Sealed batches verified over the replayed range.
    pub batches_verified: u64,

    /// Derived metering totals per principal after the replay; two
    /// replays from the same offset must produce identical maps.
    pub derived_totals: BTreeMap<Uuid, i64>,
}

/// Rebuilds derived state from the ledger.
pub struct ReplayManager {
    store: Arc<SqliteStore>,
    cache: Arc<SpendingCache>,
}

impl ReplayManager {
    /// Creates a manager over the store and the derived-state cache.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, cache: Arc<SpendingCache>) -> Self {
        Self { store, cache }
    }

    /// Runs a replay. On success the consumers may resume; on
    /// `IntegrityFailure` they must stay stopped.
    ///
    /// # Errors
    ///
    /// Store failures, a missing snapshot, or an integrity failure.
    pub fn replay(
        &self,
        partition: i32,
        start: ReplayStart,
        now_ms: i64,
    ) -> Result<ReplayReport, ReplayError> {
        let (start_event_id, snapshot_id) = match start {
            ReplayStart::FromOffset(offset) => (offset.max(1), None),
            ReplayStart::FromLatestSnapshot => {
                let snapshot = self
                    .store
                    .latest_snapshot(partition)?
                    .ok_or(ReplayError::NoSnapshot { partition })?;
                (snapshot.as_of_event_id + 1, Some(snapshot.snapshot_id))
            },
        };

        info!(partition, start_event_id, ?snapshot_id, "replay starting");
        self.cache.clear();

        let mut derived_totals: BTreeMap<Uuid, i64> = BTreeMap::new();
        let mut events_replayed = 0u64;
        let mut end_event_id = 0i64;
        let mut cursor = start_event_id;
        loop {
            let page = self.store.read_events_from(partition, cursor, 1024)?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                self.apply(event, now_ms, &mut derived_totals);
                events_replayed += 1;
                end_event_id = event.event_id;
                cursor = event.event_id + 1;
            }
        }

        let batches_verified = self.verify_range(partition, start_event_id, end_event_id)?;

        let report = ReplayReport {
            partition,
            start_event_id,
            end_event_id,
            events_replayed,
            snapshot_id,
            batches_verified,
            derived_totals,
        };
        info!(
            partition,
            events = report.events_replayed,
            batches = report.batches_verified,
            "replay complete; consumers may resume"
        );
        Ok(report)
    }

    /// Materializes a snapshot of derived state (metering totals per
    /// principal over the whole partition) at the current ledger head.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn take_snapshot(&self, partition: i32, now_ms: i64) -> Result<Snapshot, ReplayError> {
        let head = self.store.max_event_id(partition)?;
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        let mut cursor = 1i64;
        loop {
            let page = self.store.read_events_from(partition, cursor, 1024)?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                if event.body.kind == EventKind::Metering {
                    if let Some(cost) = event.body.cost_minor_units {
                        *totals.entry(event.body.principal_id.to_string()).or_insert(0) += cost;
                    }
                }
                cursor = event.event_id + 1;
            }
        }

        let mut snapshot = Snapshot {
            snapshot_id: 0,
            partition,
            as_of_event_id: head,
            created_ms: now_ms,
            state: json!({ "metering_totals_minor": totals }),
        };
        snapshot.snapshot_id = self.store.insert_snapshot(&snapshot)?;
        info!(partition, as_of = head, "snapshot taken");
        Ok(snapshot)
    }

    fn apply(&self, event: &LedgerEvent, now_ms: i64, totals: &mut BTreeMap<Uuid, i64>) {
        if event.body.kind == EventKind::Metering {
            if let Some(cost) = event.body.cost_minor_units {
                *totals.entry(event.body.principal_id).or_insert(0) += cost;
            }
            self.cache.record_metering(event, now_ms);
        }
    }

    /// Verifies every sealed batch overlapping `[first, last]`: recomputes
    /// each event's content hash and the tree root against the stored
    /// root.
    fn verify_range(
        &self,
        partition: i32,
        first: i64,
        last: i64,
    ) -> Result<u64, ReplayError> {
        if last < first {
            return Ok(0);
        }
        let mut verified = 0u64;
        let mut cursor = first;
        while cursor <= last {
            let Some(batch) = self.store.batch_covering_event(partition, cursor)? else {
                // Unsealed tail (or gap before the first batch); nothing
                // to verify at this id.
                cursor += 1;
                continue;
            };

            let events =
                self.store
                    .events_in_range(partition, batch.first_event_id, batch.last_event_id)?;
            let mut leaves = Vec::with_capacity(events.len());
            for event in &events {
                let recomputed =
                    event
                        .compute_content_hash()
                        .map_err(|e| ReplayError::IntegrityFailure {
                            partition,
                            batch_id: batch.batch_id,
                            first_event_id: batch.first_event_id,
                            last_event_id: batch.last_event_id,
                            detail: format!("event {} uncanonicalizable: {e}", event.event_id),
                        })?;
                if !hashes_equal(&recomputed, &event.content_hash) {
                    error!(
                        partition,
                        batch_id = batch.batch_id,
                        event_id = event.event_id,
                        "ledger event content hash mismatch; halting pipeline"
                    );
                    return Err(ReplayError::IntegrityFailure {
                        partition,
                        batch_id: batch.batch_id,
                        first_event_id: batch.first_event_id,
                        last_event_id: batch.last_event_id,
                        detail: format!("event {} content hash mismatch", event.event_id),
                    });
                }
                leaves.push(recomputed);
            }

            let root = MerkleTree::build(&leaves).root();
            if !hashes_equal(&root, &batch.root_hash) {
                error!(
                    partition,
                    batch_id = batch.batch_id,
                    "merkle root mismatch; halting pipeline"
                );
                return Err(ReplayError::IntegrityFailure {
                    partition,
                    batch_id: batch.batch_id,
                    first_event_id: batch.first_event_id,
                    last_event_id: batch.last_event_id,
                    detail: "recomputed root does not match sealed root".to_string(),
                });
            }

            verified += 1;
            cursor = batch.last_event_id + 1;
        }
        Ok(verified)
    }
}
