//! Batching of ledger events into sealed Merkle batches.
//!
//! One aggregator runs per partition. The ledger writer feeds it event
//! hashes through [`MerkleAggregator::observe`]; a periodic driver calls
//! [`MerkleAggregator::tick`]. A batch seals when the size threshold fills
//! or the oldest pending event crosses the time threshold, whichever hits
//! first.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::tree::{InclusionProof, MerkleTree};
use super::{SealedBatch, signing_payload};
use crate::crypto::{Hash, Signer, hashes_equal};
use crate::ledger::LedgerEvent;
use crate::store::{SqliteStore, StoreError};

/// Aggregator thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Seal when this many events are pending.
    pub size_threshold: usize,

    /// Seal when the oldest pending event is older than this.
    pub time_threshold_ms: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            size_threshold: 1024,
            time_threshold_ms: 60_000,
        }
    }
}

/// Errors from aggregation and proof construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MerkleAggregatorError {
    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The event is not covered by any sealed batch yet.
    #[error("event {partition}/{event_id} is not sealed into a batch")]
    NotSealed {
        /// Partition of the event.
        partition: i32,
        /// Event id.
        event_id: i64,
    },

    /// Pending queue received an event out of order; the single-writer
    /// discipline was violated upstream.
    #[error("non-contiguous pending event: expected id {expected}, got {got}")]
    NonContiguous {
        /// Expected next event id.
        expected: i64,
        /// The id that arrived.
        got: i64,
    },

    /// A stored event's content hash does not match its recomputed hash.
    #[error("content hash mismatch for event {partition}/{event_id}")]
    ContentHashMismatch {
        /// Partition of the event.
        partition: i32,
        /// Event id.
        event_id: i64,
    },
}

#[derive(Debug, Default)]
struct Pending {
    /// (event_id, content_hash, ts_ms), contiguous and ascending.
    queue: Vec<(i64, Hash, i64)>,
}

/// Per-partition Merkle aggregator.
pub struct MerkleAggregator {
    store: Arc<SqliteStore>,
    partition: i32,
    signer: Signer,
    signing_key_id: String,
    config: AggregatorConfig,
    pending: Mutex<Pending>,
}

impl MerkleAggregator {
    /// Creates an aggregator and pulls any unsealed events from the store
    /// (the restart high-water-mark catch-up).
    ///
    /// # Errors
    ///
    /// Returns a store error if the catch-up scan fails.
    pub fn new(
        store: Arc<SqliteStore>,
        partition: i32,
        signer: Signer,
        signing_key_id: impl Into<String>,
        config: AggregatorConfig,
    ) -> Result<Self, MerkleAggregatorError> {
        let aggregator = Self {
            store,
            partition,
            signer,
            signing_key_id: signing_key_id.into(),
            config,
            pending: Mutex::new(Pending::default()),
        };
        aggregator.catch_up()?;
        Ok(aggregator)
    }

    /// Scans the store for events appended after the last sealed batch and
    /// queues them. Idempotent; also safe to call after a crash between
    /// append and notify.
    ///
    /// # Errors
    ///
    /// Returns a store error if the scan fails.
    pub fn catch_up(&self) -> Result<(), MerkleAggregatorError> {
        let high_water = self
            .store
            .latest_batch(self.partition)?
            .map_or(0, |batch| batch.last_event_id);
        let mut cursor = high_water + 1;
        let mut pending = self.pending.lock().unwrap();
        pending.queue.clear();
        loop {
            let page = self.store.read_events_from(self.partition, cursor, 1024)?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                pending
                    .queue
                    .push((event.event_id, event.content_hash, event.ts_ms));
                cursor = event.event_id + 1;
            }
        }
        if !pending.queue.is_empty() {
            debug!(
                partition = self.partition,
                pending = pending.queue.len(),
                "merkle aggregator caught up unsealed events"
            );
        }
        Ok(())
    }

    /// Queues a freshly appended event.
    ///
    /// # Errors
    ///
    /// `NonContiguous` if the event does not extend the pending range by
    /// exactly one id.
    pub fn observe(&self, event: &LedgerEvent) -> Result<(), MerkleAggregatorError> {
        let mut pending = self.pending.lock().unwrap();
        if let Some((last_id, _, _)) = pending.queue.last() {
            if event.event_id != last_id + 1 {
                return Err(MerkleAggregatorError::NonContiguous {
                    expected: last_id + 1,
                    got: event.event_id,
                });
            }
        }
        pending
            .queue
            .push((event.event_id, event.content_hash, event.ts_ms));
        Ok(())
    }

    /// Number of events waiting to be sealed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().queue.len()
    }

    /// Seals batches as thresholds allow. Returns the batches sealed in
    /// this call (usually zero or one; more after a long catch-up).
    ///
    /// Failure leaves the pending queue intact: events are already durable
    /// in the ledger, so the next tick retries the seal. Re-sealing an
    /// already-sealed range is a no-op in the store.
    ///
    /// # Errors
    ///
    /// Returns the first store error encountered.
    pub fn tick(&self, now_ms: i64) -> Result<Vec<SealedBatch>, MerkleAggregatorError> {
        let mut sealed = Vec::new();
        loop {
            // Decide under the lock, build and sign outside it.
            let take: Option<Vec<(i64, Hash, i64)>> = {
                let pending = self.pending.lock().unwrap();
                let len = pending.queue.len();
                if len == 0 {
                    None
                } else if len >= self.config.size_threshold {
                    Some(pending.queue[..self.config.size_threshold].to_vec())
                } else {
                    let oldest_ts = pending.queue[0].2;
                    if now_ms - oldest_ts >= self.config.time_threshold_ms {
                        Some(pending.queue.clone())
                    } else {
                        None
                    }
                }
            };
            let Some(chunk) = take else {
                break;
            };

            let batch = self.seal(&chunk, now_ms)?;
            debug!(
                partition = self.partition,
                batch_id = batch.batch_id,
                first = batch.first_event_id,
                last = batch.last_event_id,
                "sealed merkle batch"
            );

            let mut pending = self.pending.lock().unwrap();
            pending.queue.drain(..chunk.len());
            sealed.push(batch);
        }
        Ok(sealed)
    }

    fn seal(
        &self,
        chunk: &[(i64, Hash, i64)],
        now_ms: i64,
    ) -> Result<SealedBatch, MerkleAggregatorError> {
        let first_event_id = chunk[0].0;
        let last_event_id = chunk[chunk.len() - 1].0;
        let leaves: Vec<Hash> = chunk.iter().map(|(_, hash, _)| *hash).collect();
        let root = MerkleTree::build(&leaves).root();

        let batch_id = self
            .store
            .latest_batch(self.partition)?
            .map_or(1, |batch| batch.batch_id + 1);
        let payload = signing_payload(batch_id, first_event_id, last_event_id, &root);
        let batch = SealedBatch {
            batch_id,
            partition: self.partition,
            first_event_id,
            last_event_id,
            root_hash: root,
            signing_key_id: self.signing_key_id.clone(),
            signature: self.signer.sign(&payload),
            created_ms: now_ms,
        };

        if !self.store.insert_batch(&batch)? {
            warn!(
                partition = self.partition,
                batch_id, "batch was already sealed; treating as no-op"
            );
        }
        Ok(batch)
    }

    /// Builds the inclusion proof for a sealed event, returning the proof
    /// and the covering signed batch.
    ///
    /// # Errors
    ///
    /// `NotSealed` if no batch covers the event yet;
    /// `ContentHashMismatch` if a stored event fails its own hash, which
    /// means the ledger was tampered with.
    pub fn inclusion_proof(
        &self,
        event_id: i64,
    ) -> Result<(InclusionProof, SealedBatch), MerkleAggregatorError> {
        let batch = self
            .store
            .batch_covering_event(self.partition, event_id)?
            .ok_or(MerkleAggregatorError::NotSealed {
                partition: self.partition,
                event_id,
            })?;

        let events = self
            .store
            .events_in_range(self.partition, batch.first_event_id, batch.last_event_id)?;
        let leaves = verified_leaves(&events)?;
        let tree = MerkleTree::build(&leaves);

        let index = usize::try_from(event_id - batch.first_event_id).map_err(|_| {
            MerkleAggregatorError::NotSealed {
                partition: self.partition,
                event_id,
            }
        })?;
        let proof = tree
            .proof(index)
            .ok_or(MerkleAggregatorError::NotSealed {
                partition: self.partition,
                event_id,
            })?;
        Ok((proof, batch))
    }

    /// Verifies an entire sealed range: recomputes each event's content
    /// hash, rebuilds the tree, and checks the signed root.
    ///
    /// # Errors
    ///
    /// `ContentHashMismatch` on the first tampered event; `NotSealed` if
    /// the recomputed root does not match the stored signed root.
    pub fn verify_batch(&self, batch: &SealedBatch) -> Result<(), MerkleAggregatorError> {
        let events = self
            .store
            .events_in_range(self.partition, batch.first_event_id, batch.last_event_id)?;
        let leaves = verified_leaves(&events)?;
        let root = MerkleTree::build(&leaves).root();
        if !hashes_equal(&root, &batch.root_hash) {
            return Err(MerkleAggregatorError::ContentHashMismatch {
                partition: batch.partition,
                event_id: batch.first_event_id,
            });
        }
        Ok(())
    }
}

/// Recomputes and checks each event's content hash, returning the leaf
/// digests in ledger order.
fn verified_leaves(events: &[LedgerEvent]) -> Result<Vec<Hash>, MerkleAggregatorError> {
    let mut leaves = Vec::with_capacity(events.len());
    for event in events {
        let recomputed = event
            .compute_content_hash()
            .map_err(StoreError::Canonical)?;
        if !hashes_equal(&recomputed, &event.content_hash) {
            return Err(MerkleAggregatorError::ContentHashMismatch {
                partition: event.partition,
                event_id: event.event_id,
            });
        }
        leaves.push(recomputed);
    }
    Ok(leaves)
}
