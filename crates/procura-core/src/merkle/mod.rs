//! Merkle aggregation of ledger events into signed, tamper-evident batches.
//!
//! The aggregator batches contiguous ranges of ledger events, builds a
//! binary SHA-256 tree over their content hashes, and signs a binding of
//! the batch identity to the root. Inclusion proofs let an auditor verify
//! that a specific event is committed by a signed root without trusting
//! the store.

mod aggregator;
mod tree;

pub use aggregator::{AggregatorConfig, MerkleAggregator, MerkleAggregatorError};
pub use tree::{InclusionProof, MerkleTree};

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Hash};

/// A sealed, signed Merkle batch over a contiguous ledger-id range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBatch {
    /// Batch id, dense per partition starting at 1.
    pub batch_id: i64,

    /// Partition the batch covers.
    pub partition: i32,

    /// First ledger event id in the batch (inclusive).
    pub first_event_id: i64,

    /// Last ledger event id in the batch (inclusive).
    pub last_event_id: i64,

    /// Root of the Merkle tree over event content hashes.
    pub root_hash: Hash,

    /// Identifier of the signing key that sealed the batch.
    pub signing_key_id: String,

    /// ECDSA signature over [`signing_payload`].
    pub signature: Vec<u8>,

    /// Seal time, milliseconds since epoch.
    pub created_ms: i64,
}

impl SealedBatch {
    /// Verifies the seal signature under the given public key.
    #[must_use]
    pub fn verify_signature(&self, public_key: &[u8]) -> bool {
        let payload = signing_payload(
            self.batch_id,
            self.first_event_id,
            self.last_event_id,
            &self.root_hash,
        );
        crypto::verify_signature(public_key, &payload, &self.signature)
    }
}

/// Builds the bytes a batch seal signs:
/// `sha256(batch_id_be || first_id_be || last_id_be || root_hash)`.
///
/// Binding the id range into the signed payload stops a valid root from
/// being replayed against a different batch or range.
#[must_use]
pub fn signing_payload(batch_id: i64, first_event_id: i64, last_event_id: i64, root: &Hash) -> Hash {
    let mut buf = [0u8; 8 * 3 + 32];
    buf[..8].copy_from_slice(&batch_id.to_be_bytes());
    buf[8..16].copy_from_slice(&first_event_id.to_be_bytes());
    buf[16..24].copy_from_slice(&last_event_id.to_be_bytes());
    buf[24..].copy_from_slice(root);
    crypto::sha256(&buf)
}
