//! Binary SHA-256 Merkle tree over ledger event hashes.

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, hashes_equal, sha256};

/// Combines two child digests into their parent digest.
#[must_use]
fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// A binary Merkle tree built level by level from leaf digests.
///
/// Odd-node rule: when a level has an odd number of nodes, the **last node
/// is duplicated** to pair it. This applies at every level, not just the
/// leaves, and it is the interop-sensitive choice: a verifier that pads to
/// a power of two instead will compute different roots for non-power-of-two
/// batch sizes.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] is the leaf level; the last level holds the single root.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds a tree from leaf digests.
    ///
    /// An empty leaf set produces a tree whose root is the zero digest;
    /// batch sealing never does this (batches contain at least one event).
    #[must_use]
    pub fn build(leaves: &[Hash]) -> Self {
        if leaves.is_empty() {
            return Self {
                levels: vec![vec![[0u8; 32]]],
            };
        }

        let mut levels = vec![leaves.to_vec()];
        while levels
            .last()
            .is_some_and(|level| level.len() > 1)
        {
            let current = match levels.last() {
                Some(level) => level,
                None => break,
            };
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd node: duplicate the last node to pair it.
                let right = pair.get(1).unwrap_or(left);
                next.push(combine(left, right));
            }
            levels.push(next);
        }

        Self { levels }
    }

    /// Returns the root digest.
    #[must_use]
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    /// Returns the number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Builds the inclusion proof for the leaf at `index`.
    ///
    /// Returns `None` for an out-of-range index or an empty tree.
    #[must_use]
    pub fn proof(&self, index: usize) -> Option<InclusionProof> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count || leaf_count == 0 {
            return None;
        }

        let leaf_hash = self.levels[0][index];
        let mut siblings = Vec::new();
        let mut sibling_on_right = Vec::new();

        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // The duplicated last node is its own sibling.
            let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
            siblings.push(sibling);
            sibling_on_right.push(idx % 2 == 0);
            idx /= 2;
        }

        Some(InclusionProof {
            leaf_index: index as u64,
            leaf_hash,
            siblings,
            sibling_on_right,
        })
    }
}

/// An inclusion proof: sibling digests from leaf to root plus the
/// left/right position of each sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// Index of the proven leaf.
    pub leaf_index: u64,

    /// Digest of the proven leaf.
    pub leaf_hash: Hash,

    /// Sibling digests, leaf level first.
    pub siblings: Vec<Hash>,

    /// `true` when the sibling at that level sits to the right.
    pub sibling_on_right: Vec<bool>,
}

impl InclusionProof {
    /// Recomputes the root this proof commits to.
    #[must_use]
    pub fn compute_root(&self) -> Hash {
        let mut current = self.leaf_hash;
        for (sibling, on_right) in self.siblings.iter().zip(&self.sibling_on_right) {
            current = if *on_right {
                combine(&current, sibling)
            } else {
                combine(sibling, &current)
            };
        }
        current
    }

    /// Verifies the proof against an expected root.
    ///
    /// Comparison is constant time; a malformed proof (mismatched vector
    /// lengths) verifies as `false`.
    #[must_use]
    pub fn verify(&self, expected_root: &Hash) -> bool {
        if self.siblings.len() != self.sibling_on_right.len() {
            return false;
        }
        hashes_equal(&self.compute_root(), expected_root)
    }
}
