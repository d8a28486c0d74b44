//! SHA-256 digests for event content and Merkle trees.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Size of a SHA-256 digest in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// Computes the SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Compares two digests in constant time.
///
/// Digest comparison on untrusted input (proof verification, dedupe) must
/// not leak a matching prefix through timing.
#[must_use]
pub fn hashes_equal(a: &Hash, b: &Hash) -> bool {
    a.ct_eq(b).into()
}

/// Renders a digest as lowercase hex for logs and error messages.
#[must_use]
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}
