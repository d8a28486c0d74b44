//! Cryptographic primitives for mandates and the audit ledger.
//!
//! - **SHA-256 hashing** for ledger event content and Merkle leaves
//! - **ECDSA P-256 signatures** (RFC 6979 deterministic nonces) for mandates
//!   and Merkle roots
//! - **Key management** with in-memory and permission-checked file storage
//!
//! Signing the same canonical payload twice produces byte-identical
//! signatures, which downstream dedupe and the exact-equality tests rely on.
//! The `p256` signer derives its nonce per RFC 6979, so determinism holds by
//! construction.

mod hash;
mod keys;
mod sign;

pub use hash::{HASH_SIZE, Hash, hash_hex, hashes_equal, sha256};
pub use keys::{KeyManager, KeyManagerError, StoredKeypair};
pub use sign::{
    PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE, Signer, SignerError, encode_public_key,
    parse_public_key, parse_signature, verify_signature,
};
