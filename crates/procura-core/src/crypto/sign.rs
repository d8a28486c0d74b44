//! ECDSA P-256 signing and verification.
//!
//! Signatures use RFC 6979 deterministic nonces (the default for the `p256`
//! signer), so the same key and payload always produce the same 64-byte
//! signature. Public keys travel as 33-byte compressed SEC1 points.

use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Size of a serialized signature (fixed-width r || s).
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a compressed SEC1 public key.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of a raw P-256 secret scalar.
pub const SECRET_KEY_SIZE: usize = 32;

/// Errors from signature operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignerError {
    /// Public key bytes were not a valid SEC1 point.
    #[error("invalid public key encoding")]
    InvalidPublicKey,

    /// Signature bytes were not a valid fixed-width encoding.
    #[error("invalid signature encoding: expected {SIGNATURE_SIZE} bytes, got {len}")]
    InvalidSignature {
        /// Length of the rejected input.
        len: usize,
    },

    /// Secret key bytes were not a valid scalar.
    #[error("invalid secret key encoding")]
    InvalidSecretKey,
}

/// Wraps a signing key for deterministic ECDSA over canonical payloads.
#[derive(Clone)]
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Creates a signer from an existing key.
    #[must_use]
    pub const fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Generates a fresh P-256 keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Restores a signer from raw secret scalar bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSecretKey` if the bytes are not a valid scalar.
    pub fn from_secret_bytes(bytes: &[u8; SECRET_KEY_SIZE]) -> Result<Self, SignerError> {
        let signing_key =
            SigningKey::from_bytes(bytes.into()).map_err(|_| SignerError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    /// Returns the raw secret scalar bytes.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.signing_key.to_bytes().into()
    }

    /// Signs `message`, returning the fixed-width 64-byte signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }

    /// Returns the compressed SEC1 encoding of the public key.
    #[must_use]
    pub fn public_key_bytes(&self) -> Vec<u8> {
        encode_public_key(self.signing_key.verifying_key())
    }

    /// Returns the verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// Verifies a signature made by this signer's key.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_with_key(self.signing_key.verifying_key(), message, signature)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render secret material.
        f.debug_struct("Signer")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Encodes a verifying key as a compressed SEC1 point.
#[must_use]
pub fn encode_public_key(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(true).as_bytes().to_vec()
}

/// Parses a compressed (or uncompressed) SEC1 public key.
///
/// # Errors
///
/// Returns `InvalidPublicKey` if the bytes are not a valid curve point.
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey, SignerError> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|_| SignerError::InvalidPublicKey)
}

/// Parses a fixed-width 64-byte signature.
///
/// # Errors
///
/// Returns `InvalidSignature` if the bytes are malformed.
pub fn parse_signature(bytes: &[u8]) -> Result<Signature, SignerError> {
    Signature::from_slice(bytes).map_err(|_| SignerError::InvalidSignature { len: bytes.len() })
}

/// Verifies `signature` over `message` under a SEC1-encoded public key.
///
/// Malformed keys or signatures verify as `false`; verification never
/// errors on untrusted input.
#[must_use]
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = parse_public_key(public_key) else {
        return false;
    };
    verify_with_key(&key, message, signature)
}

fn verify_with_key(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = parse_signature(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let signature = signer.sign(b"canonical payload");
        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(signer.verify(b"canonical payload", &signature));
        assert!(!signer.verify(b"different payload", &signature));
    }

    #[test]
    fn signatures_are_deterministic() {
        // RFC 6979: same key + same payload => byte-identical signature.
        let signer = Signer::generate();
        let first = signer.sign(b"payload");
        let second = signer.sign(b"payload");
        assert_eq!(first, second);
    }

    #[test]
    fn verify_via_encoded_public_key() {
        let signer = Signer::generate();
        let public = signer.public_key_bytes();
        assert_eq!(public.len(), PUBLIC_KEY_SIZE);
        let signature = signer.sign(b"msg");
        assert!(verify_signature(&public, b"msg", &signature));
    }

    #[test]
    fn garbage_key_or_signature_verifies_false() {
        let signer = Signer::generate();
        let signature = signer.sign(b"msg");
        assert!(!verify_signature(b"not a key", b"msg", &signature));
        assert!(!verify_signature(
            &signer.public_key_bytes(),
            b"msg",
            b"short"
        ));
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let signer = Signer::generate();
        let restored = Signer::from_secret_bytes(&signer.secret_bytes()).unwrap();
        assert_eq!(signer.public_key_bytes(), restored.public_key_bytes());
        // Deterministic signing makes restored signatures identical too.
        assert_eq!(signer.sign(b"x"), restored.sign(b"x"));
    }
}
