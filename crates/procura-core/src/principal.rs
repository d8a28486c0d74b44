//! Principals: identities that issue and hold mandates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{self, PUBLIC_KEY_SIZE};

/// Maximum length of a display name.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 256;

/// Maximum length of an owner identifier.
pub const MAX_OWNER_LENGTH: usize = 256;

/// Validation errors for principal records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrincipalError {
    /// Display name empty or too long.
    #[error("display name must be 1..={MAX_DISPLAY_NAME_LENGTH} bytes, got {len}")]
    InvalidDisplayName {
        /// Actual length.
        len: usize,
    },

    /// Owner empty or too long.
    #[error("owner must be 1..={MAX_OWNER_LENGTH} bytes, got {len}")]
    InvalidOwner {
        /// Actual length.
        len: usize,
    },

    /// Public key bytes are not a valid P-256 point.
    #[error("public key is not a valid compressed P-256 point ({len} bytes)")]
    InvalidPublicKey {
        /// Length of the rejected key.
        len: usize,
    },

    /// A principal cannot be its own parent.
    #[error("principal {principal_id} cannot be its own parent")]
    SelfParent {
        /// The offending id.
        principal_id: Uuid,
    },
}

/// An identity with a P-256 signing keypair.
///
/// Principals form a forest through `parent_principal_id`. Records are
/// immutable once created except for soft deactivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier.
    pub principal_id: Uuid,

    /// Compressed SEC1 public key (33 bytes).
    #[serde(with = "serde_bytes_hex")]
    pub public_key: Vec<u8>,

    /// Human-readable name.
    pub display_name: String,

    /// Owning operator or tenant.
    pub owner: String,

    /// Parent principal for delegated children; `None` for roots.
    pub parent_principal_id: Option<Uuid>,

    /// Creation time, milliseconds since epoch.
    pub created_ms: i64,

    /// Soft-deactivation time; active while `None`.
    pub deactivated_ms: Option<i64>,
}

impl Principal {
    /// Creates a principal record, validating all bounds.
    ///
    /// # Errors
    ///
    /// Returns the first [`PrincipalError`] found (fail-closed).
    pub fn new(
        principal_id: Uuid,
        public_key: Vec<u8>,
        display_name: impl Into<String>,
        owner: impl Into<String>,
        parent_principal_id: Option<Uuid>,
        created_ms: i64,
    ) -> Result<Self, PrincipalError> {
        let principal = Self {
            principal_id,
            public_key,
            display_name: display_name.into(),
            owner: owner.into(),
            parent_principal_id,
            created_ms,
            deactivated_ms: None,
        };
        principal.validate()?;
        Ok(principal)
    }

    /// Validates field bounds and key encoding.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), PrincipalError> {
        if self.display_name.is_empty() || self.display_name.len() > MAX_DISPLAY_NAME_LENGTH {
            return Err(PrincipalError::InvalidDisplayName {
                len: self.display_name.len(),
            });
        }
        if self.owner.is_empty() || self.owner.len() > MAX_OWNER_LENGTH {
            return Err(PrincipalError::InvalidOwner {
                len: self.owner.len(),
            });
        }
        if self.public_key.len() != PUBLIC_KEY_SIZE
            || crypto::parse_public_key(&self.public_key).is_err()
        {
            return Err(PrincipalError::InvalidPublicKey {
                len: self.public_key.len(),
            });
        }
        if self.parent_principal_id == Some(self.principal_id) {
            return Err(PrincipalError::SelfParent {
                principal_id: self.principal_id,
            });
        }
        Ok(())
    }

    /// Returns true if the principal has not been deactivated.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.deactivated_ms.is_none()
    }
}

/// Hex (de)serialization for key bytes, keeping JSON forms readable.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    fn valid_principal() -> Principal {
        Principal::new(
            Uuid::new_v4(),
            Signer::generate().public_key_bytes(),
            "billing-agent",
            "ops@example.com",
            None,
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn valid_principal_roundtrips_json() {
        let principal = valid_principal();
        let json = serde_json::to_string(&principal).unwrap();
        let back: Principal = serde_json::from_str(&json).unwrap();
        assert_eq!(principal, back);
    }

    #[test]
    fn rejects_bad_public_key() {
        let mut principal = valid_principal();
        principal.public_key = vec![0u8; PUBLIC_KEY_SIZE];
        assert!(matches!(
            principal.validate(),
            Err(PrincipalError::InvalidPublicKey { .. })
        ));
    }

    #[test]
    fn rejects_empty_display_name() {
        let mut principal = valid_principal();
        principal.display_name = String::new();
        assert!(matches!(
            principal.validate(),
            Err(PrincipalError::InvalidDisplayName { .. })
        ));
    }

    #[test]
    fn rejects_self_parent() {
        let mut principal = valid_principal();
        principal.parent_principal_id = Some(principal.principal_id);
        assert!(matches!(
            principal.validate(),
            Err(PrincipalError::SelfParent { .. })
        ));
    }

    #[test]
    fn deactivation_flag() {
        let mut principal = valid_principal();
        assert!(principal.is_active());
        principal.deactivated_ms = Some(1_700_000_001_000);
        assert!(!principal.is_active());
    }
}
