//! Execution mandates: signed, time-bounded grants of authority.
//!
//! A mandate authorizes a subject principal to perform actions within a
//! resource scope for a bounded window. Mandates form delegation chains
//! through `parent_mandate_id`; every link must be a strict narrowing
//! (scope subset, validity subset, depth + 1).
//!
//! The issuer signature covers the canonical JSON form of the fields listed
//! in [`Mandate::signing_value`]; canonicalization makes the signed bytes
//! independent of field order and whitespace in any wire representation.

mod manager;

pub use manager::{
    IssueRequest, MandateManager, MandateOpError, RevocationListener, RevocationOutcome,
    RevokeRequest,
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{self, CanonicalJsonError};
use crate::crypto::{self, Hash};
use crate::policy::{MAX_POLICY_ACTIONS, MAX_POLICY_RESOURCES, validate_action_name};
use crate::scope::{ResourcePattern, scope_is_subset};

/// Maximum length of a revocation reason.
pub const MAX_REVOCATION_REASON_LENGTH: usize = 512;

/// Validation errors for mandate records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MandateError {
    /// Resource scope empty or too large.
    #[error("mandate must carry 1..={MAX_POLICY_RESOURCES} resource patterns, got {count}")]
    InvalidResourceCount {
        /// Actual pattern count.
        count: usize,
    },

    /// Action scope empty or too large.
    #[error("mandate must carry 1..={MAX_POLICY_ACTIONS} actions, got {count}")]
    InvalidActionCount {
        /// Actual action count.
        count: usize,
    },

    /// An action name failed validation.
    #[error("invalid action name: '{action}'")]
    InvalidAction {
        /// The rejected action.
        action: String,
    },

    /// `not_before_ms` must precede `not_after_ms`.
    #[error("validity window is empty: not_before {not_before_ms} >= not_after {not_after_ms}")]
    EmptyValidityWindow {
        /// Window start.
        not_before_ms: i64,
        /// Window end.
        not_after_ms: i64,
    },

    /// Depth inconsistent with parent link presence.
    #[error("depth {depth} inconsistent with parent link (root mandates have depth 0)")]
    DepthMismatch {
        /// The rejected depth.
        depth: u32,
    },

    /// Canonicalization of the signing form failed.
    #[error("canonical form: {0}")]
    Canonical(#[from] CanonicalJsonError),
}

/// Revocation state of a mandate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RevocationState {
    /// Not revoked.
    Active,
    /// Revoked exactly once; terminal.
    Revoked {
        /// When the revocation happened.
        revoked_ms: i64,
        /// Operator-supplied reason.
        reason: String,
        /// Principal that performed the revocation.
        revoked_by: Uuid,
    },
}

impl RevocationState {
    /// Returns true for the revoked state.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }
}

/// A signed, time-bounded authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mandate {
    /// Stable identifier (UUID v4).
    pub mandate_id: Uuid,

    /// Principal that issued (and signed) this mandate.
    pub issuer_id: Uuid,

    /// Principal the grant applies to.
    pub subject_id: Uuid,

    /// Resource patterns the subject may touch.
    pub resources: Vec<ResourcePattern>,

    /// Action names the subject may perform.
    pub actions: Vec<String>,

    /// Window start, milliseconds since epoch (inclusive).
    pub not_before_ms: i64,

    /// Window end, milliseconds since epoch (inclusive).
    pub not_after_ms: i64,

    /// Parent mandate for delegation chains.
    pub parent_mandate_id: Option<Uuid>,

    /// 0 for root mandates, parent depth + 1 otherwise.
    pub depth: u32,

    /// Optional binding to one pre-declared operation.
    pub intent_hash: Option<Hash>,

    /// Issuer ECDSA signature over the canonical signing form.
    #[serde(with = "serde_sig_hex")]
    pub signature: Vec<u8>,

    /// Creation time, milliseconds since epoch.
    pub created_ms: i64,

    /// Revocation state.
    pub revocation: RevocationState,
}

impl Mandate {
    /// Validates structural bounds (not the signature or chain).
    ///
    /// # Errors
    ///
    /// Returns the first violation found (fail-closed).
    pub fn validate(&self) -> Result<(), MandateError> {
        if self.resources.is_empty() || self.resources.len() > MAX_POLICY_RESOURCES {
            return Err(MandateError::InvalidResourceCount {
                count: self.resources.len(),
            });
        }
        if self.actions.is_empty() || self.actions.len() > MAX_POLICY_ACTIONS {
            return Err(MandateError::InvalidActionCount {
                count: self.actions.len(),
            });
        }
        for action in &self.actions {
            validate_action_name(action).map_err(|_| MandateError::InvalidAction {
                action: action.clone(),
            })?;
        }
        if self.not_before_ms >= self.not_after_ms {
            return Err(MandateError::EmptyValidityWindow {
                not_before_ms: self.not_before_ms,
                not_after_ms: self.not_after_ms,
            });
        }
        let depth_consistent = match self.parent_mandate_id {
            None => self.depth == 0,
            Some(_) => self.depth >= 1,
        };
        if !depth_consistent {
            return Err(MandateError::DepthMismatch { depth: self.depth });
        }
        Ok(())
    }

    /// Builds the canonical signing form.
    ///
    /// Field set and naming are part of the wire contract: `id, issuer,
    /// subject, resources (sorted), actions (sorted), not_before_ms,
    /// not_after_ms, parent_mandate_id|null, depth, intent_hash|null,
    /// created_ms`. The signature field itself is never part of the form.
    #[must_use]
    pub fn signing_value(&self) -> Value {
        let mut resources: Vec<String> = self
            .resources
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        resources.sort_unstable();
        let mut actions = self.actions.clone();
        actions.sort_unstable();

        json!({
            "id": self.mandate_id.to_string(),
            "issuer": self.issuer_id.to_string(),
            "subject": self.subject_id.to_string(),
            "resources": resources,
            "actions": actions,
            "not_before_ms": self.not_before_ms,
            "not_after_ms": self.not_after_ms,
            "parent_mandate_id": self.parent_mandate_id.map(|id| id.to_string()),
            "depth": self.depth,
            "intent_hash": self.intent_hash.as_ref().map(hex::encode),
            "created_ms": self.created_ms,
        })
    }

    /// Returns the canonical bytes the issuer signs.
    ///
    /// # Errors
    ///
    /// Returns a canonicalization error; with the fields produced by
    /// [`Mandate::signing_value`] this only fires on pathological inputs.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, MandateError> {
        Ok(canonical::canonical_bytes(&self.signing_value())?)
    }

    /// Verifies the issuer signature under `issuer_public_key`.
    ///
    /// Canonicalization failure verifies as `false`: an unsignable form is
    /// an invalid signature, not an error path.
    #[must_use]
    pub fn verify_signature(&self, issuer_public_key: &[u8]) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => crypto::verify_signature(issuer_public_key, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Returns true if `now_ms` is before the window opens.
    #[must_use]
    pub const fn is_not_yet_valid(&self, now_ms: i64) -> bool {
        now_ms < self.not_before_ms
    }

    /// Returns true if `now_ms` is past the window end.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.not_after_ms
    }

    /// Returns true if revoked.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        self.revocation.is_revoked()
    }

    /// Checks that this mandate is a strict narrowing of `parent`:
    /// scope subset, action subset, validity containment, depth + 1.
    #[must_use]
    pub fn narrows(&self, parent: &Self) -> bool {
        scope_is_subset(&self.resources, &parent.resources)
            && self.actions.iter().all(|a| parent.actions.contains(a))
            && self.not_before_ms >= parent.not_before_ms
            && self.not_after_ms <= parent.not_after_ms
            && self.depth == parent.depth + 1
    }
}

/// Hex (de)serialization for signature bytes.
mod serde_sig_hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(de::Error::custom)
    }
}

/// Computes the intent hash for a declared operation: the SHA-256 of the
/// canonical JSON of the claim.
///
/// # Errors
///
/// Returns a canonicalization error if the claim contains floats, non-NFC
/// strings, or exceeds bounds.
pub fn intent_hash(claim: &Value) -> Result<Hash, CanonicalJsonError> {
    Ok(crypto::sha256(&canonical::canonical_bytes(claim)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    fn base_mandate() -> Mandate {
        Mandate {
            mandate_id: Uuid::new_v4(),
            issuer_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            resources: vec![ResourcePattern::parse("api:openai:gpt-4").unwrap()],
            actions: vec!["call".to_string()],
            not_before_ms: 1_000,
            not_after_ms: 601_000,
            parent_mandate_id: None,
            depth: 0,
            intent_hash: None,
            signature: Vec::new(),
            created_ms: 1_000,
            revocation: RevocationState::Active,
        }
    }

    #[test]
    fn signing_bytes_are_stable_across_scope_order() {
        let mut a = base_mandate();
        a.resources = vec![
            ResourcePattern::parse("b:y:z").unwrap(),
            ResourcePattern::parse("a:x:y").unwrap(),
        ];
        a.actions = vec!["write".to_string(), "call".to_string()];

        let mut b = a.clone();
        b.resources.reverse();
        b.actions.reverse();

        assert_eq!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    }

    #[test]
    fn sign_then_verify() {
        let signer = Signer::generate();
        let mut mandate = base_mandate();
        mandate.signature = signer.sign(&mandate.signing_bytes().unwrap());
        assert!(mandate.verify_signature(&signer.public_key_bytes()));

        // Any field change invalidates the signature.
        mandate.not_after_ms += 1;
        assert!(!mandate.verify_signature(&signer.public_key_bytes()));
    }

    #[test]
    fn revocation_is_not_signed() {
        // Revocation state mutates after signing; the signature must not
        // cover it.
        let signer = Signer::generate();
        let mut mandate = base_mandate();
        mandate.signature = signer.sign(&mandate.signing_bytes().unwrap());
        mandate.revocation = RevocationState::Revoked {
            revoked_ms: 2_000,
            reason: "test".to_string(),
            revoked_by: mandate.issuer_id,
        };
        assert!(mandate.verify_signature(&signer.public_key_bytes()));
    }

    #[test]
    fn window_checks() {
        let mandate = base_mandate();
        assert!(mandate.is_not_yet_valid(999));
        assert!(!mandate.is_not_yet_valid(1_000));
        assert!(!mandate.is_expired(601_000));
        assert!(mandate.is_expired(601_001));
    }

    #[test]
    fn narrows_requires_all_dimensions() {
        let parent = {
            let mut m = base_mandate();
            m.resources = vec![ResourcePattern::parse("api:*:*").unwrap()];
            m.actions = vec!["call".to_string(), "write".to_string()];
            m
        };

        let mut child = base_mandate();
        child.parent_mandate_id = Some(parent.mandate_id);
        child.depth = 1;
        child.not_before_ms = parent.not_before_ms + 10;
        child.not_after_ms = parent.not_after_ms - 10;
        assert!(child.narrows(&parent));

        let mut wide_scope = child.clone();
        wide_scope.resources = vec![ResourcePattern::parse("tools:**").unwrap()];
        assert!(!wide_scope.narrows(&parent));

        let mut wide_action = child.clone();
        wide_action.actions = vec!["admin".to_string()];
        assert!(!wide_action.narrows(&parent));

        let mut wide_window = child.clone();
        wide_window.not_after_ms = parent.not_after_ms + 1;
        assert!(!wide_window.narrows(&parent));

        let mut bad_depth = child.clone();
        bad_depth.depth = 2;
        assert!(!bad_depth.narrows(&parent));
    }

    #[test]
    fn validate_rejects_empty_window() {
        let mut mandate = base_mandate();
        mandate.not_after_ms = mandate.not_before_ms;
        assert!(matches!(
            mandate.validate(),
            Err(MandateError::EmptyValidityWindow { .. })
        ));
    }

    #[test]
    fn validate_rejects_depth_mismatch() {
        let mut mandate = base_mandate();
        mandate.depth = 1;
        assert!(matches!(
            mandate.validate(),
            Err(MandateError::DepthMismatch { .. })
        ));
    }

    #[test]
    fn intent_hash_is_canonical() {
        let a = serde_json::json!({"op": "transfer", "amount": 100});
        let b = serde_json::json!({"amount": 100, "op": "transfer"});
        assert_eq!(intent_hash(&a).unwrap(), intent_hash(&b).unwrap());

        let c = serde_json::json!({"op": "transfer", "amount": 101});
        assert_ne!(intent_hash(&a).unwrap(), intent_hash(&c).unwrap());
    }
}
