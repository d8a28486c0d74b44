//! Ledger event records.
//!
//! Events are write-once: once a row exists it is never modified, except for
//! the `batch_id` backfill when the Merkle aggregator seals the batch the
//! event falls into. The content hash covers every field that is immutable
//! at append time, so sealing does not disturb it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{self, CanonicalJsonError};
use crate::crypto::{self, Hash};

/// Maximum length of a correlation id.
pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Maximum serialized size of the metadata blob.
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// Event types recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Root mandate issuance.
    Issue,
    /// Delegated mandate issuance.
    Delegate,
    /// Mandate revocation.
    Revoke,
    /// Evaluator allowed a request.
    DecisionAllow,
    /// Evaluator denied a request.
    DecisionDeny,
    /// Metered resource consumption after an allowed action executed.
    Metering,
}

impl EventKind {
    /// Stable string form used in the store and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Delegate => "delegate",
            Self::Revoke => "revoke",
            Self::DecisionAllow => "decision_allow",
            Self::DecisionDeny => "decision_deny",
            Self::Metering => "metering",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "issue" => Some(Self::Issue),
            "delegate" => Some(Self::Delegate),
            "revoke" => Some(Self::Revoke),
            "decision_allow" => Some(Self::DecisionAllow),
            "decision_deny" => Some(Self::DecisionDeny),
            "metering" => Some(Self::Metering),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome attached to decision and metering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Request allowed.
    Allowed,
    /// Request denied.
    Denied,
    /// Metering event recorded but flagged (e.g. unknown resource price).
    Flagged,
}

impl EventOutcome {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Flagged => "flagged",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "allowed" => Some(Self::Allowed),
            "denied" => Some(Self::Denied),
            "flagged" => Some(Self::Flagged),
            _ => None,
        }
    }
}

/// Validation errors for event bodies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventBodyError {
    /// Currency must be exactly three ASCII uppercase letters.
    #[error("invalid currency code: '{currency}'")]
    InvalidCurrency {
        /// The rejected code.
        currency: String,
    },

    /// Cost present without currency or vice versa.
    #[error("cost and currency must be present together")]
    CostCurrencyMismatch,

    /// Negative cost.
    #[error("cost must be non-negative, got {cost_minor_units}")]
    NegativeCost {
        /// The rejected cost.
        cost_minor_units: i64,
    },

    /// Correlation id too long.
    #[error("correlation id longer than {MAX_CORRELATION_ID_LENGTH} bytes")]
    CorrelationIdTooLong,

    /// Metadata blob too large once serialized.
    #[error("metadata larger than {MAX_METADATA_BYTES} bytes")]
    MetadataTooLarge,
}

/// The caller-supplied portion of a ledger event.
///
/// The ledger writer assigns `event_id`, `partition`, `ts_ms` and the
/// content hash on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    /// Principal the event belongs to.
    pub principal_id: Uuid,

    /// Event type.
    pub kind: EventKind,

    /// Mandate involved, if any.
    pub mandate_id: Option<Uuid>,

    /// Requested action, for decision events.
    pub action: Option<String>,

    /// Requested resource, for decision and metering events.
    pub resource: Option<String>,

    /// Cost in minor units, for metering events.
    pub cost_minor_units: Option<i64>,

    /// ASCII-3 currency code, present iff cost is.
    pub currency: Option<String>,

    /// Outcome for decision/metering events.
    pub outcome: Option<EventOutcome>,

    /// Caller correlation id, threaded through the audit trail.
    pub correlation_id: Option<String>,

    /// Producer sequence for bus-delivered events; the
    /// `(principal_id, producer_seq)` pair deduplicates redeliveries.
    /// Producers assign non-negative values; the negative range is
    /// reserved for the ledger-writer consumer's deterministic fallback
    /// (derived from bus coordinates) so the two never collide.
    pub producer_seq: Option<i64>,

    /// Free-form metadata (canonical-JSON compatible).
    pub metadata: Value,
}

impl EventBody {
    /// Creates a minimal body for the given principal and kind.
    #[must_use]
    pub fn new(principal_id: Uuid, kind: EventKind) -> Self {
        Self {
            principal_id,
            kind,
            mandate_id: None,
            action: None,
            resource: None,
            cost_minor_units: None,
            currency: None,
            outcome: None,
            correlation_id: None,
            producer_seq: None,
            metadata: Value::Null,
        }
    }

    /// Validates bounds and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), EventBodyError> {
        match (&self.cost_minor_units, &self.currency) {
            (None, None) => {},
            (Some(cost), Some(currency)) => {
                if *cost < 0 {
                    return Err(EventBodyError::NegativeCost {
                        cost_minor_units: *cost,
                    });
                }
                let valid = currency.len() == 3
                    && currency.bytes().all(|b| b.is_ascii_uppercase());
                if !valid {
                    return Err(EventBodyError::InvalidCurrency {
                        currency: currency.clone(),
                    });
                }
            },
            _ => return Err(EventBodyError::CostCurrencyMismatch),
        }
        if let Some(correlation_id) = &self.correlation_id {
            if correlation_id.len() > MAX_CORRELATION_ID_LENGTH {
                return Err(EventBodyError::CorrelationIdTooLong);
            }
        }
        let metadata_len = self.metadata.to_string().len();
        if metadata_len > MAX_METADATA_BYTES {
            return Err(EventBodyError::MetadataTooLarge);
        }
        Ok(())
    }
}

/// A fully materialized ledger event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Dense monotonic id within the partition.
    pub event_id: i64,

    /// Partition this event was written to.
    pub partition: i32,

    /// Append time, milliseconds since epoch.
    pub ts_ms: i64,

    /// Caller-supplied body.
    #[serde(flatten)]
    pub body: EventBody,

    /// SHA-256 of the canonical content form.
    #[serde(with = "serde_hash_hex")]
    pub content_hash: Hash,

    /// Merkle batch this event was sealed into, once sealed.
    pub batch_id: Option<i64>,
}

impl LedgerEvent {
    /// Builds the canonical content form covered by the content hash.
    ///
    /// `batch_id` is excluded: it is backfilled at seal time and must not
    /// disturb the hash the Merkle leaf was computed from.
    #[must_use]
    pub fn content_value(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "partition": self.partition,
            "ts_ms": self.ts_ms,
            "principal_id": self.body.principal_id.to_string(),
            "type": self.body.kind.as_str(),
            "mandate_id": self.body.mandate_id.map(|id| id.to_string()),
            "action": self.body.action,
            "resource": self.body.resource,
            "cost_minor_units": self.body.cost_minor_units,
            "currency": self.body.currency,
            "outcome": self.body.outcome.map(EventOutcome::as_str),
            "correlation_id": self.body.correlation_id,
            "producer_seq": self.body.producer_seq,
            "metadata": self.body.metadata,
        })
    }

    /// Computes the content hash over the canonical content form.
    ///
    /// # Errors
    ///
    /// Returns a canonicalization error if the metadata blob violates the
    /// canonical profile (floats, non-NFC strings).
    pub fn compute_content_hash(&self) -> Result<Hash, CanonicalJsonError> {
        Ok(crypto::sha256(&canonical::canonical_bytes(
            &self.content_value(),
        )?))
    }
}

/// Hex (de)serialization for content hashes.
mod serde_hash_hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::crypto::{HASH_SIZE, Hash};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(de::Error::custom)?;
        let array: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("hash must be 32 bytes"))?;
        Ok(array)
    }
}
