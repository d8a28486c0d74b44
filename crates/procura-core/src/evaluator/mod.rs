//! Authority evaluation: the hot-path decision engine.
//!
//! `evaluate(mandate, action, resource)` decides whether a mandate
//! authorizes a concrete request. The engine is fail-closed: any internal
//! failure, missing dependency or ambiguity becomes a deny with a specific
//! machine-checkable reason, and every decision — allow or deny — produces
//! an audit event. A denial is a normal outcome, never an error.

mod cache;
mod engine;

pub use cache::{AuthCacheConfig, AuthCacheStats, EvaluatorCaches};
pub use engine::{AuthorityEvaluator, EvaluatorConfig};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::mandate::Mandate;

/// Machine-checkable decision reasons.
///
/// This taxonomy is stable wire vocabulary: new reasons are added as new
/// variants, existing ones are never redefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionReason {
    /// Request authorized.
    Allow,
    /// Mandate id did not resolve.
    UnknownMandate,
    /// A signature in the chain failed verification.
    BadSignature,
    /// A mandate in the chain is revoked.
    Revoked,
    /// A mandate in the chain is past its window.
    Expired,
    /// A mandate in the chain has not reached its window yet.
    NotYetValid,
    /// Requested action or resource is outside the leaf scope (or the
    /// chain-subset invariant failed re-verification).
    OutOfScope,
    /// Intent binding present and the claim hash did not match.
    IntentMismatch,
    /// The root issuer's current policy no longer permits the leaf scope.
    PolicyDenied,
    /// The caller's deadline expired during evaluation.
    Canceled,
    /// Internal failure; fail-closed deny.
    InternalError,
}

impl DecisionReason {
    /// Stable string form (matches the serde rendering).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::UnknownMandate => "UnknownMandate",
            Self::BadSignature => "BadSignature",
            Self::Revoked => "Revoked",
            Self::Expired => "Expired",
            Self::NotYetValid => "NotYetValid",
            Self::OutOfScope => "OutOfScope",
            Self::IntentMismatch => "IntentMismatch",
            Self::PolicyDenied => "PolicyDenied",
            Self::Canceled => "Canceled",
            Self::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An evaluation request as received from the proxy or tool adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// The mandate the caller presents.
    pub mandate_id: Uuid,

    /// Action the agent wants to perform.
    pub requested_action: String,

    /// Concrete resource URN of the request.
    pub requested_resource: String,

    /// Declared operation for intent-bound mandates.
    #[serde(default)]
    pub intent_claim: Option<Value>,

    /// Caller correlation id, threaded through the audit trail.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// The evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request is authorized.
    pub allowed: bool,

    /// Why.
    pub reason: DecisionReason,

    /// The leaf mandate, when it resolved.
    pub mandate: Option<Mandate>,

    /// Evaluation time, milliseconds since epoch.
    pub evaluated_at_ms: i64,

    /// Wall-clock latency of the evaluation in milliseconds.
    pub latency_ms: i64,

    /// Echo of the request correlation id.
    pub correlation_id: Option<String>,
}

impl Decision {
    /// Projects the wire response shape for the proxy.
    #[must_use]
    pub fn to_response(&self) -> EvaluationResponse {
        EvaluationResponse {
            allowed: self.allowed,
            reason: self.reason,
            evaluated_at_ms: self.evaluated_at_ms,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Wire response returned to the proxy / tool adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResponse {
    /// Whether the request is authorized.
    pub allowed: bool,

    /// Machine-checkable reason.
    pub reason: DecisionReason,

    /// Evaluation time, milliseconds since epoch.
    pub evaluated_at_ms: i64,

    /// Echo of the request correlation id.
    pub correlation_id: Option<String>,
}
