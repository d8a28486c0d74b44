//! The decision engine.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::cache::EvaluatorCaches;
use super::{Decision, DecisionReason, EvaluationRequest};
use crate::clock::now_ms;
use crate::crypto;
use crate::ledger::{EventBody, EventKind, EventOutcome};
use crate::mandate::{Mandate, intent_hash};
use crate::pipeline::{EventBus, TOPIC_DECISIONS, WireEvent};
use crate::scope::{scope_is_subset, scope_matches};
use crate::store::{SqliteStore, StoreError};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Evaluation deadline; crossing it denies with `Canceled`.
    pub deadline_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { deadline_ms: 100 }
    }
}

/// The hot-path evaluator.
///
/// Concurrent evaluations share the read-mostly caches and never serialize
/// on a common lock across I/O. Decision events are published to the bus;
/// the ledger-writer consumer is the only component that turns them into
/// ledger rows.
pub struct AuthorityEvaluator {
    store: Arc<SqliteStore>,
    caches: Arc<EvaluatorCaches>,
    bus: Arc<dyn EventBus>,
    config: EvaluatorConfig,
}

impl AuthorityEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        caches: Arc<EvaluatorCaches>,
        bus: Arc<dyn EventBus>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            store,
            caches,
            bus,
            config,
        }
    }

    /// Returns the shared caches (for wiring invalidation listeners).
    #[must_use]
    pub fn caches(&self) -> &Arc<EvaluatorCaches> {
        &self.caches
    }

    /// Evaluates a request against the current clock.
    pub fn evaluate(&self, request: &EvaluationRequest) -> Decision {
        self.evaluate_at(request, now_ms())
    }

    /// Evaluates at an explicit timestamp (tests; validity windows and
    /// cache TTLs use it, the cancellation deadline uses real elapsed
    /// time).
    pub fn evaluate_at(&self, request: &EvaluationRequest, now_ms: i64) -> Decision {
        let started = Instant::now();
        let (reason, chain) = self.decide(request, now_ms, started);
        let leaf = chain.and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) });

        let allowed = reason == DecisionReason::Allow;
        if !allowed {
            warn!(
                mandate_id = %request.mandate_id,
                action = %request.requested_action,
                resource = %request.requested_resource,
                %reason,
                "authority denied"
            );
        } else {
            debug!(
                mandate_id = %request.mandate_id,
                action = %request.requested_action,
                resource = %request.requested_resource,
                "authority allowed"
            );
        }

        self.emit_decision(request, reason, leaf.as_ref(), now_ms);

        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        Decision {
            allowed,
            reason,
            mandate: leaf,
            evaluated_at_ms: now_ms,
            latency_ms,
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// The ordered checks. Short-circuits on the first failure.
    fn decide(
        &self,
        request: &EvaluationRequest,
        now_ms: i64,
        started: Instant,
    ) -> (DecisionReason, Option<Vec<Mandate>>) {
        if self.deadline_crossed(started) {
            return (DecisionReason::Canceled, None);
        }

        // 1. Load the chain, leaf first.
        let chain = match self.load_chain(request.mandate_id, now_ms) {
            Ok(chain) => chain,
            Err(reason) => return (reason, None),
        };
        if self.deadline_crossed(started) {
            return (DecisionReason::Canceled, Some(chain));
        }

        // 2. Signature chain under each issuer's current public key.
        for mandate in &chain {
            let issuer = match self.store.get_principal(mandate.issuer_id) {
                Ok(principal) => principal,
                Err(StoreError::NotFound { .. }) => {
                    return (DecisionReason::BadSignature, Some(chain));
                },
                Err(error) => {
                    error!(%error, "principal load failed during evaluation");
                    return (DecisionReason::InternalError, Some(chain));
                },
            };
            if !mandate.verify_signature(&issuer.public_key) {
                return (DecisionReason::BadSignature, Some(chain));
            }
        }
        if self.deadline_crossed(started) {
            return (DecisionReason::Canceled, Some(chain));
        }

        // 3. Revocation anywhere in the chain.
        if chain.iter().any(Mandate::is_revoked) {
            return (DecisionReason::Revoked, Some(chain));
        }

        // 4. Validity window of every mandate in the chain.
        if chain.iter().any(|m| m.is_expired(now_ms)) {
            return (DecisionReason::Expired, Some(chain));
        }
        if chain.iter().any(|m| m.is_not_yet_valid(now_ms)) {
            return (DecisionReason::NotYetValid, Some(chain));
        }

        // 5. Leaf scope against the concrete request.
        let leaf = &chain[0];
        if !leaf.actions.iter().any(|a| a == &request.requested_action)
            || !scope_matches(&leaf.resources, &request.requested_resource)
        {
            return (DecisionReason::OutOfScope, Some(chain));
        }

        // 6. Subset-through-chain, re-verified as defense in depth against
        //    stored records that bypassed issuance.
        for pair in chain.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            let narrowed = scope_is_subset(&child.resources, &parent.resources)
                && child.actions.iter().all(|a| parent.actions.contains(a))
                && child.not_before_ms >= parent.not_before_ms
                && child.not_after_ms <= parent.not_after_ms;
            if !narrowed {
                return (DecisionReason::OutOfScope, Some(chain));
            }
        }

        // 7. Intent binding.
        if let Some(expected) = &leaf.intent_hash {
            let matches = request
                .intent_claim
                .as_ref()
                .and_then(|claim| intent_hash(claim).ok())
                .is_some_and(|actual| crypto::hashes_equal(expected, &actual));
            if !matches {
                return (DecisionReason::IntentMismatch, Some(chain));
            }
        }
        if self.deadline_crossed(started) {
            return (DecisionReason::Canceled, Some(chain));
        }

        // 8. Policy ceiling of the root issuer's *current* active policy;
        //    an operator can cut authority by policy change without
        //    touching mandates.
        let root = &chain[chain.len() - 1];
        let policy = match self.load_policy(root.issuer_id, now_ms) {
            Ok(policy) => policy,
            Err(reason) => return (reason, Some(chain)),
        };
        let permitted = scope_is_subset(&leaf.resources, &policy.resources)
            && leaf.actions.iter().all(|a| policy.permits_action(a));
        if !permitted {
            return (DecisionReason::PolicyDenied, Some(chain));
        }

        (DecisionReason::Allow, Some(chain))
    }

    fn load_chain(&self, mandate_id: Uuid, now_ms: i64) -> Result<Vec<Mandate>, DecisionReason> {
        if let Some(chain) = self.caches.get_chain(mandate_id, now_ms) {
            return Ok(chain);
        }
        match self.store.get_mandate_chain(mandate_id) {
            Ok(chain) => {
                self.caches.put_chain(mandate_id, chain.clone(), now_ms);
                Ok(chain)
            },
            Err(StoreError::NotFound { .. }) => Err(DecisionReason::UnknownMandate),
            Err(error) => {
                error!(%error, %mandate_id, "chain load failed during evaluation");
                Err(DecisionReason::InternalError)
            },
        }
    }

    fn load_policy(
        &self,
        principal_id: Uuid,
        now_ms: i64,
    ) -> Result<crate::policy::AuthorityPolicy, DecisionReason> {
        if let Some(policy) = self.caches.get_policy(principal_id, now_ms) {
            return Ok(policy);
        }
        match self.store.get_active_policy(principal_id) {
            Ok(policy) => {
                self.caches.put_policy(policy.clone(), now_ms);
                Ok(policy)
            },
            // No active policy means no remaining authority.
            Err(StoreError::NotFound { .. }) => Err(DecisionReason::PolicyDenied),
            Err(error) => {
                error!(%error, %principal_id, "policy load failed during evaluation");
                Err(DecisionReason::InternalError)
            },
        }
    }

    fn deadline_crossed(&self, started: Instant) -> bool {
        started.elapsed().as_millis() >= u128::from(self.config.deadline_ms)
    }

    /// Publishes the decision event. The audit trail must be complete, so
    /// this runs for every outcome including `Canceled`; a publish failure
    /// is logged loudly but cannot change an already-made decision.
    fn emit_decision(
        &self,
        request: &EvaluationRequest,
        reason: DecisionReason,
        leaf: Option<&Mandate>,
        now_ms: i64,
    ) {
        let allowed = reason == DecisionReason::Allow;
        let principal_id = leaf.map_or_else(Uuid::nil, |m| m.subject_id);

        let mut body = EventBody::new(
            principal_id,
            if allowed {
                EventKind::DecisionAllow
            } else {
                EventKind::DecisionDeny
            },
        );
        body.mandate_id = Some(request.mandate_id);
        body.action = Some(request.requested_action.clone());
        body.resource = Some(request.requested_resource.clone());
        body.outcome = Some(if allowed {
            EventOutcome::Allowed
        } else {
            EventOutcome::Denied
        });
        body.correlation_id = request.correlation_id.clone();
        // No producer sequence here: the ledger-writer consumer derives the
        // dedupe key deterministically from the record's bus coordinates,
        // so a redelivered decision stays a single ledger row while two
        // distinct decisions can never collide with each other or with a
        // metering producer's own sequence range.
        body.metadata = json!({
            "reason": reason.as_str(),
            "evaluated_at_ms": now_ms,
        });

        let key = principal_id.to_string();
        let publish = WireEvent::new(body)
            .to_bytes()
            .and_then(|bytes| self.bus.publish(TOPIC_DECISIONS, Some(&key), &bytes));
        if let Err(error) = publish {
            error!(%error, mandate_id = %request.mandate_id, "failed to publish decision event");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::KeyManager;
    use crate::evaluator::EvaluatorCaches;
    use crate::mandate::{IssueRequest, MandateManager, RevokeRequest};
    use crate::pipeline::InMemoryBus;
    use crate::policy::AuthorityPolicy;
    use crate::principal::Principal;
    use crate::scope::ResourcePattern;

    struct Fixture {
        evaluator: AuthorityEvaluator,
        manager: MandateManager,
        bus: Arc<InMemoryBus>,
        issuer: Uuid,
        subject: Uuid,
    }

    fn pat(s: &str) -> ResourcePattern {
        ResourcePattern::parse(s).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let keys = Arc::new(KeyManager::in_memory());
        let bus = Arc::new(InMemoryBus::new(2));
        let caches = Arc::new(EvaluatorCaches::default());

        let issuer = Uuid::new_v4();
        let subject = Uuid::new_v4();
        for id in [issuer, subject] {
            let signer = keys.generate_keypair(id).unwrap();
            store
                .insert_principal(
                    &Principal::new(id, signer.public_key_bytes(), "agent", "ops", None, 0)
                        .unwrap(),
                )
                .unwrap();
        }

        let manager = MandateManager::new(Arc::clone(&store), keys, 0)
            .with_listener(Arc::clone(&caches) as _);
        manager
            .activate_policy(&AuthorityPolicy {
                policy_id: Uuid::new_v4(),
                principal_id: issuer,
                resources: vec![pat("api:*:*")],
                actions: vec!["call".to_string()],
                max_validity_ms: 3_600_000,
                max_delegation_depth: 3,
                allow_delegation: true,
                active: true,
                version: 1,
                created_ms: 0,
            })
            .unwrap();

        let evaluator = AuthorityEvaluator::new(
            store,
            caches,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            EvaluatorConfig::default(),
        );
        Fixture {
            evaluator,
            manager,
            bus,
            issuer,
            subject,
        }
    }

    fn issue(f: &Fixture) -> crate::mandate::Mandate {
        f.manager
            .issue_mandate_at(
                &IssueRequest {
                    issuer_id: f.issuer,
                    subject_id: f.subject,
                    resources: vec![pat("api:openai:gpt-4")],
                    actions: vec!["call".to_string()],
                    not_before_ms: 1_000,
                    not_after_ms: 601_000,
                    intent_hash: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                },
                1_000,
            )
            .unwrap()
    }

    fn request(mandate_id: Uuid, action: &str, resource: &str) -> EvaluationRequest {
        EvaluationRequest {
            mandate_id,
            requested_action: action.to_string(),
            requested_resource: resource.to_string(),
            intent_claim: None,
            correlation_id: Some("corr-42".to_string()),
        }
    }

    fn decision_events(bus: &InMemoryBus) -> Vec<WireEvent> {
        let mut out = Vec::new();
        for partition in 0..bus.partition_count(TOPIC_DECISIONS) {
            for record in bus.poll(TOPIC_DECISIONS, partition, 0, 1024).unwrap() {
                out.push(WireEvent::from_bytes(&record.payload).unwrap());
            }
        }
        out
    }

    #[test]
    fn allow_in_scope_request() {
        let f = fixture();
        let mandate = issue(&f);

        let decision =
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 2_000);
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Allow);
        assert_eq!(decision.mandate.unwrap().mandate_id, mandate.mandate_id);

        let events = decision_events(&f.bus);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body.kind, EventKind::DecisionAllow);
        assert_eq!(events[0].body.mandate_id, Some(mandate.mandate_id));
        assert_eq!(events[0].body.correlation_id.as_deref(), Some("corr-42"));
    }

    #[test]
    fn deny_out_of_scope() {
        let f = fixture();
        let mandate = issue(&f);

        let decision = f.evaluator.evaluate_at(
            &request(mandate.mandate_id, "call", "api:anthropic:claude"),
            2_000,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::OutOfScope);

        let events = decision_events(&f.bus);
        assert_eq!(events[0].body.kind, EventKind::DecisionDeny);
    }

    #[test]
    fn deny_unknown_mandate() {
        let f = fixture();
        let decision =
            f.evaluator
                .evaluate_at(&request(Uuid::new_v4(), "call", "api:openai:gpt-4"), 2_000);
        assert_eq!(decision.reason, DecisionReason::UnknownMandate);
        assert!(decision.mandate.is_none());
        // The deny is still audited.
        assert_eq!(decision_events(&f.bus).len(), 1);
    }

    #[test]
    fn deny_expired_and_not_yet_valid() {
        let f = fixture();
        let mandate = issue(&f);

        let early = f
            .evaluator
            .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 500);
        assert_eq!(early.reason, DecisionReason::NotYetValid);

        let late = f.evaluator.evaluate_at(
            &request(mandate.mandate_id, "call", "api:openai:gpt-4"),
            700_000,
        );
        assert_eq!(late.reason, DecisionReason::Expired);
    }

    #[test]
    fn deny_revoked_after_cache_invalidation() {
        let f = fixture();
        let mandate = issue(&f);

        // Warm the chain cache.
        let warm =
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 2_000);
        assert!(warm.allowed);

        f.manager
            .revoke_mandate_at(
                &RevokeRequest {
                    revoker_id: f.issuer,
                    mandate_id: mandate.mandate_id,
                    reason: "compromised".to_string(),
                    cascade: false,
                    admin_override: false,
                    correlation_id: None,
                },
                3_000,
            )
            .unwrap();

        // The listener invalidated the cached chain, so the revocation is
        // visible before the TTL would have expired.
        let decision =
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 4_000);
        assert_eq!(decision.reason, DecisionReason::Revoked);
    }

    #[test]
    fn intent_binding_allows_exact_and_denies_mismatch() {
        let f = fixture();
        let claim = json!({"op": "transfer", "amount": 100});
        let mandate = f
            .manager
            .issue_mandate_at(
                &IssueRequest {
                    issuer_id: f.issuer,
                    subject_id: f.subject,
                    resources: vec![pat("api:openai:gpt-4")],
                    actions: vec!["call".to_string()],
                    not_before_ms: 1_000,
                    not_after_ms: 601_000,
                    intent_hash: Some(intent_hash(&claim).unwrap()),
                    parent_mandate_id: None,
                    correlation_id: None,
                },
                1_000,
            )
            .unwrap();

        let mut ok = request(mandate.mandate_id, "call", "api:openai:gpt-4");
        ok.intent_claim = Some(json!({"amount": 100, "op": "transfer"}));
        assert!(f.evaluator.evaluate_at(&ok, 2_000).allowed);

        let mut bad = ok.clone();
        bad.intent_claim = Some(json!({"op": "transfer", "amount": 101}));
        assert_eq!(
            f.evaluator.evaluate_at(&bad, 2_000).reason,
            DecisionReason::IntentMismatch
        );

        let mut missing = ok;
        missing.intent_claim = None;
        assert_eq!(
            f.evaluator.evaluate_at(&missing, 2_000).reason,
            DecisionReason::IntentMismatch
        );
    }

    #[test]
    fn policy_change_denies_without_touching_mandates() {
        let f = fixture();
        let mandate = issue(&f);
        assert!(
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 2_000)
                .allowed
        );

        // Narrow the issuer's policy so the leaf scope falls outside it.
        f.manager
            .activate_policy(&AuthorityPolicy {
                policy_id: Uuid::new_v4(),
                principal_id: f.issuer,
                resources: vec![pat("api:internal:*")],
                actions: vec!["call".to_string()],
                max_validity_ms: 3_600_000,
                max_delegation_depth: 3,
                allow_delegation: true,
                active: true,
                version: 2,
                created_ms: 2_500,
            })
            .unwrap();

        let decision =
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 3_000);
        assert_eq!(decision.reason, DecisionReason::PolicyDenied);
    }

    #[test]
    fn zero_deadline_cancels_but_still_audits() {
        let f = fixture();
        let mandate = issue(&f);

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let evaluator = AuthorityEvaluator::new(
            store,
            Arc::new(EvaluatorCaches::default()),
            Arc::clone(&f.bus) as Arc<dyn EventBus>,
            EvaluatorConfig { deadline_ms: 0 },
        );

        let before = decision_events(&f.bus).len();
        let decision =
            evaluator.evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 2_000);
        assert_eq!(decision.reason, DecisionReason::Canceled);
        assert!(!decision.allowed);
        assert_eq!(decision_events(&f.bus).len(), before + 1);
    }

    #[test]
    fn tampered_signature_denies() {
        let f = fixture();
        let mandate = issue(&f);

        // Plant a forged chain in the cache: one field changed after
        // signing, so the signature no longer covers the content.
        let mut forged_chain = vec![mandate.clone()];
        forged_chain[0].not_after_ms += 1;
        f.evaluator
            .caches()
            .put_chain(mandate.mandate_id, forged_chain, 2_000);

        let decision =
            f.evaluator
                .evaluate_at(&request(mandate.mandate_id, "call", "api:openai:gpt-4"), 2_000);
        assert_eq!(decision.reason, DecisionReason::BadSignature);
    }
}
