//! Delegation chains and cascade revocation.

use std::sync::Arc;

use procura_core::crypto::KeyManager;
use procura_core::evaluator::{
    AuthorityEvaluator, DecisionReason, EvaluationRequest, EvaluatorCaches, EvaluatorConfig,
};
use procura_core::ledger::EventKind;
use procura_core::mandate::{IssueRequest, Mandate, MandateManager, RevokeRequest};
use procura_core::pipeline::{EventBus, InMemoryBus};
use procura_core::policy::AuthorityPolicy;
use procura_core::principal::Principal;
use procura_core::scope::{ResourcePattern, scope_is_subset};
use procura_core::store::SqliteStore;
use uuid::Uuid;

struct Harness {
    store: Arc<SqliteStore>,
    manager: MandateManager,
    evaluator: AuthorityEvaluator,
    issuer: Uuid,
    subject: Uuid,
}

fn pat(s: &str) -> ResourcePattern {
    ResourcePattern::parse(s).unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let keys = Arc::new(KeyManager::in_memory());
    let caches = Arc::new(EvaluatorCaches::default());
    let bus = Arc::new(InMemoryBus::new(2));

    let issuer = Uuid::new_v4();
    let subject = Uuid::new_v4();
    for id in [issuer, subject] {
        let signer = keys.generate_keypair(id).unwrap();
        store
            .insert_principal(
                &Principal::new(id, signer.public_key_bytes(), "agent", "ops", None, 0).unwrap(),
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
            actions: vec!["call".to_string(), "read".to_string()],
            max_validity_ms: 3_600_000,
            max_delegation_depth: 3,
            allow_delegation: true,
            active: true,
            version: 1,
            created_ms: 0,
        })
        .unwrap();

    let evaluator = AuthorityEvaluator::new(
        Arc::clone(&store),
        caches,
        bus as Arc<dyn EventBus>,
        EvaluatorConfig::default(),
    );
    Harness {
        store,
        manager,
        evaluator,
        issuer,
        subject,
    }
}

fn issue_root(h: &Harness) -> Mandate {
    h.manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
                resources: vec![pat("api:openai:*")],
                actions: vec!["call".to_string(), "read".to_string()],
                not_before_ms: 1_000,
                not_after_ms: 1_801_000,
                intent_hash: None,
                parent_mandate_id: None,
                correlation_id: None,
            },
            1_000,
        )
        .unwrap()
}

fn delegate(h: &Harness, parent: &Mandate) -> Mandate {
    h.manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
                resources: vec![pat("api:openai:gpt-4")],
                actions: vec!["call".to_string()],
                not_before_ms: parent.not_before_ms + 1_000,
                not_after_ms: parent.not_after_ms - 1_000,
                intent_hash: None,
                parent_mandate_id: Some(parent.mandate_id),
                correlation_id: None,
            },
            2_000,
        )
        .unwrap()
}

fn evaluate(h: &Harness, mandate_id: Uuid, now_ms: i64) -> procura_core::Decision {
    h.evaluator.evaluate_at(
        &EvaluationRequest {
            mandate_id,
            requested_action: "call".to_string(),
            requested_resource: "api:openai:gpt-4".to_string(),
            intent_claim: None,
            correlation_id: None,
        },
        now_ms,
    )
}

/// Chain-subset invariant: every persisted delegation narrows its parent
/// on scope, actions, validity, and sits exactly one level deeper.
#[test]
fn delegation_chain_preserves_subset_invariant() {
    let h = harness();
    let root = issue_root(&h);
    let child = delegate(&h, &root);
    let grandchild = h
        .manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
                resources: vec![pat("api:openai:gpt-4")],
                actions: vec!["call".to_string()],
                not_before_ms: child.not_before_ms,
                not_after_ms: child.not_after_ms,
                intent_hash: None,
                parent_mandate_id: Some(child.mandate_id),
                correlation_id: None,
            },
            3_000,
        )
        .unwrap();

    let chain = h.store.get_mandate_chain(grandchild.mandate_id).unwrap();
    assert_eq!(chain.len(), 3);
    for pair in chain.windows(2) {
        let (leaf, parent) = (&pair[0], &pair[1]);
        assert!(scope_is_subset(&leaf.resources, &parent.resources));
        assert!(leaf.actions.iter().all(|a| parent.actions.contains(a)));
        assert!(leaf.not_before_ms >= parent.not_before_ms);
        assert!(leaf.not_after_ms <= parent.not_after_ms);
        assert_eq!(leaf.depth, parent.depth + 1);
    }
}

/// Cascade completeness: after revoke(root, cascade) every descendant
/// evaluates to deny with reason Revoked.
#[test]
fn cascade_revocation_denies_all_descendants() {
    let h = harness();
    let root = issue_root(&h);
    let child = delegate(&h, &root);
    let grandchild = h
        .manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
                resources: vec![pat("api:openai:gpt-4")],
                actions: vec!["call".to_string()],
                not_before_ms: child.not_before_ms,
                not_after_ms: child.not_after_ms,
                intent_hash: None,
                parent_mandate_id: Some(child.mandate_id),
                correlation_id: None,
            },
            3_000,
        )
        .unwrap();

    // The chain evaluates allow before revocation.
    assert!(evaluate(&h, grandchild.mandate_id, 10_000).allowed);

    let outcome = h
        .manager
        .revoke_mandate_at(
            &RevokeRequest {
                revoker_id: h.issuer,
                mandate_id: root.mandate_id,
                reason: "incident response".to_string(),
                cascade: true,
                admin_override: false,
                correlation_id: None,
            },
            20_000,
        )
        .unwrap();
    assert_eq!(outcome.revoked.len(), 3);
    assert!(outcome.failed.is_empty());

    for id in [root.mandate_id, child.mandate_id, grandchild.mandate_id] {
        let decision = evaluate(&h, id, 30_000);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Revoked);
    }

    // One revoke ledger event per mandate in the subtree.
    let revokes = h
        .store
        .read_events_from(0, 1, 100)
        .unwrap()
        .into_iter()
        .filter(|e| e.body.kind == EventKind::Revoke)
        .count();
    assert_eq!(revokes, 3);
}

/// Revoking only the leaf leaves the parent usable.
#[test]
fn leaf_revocation_does_not_touch_parent() {
    let h = harness();
    let root = issue_root(&h);
    let child = delegate(&h, &root);

    h.manager
        .revoke_mandate_at(
            &RevokeRequest {
                revoker_id: h.subject,
                mandate_id: child.mandate_id,
                reason: "done".to_string(),
                cascade: true,
                admin_override: false,
                correlation_id: None,
            },
            5_000,
        )
        .unwrap();

    assert_eq!(
        evaluate(&h, child.mandate_id, 10_000).reason,
        DecisionReason::Revoked
    );
    assert!(evaluate(&h, root.mandate_id, 10_000).allowed);
}

/// Evaluator monotonicity: with no revocation or policy change, an allow
/// stays an allow at any instant inside the chain's validity windows.
#[test]
fn allow_is_stable_inside_validity_window() {
    let h = harness();
    let root = issue_root(&h);
    let child = delegate(&h, &root);

    for now_ms in [
        child.not_before_ms,
        child.not_before_ms + 5_000,
        (child.not_before_ms + child.not_after_ms) / 2,
        child.not_after_ms,
    ] {
        let decision = evaluate(&h, child.mandate_id, now_ms);
        assert!(decision.allowed, "must allow at {now_ms}");
    }

    // Outside the window the same chain denies.
    assert_eq!(
        evaluate(&h, child.mandate_id, child.not_after_ms + 1).reason,
        DecisionReason::Expired
    );
    assert_eq!(
        evaluate(&h, child.mandate_id, child.not_before_ms - 1).reason,
        DecisionReason::NotYetValid
    );
}
