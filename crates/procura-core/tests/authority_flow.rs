//! End-to-end authority flow: issue, evaluate, and audit through the
//! event pipeline.

use std::sync::Arc;

use procura_core::crypto::KeyManager;
use procura_core::evaluator::{
    AuthorityEvaluator, DecisionReason, EvaluationRequest, EvaluatorCaches, EvaluatorConfig,
};
use procura_core::ledger::{EventKind, LedgerWriter};
use procura_core::mandate::{IssueRequest, MandateManager, intent_hash};
use procura_core::pipeline::{
    Consumer, ConsumerConfig, EventBus, GROUP_LEDGER_WRITER, InMemoryBus, LedgerWriterHandler,
    TOPIC_DECISIONS,
};
use procura_core::policy::AuthorityPolicy;
use procura_core::principal::Principal;
use procura_core::scope::ResourcePattern;
use procura_core::store::SqliteStore;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    store: Arc<SqliteStore>,
    manager: MandateManager,
    evaluator: AuthorityEvaluator,
    bus: Arc<InMemoryBus>,
    writer: Arc<LedgerWriter>,
    issuer: Uuid,
    subject: Uuid,
    _lock_dir: TempDir,
}

fn pat(s: &str) -> ResourcePattern {
    ResourcePattern::parse(s).unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let keys = Arc::new(KeyManager::in_memory());
    let bus = Arc::new(InMemoryBus::new(2));
    let caches = Arc::new(EvaluatorCaches::default());
    let lock_dir = TempDir::new().unwrap();

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
        Arc::clone(&store),
        caches,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        EvaluatorConfig::default(),
    );
    let writer = Arc::new(LedgerWriter::open(Arc::clone(&store), 0, lock_dir.path()).unwrap());

    Harness {
        store,
        manager,
        evaluator,
        bus,
        writer,
        issuer,
        subject,
        _lock_dir: lock_dir,
    }
}

/// Drains the decision topic into the ledger via the ledger-writer
/// consumer group.
fn drain_decisions(h: &Harness) {
    let handler = Arc::new(LedgerWriterHandler::new(Arc::clone(&h.writer)));
    for partition in 0..h.bus.partition_count(TOPIC_DECISIONS) {
        let consumer = Consumer::new(
            Arc::clone(&h.bus) as Arc<dyn EventBus>,
            Arc::clone(&handler) as _,
            ConsumerConfig::new(GROUP_LEDGER_WRITER, TOPIC_DECISIONS, partition).without_backoff(),
        );
        consumer.run_until_caught_up().unwrap();
    }
}

fn issue(h: &Harness) -> procura_core::Mandate {
    h.manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
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

fn request(mandate_id: Uuid, resource: &str) -> EvaluationRequest {
    EvaluationRequest {
        mandate_id,
        requested_action: "call".to_string(),
        requested_resource: resource.to_string(),
        intent_claim: None,
        correlation_id: Some("flow-test".to_string()),
    }
}

#[test]
fn issue_evaluate_allow_lands_in_ledger() {
    let h = harness();
    let mandate = issue(&h);

    let decision = h
        .evaluator
        .evaluate_at(&request(mandate.mandate_id, "api:openai:gpt-4"), 2_000);
    assert!(decision.allowed);
    assert_eq!(decision.reason, DecisionReason::Allow);

    drain_decisions(&h);

    let events = h.store.read_events_from(0, 1, 100).unwrap();
    let allow = events
        .iter()
        .find(|e| e.body.kind == EventKind::DecisionAllow)
        .expect("decision_allow event present");
    assert_eq!(allow.body.mandate_id, Some(mandate.mandate_id));
    assert_eq!(allow.body.action.as_deref(), Some("call"));
    assert_eq!(allow.body.resource.as_deref(), Some("api:openai:gpt-4"));
    assert_eq!(allow.body.correlation_id.as_deref(), Some("flow-test"));
}

#[test]
fn out_of_scope_deny_lands_in_ledger() {
    let h = harness();
    let mandate = issue(&h);

    let decision = h
        .evaluator
        .evaluate_at(&request(mandate.mandate_id, "api:anthropic:claude"), 2_000);
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::OutOfScope);

    drain_decisions(&h);

    let events = h.store.read_events_from(0, 1, 100).unwrap();
    let deny = events
        .iter()
        .find(|e| e.body.kind == EventKind::DecisionDeny)
        .expect("decision_deny event present");
    assert_eq!(deny.body.mandate_id, Some(mandate.mandate_id));
    assert_eq!(deny.body.metadata["reason"], "OutOfScope");
}

#[test]
fn intent_binding_round_trip() {
    let h = harness();
    let claim = json!({"op": "transfer", "amount": 100});
    let mandate = h
        .manager
        .issue_mandate_at(
            &IssueRequest {
                issuer_id: h.issuer,
                subject_id: h.subject,
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

    let mut matching = request(mandate.mandate_id, "api:openai:gpt-4");
    matching.intent_claim = Some(json!({"op": "transfer", "amount": 100}));
    assert!(h.evaluator.evaluate_at(&matching, 2_000).allowed);

    let mut mismatched = matching.clone();
    mismatched.intent_claim = Some(json!({"op": "transfer", "amount": 101}));
    let decision = h.evaluator.evaluate_at(&mismatched, 2_000);
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::IntentMismatch);
}

#[test]
fn duplicate_decision_delivery_is_single_ledger_row() {
    let h = harness();
    let mandate = issue(&h);
    h.evaluator
        .evaluate_at(&request(mandate.mandate_id, "api:openai:gpt-4"), 2_000);

    // First drain writes the row; a second drain from offset zero (a
    // group that lost its offsets) must not produce a second row.
    drain_decisions(&h);
    let handler = Arc::new(LedgerWriterHandler::new(Arc::clone(&h.writer)));
    for partition in 0..h.bus.partition_count(TOPIC_DECISIONS) {
        let consumer = Consumer::new(
            Arc::clone(&h.bus) as Arc<dyn EventBus>,
            Arc::clone(&handler) as _,
            ConsumerConfig::new("ledger-writer-rewound", TOPIC_DECISIONS, partition)
                .without_backoff(),
        );
        consumer.run_until_caught_up().unwrap();
    }

    let decision_rows = h
        .store
        .read_events_from(0, 1, 100)
        .unwrap()
        .into_iter()
        .filter(|e| e.body.kind == EventKind::DecisionAllow)
        .count();
    assert_eq!(decision_rows, 1);
}
