//! Procura core: pre-execution authority enforcement for automated agents.
//!
//! Before an agent performs an irreversible action, the authority
//! evaluator decides whether a cryptographically signed, time-bounded
//! *mandate* authorizes that specific `(action, resource)` pair, and the
//! decision lands in an append-only audit ledger whose integrity is
//! provable through signed Merkle commitments.
//!
//! # Architecture
//!
//! ```text
//! proxy / tool adapter (external)
//!         │ evaluate(mandate, action, resource)
//!         ▼
//! ┌──────────────────┐   chain + policy    ┌────────────────┐
//! │ AuthorityEvaluator│◄───caches──────────│  SqliteStore   │
//! └───────┬──────────┘                     └──▲─────────▲───┘
//!         │ decision events                   │         │
//!         ▼                                   │         │
//!    message bus ──► ledger-writer consumer ──┘   MerkleAggregator
//!         │          (sole ledger append path)     (signed batches)
//!         ├────────► aggregator-metrics (spending cache, trends)
//!         └────────► audit-logger (JSONL mirror)
//! ```
//!
//! Mandate lifecycle (issue / delegate / revoke with cascade) runs through
//! [`mandate::MandateManager`]; replay and recovery rebuild derived state
//! from the ledger and re-verify every sealed batch before consumers
//! resume.
//!
//! # Error handling
//!
//! Every module exposes a typed error enum. The evaluator is fail-closed:
//! internal failures become denials with reason `InternalError` and are
//! still audited. The ledger writer is fail-loud: a failed append always
//! propagates. Consumers are at-least-once with bounded retry before the
//! dead-letter topic.

pub mod audit;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod evaluator;
pub mod ledger;
pub mod mandate;
pub mod merkle;
pub mod pipeline;
pub mod policy;
pub mod pricebook;
pub mod principal;
pub mod replay;
pub mod scope;
pub mod spending;
pub mod store;

pub use audit::AuditExporter;
pub use config::CoreConfig;
pub use evaluator::{AuthorityEvaluator, Decision, DecisionReason, EvaluationRequest};
pub use ledger::{EventBody, EventKind, LedgerEvent, LedgerWriter};
pub use mandate::{IssueRequest, Mandate, MandateManager, RevokeRequest};
pub use merkle::{InclusionProof, MerkleAggregator, SealedBatch};
pub use pipeline::{Consumer, EventBus, InMemoryBus};
pub use policy::AuthorityPolicy;
pub use pricebook::Pricebook;
pub use principal::Principal;
pub use replay::{ReplayManager, ReplayStart};
pub use spending::{SpendingCache, SpendingTracker};
pub use store::SqliteStore;
