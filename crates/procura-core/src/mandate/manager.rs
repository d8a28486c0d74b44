//! Mandate lifecycle operations: issue, delegate, revoke.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::{MAX_REVOCATION_REASON_LENGTH, Mandate, MandateError, RevocationState};
use crate::clock::now_ms;
use crate::crypto::{Hash, KeyManager, KeyManagerError};
use crate::ledger::{EventBody, EventKind};
use crate::merkle::MerkleAggregator;
use crate::policy::{AuthorityPolicy, PolicyError};
use crate::scope::{ResourcePattern, scope_is_subset};
use crate::store::{SqliteStore, StoreError};

/// Errors from mandate lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MandateOpError {
    /// Issuer has no active policy.
    #[error("principal {principal_id} has no active authority policy")]
    NoAuthority {
        /// The issuer without a policy.
        principal_id: Uuid,
    },

    /// Requested resource scope exceeds the issuer's policy ceiling.
    #[error("requested resource scope exceeds the issuer's policy")]
    ResourceScopeExceedsPolicy,

    /// Requested action scope exceeds the issuer's policy ceiling.
    #[error("requested action '{action}' is not permitted by the issuer's policy")]
    ActionExceedsPolicy {
        /// The action outside the ceiling.
        action: String,
    },

    /// Requested validity span exceeds the policy maximum.
    #[error("validity span {requested_ms} ms exceeds policy maximum {max_ms} ms")]
    ValidityExceedsPolicy {
        /// Requested span.
        requested_ms: i64,
        /// Policy ceiling.
        max_ms: i64,
    },

    /// Parent mandate not found.
    #[error("parent mandate not found: {parent_mandate_id}")]
    UnknownParent {
        /// The missing parent.
        parent_mandate_id: Uuid,
    },

    /// Parent mandate is revoked.
    #[error("parent mandate {parent_mandate_id} is revoked")]
    ParentRevoked {
        /// The revoked parent.
        parent_mandate_id: Uuid,
    },

    /// Parent mandate is expired at issue time.
    #[error("parent mandate {parent_mandate_id} is expired")]
    ParentExpired {
        /// The expired parent.
        parent_mandate_id: Uuid,
    },

    /// Parent mandate is not yet valid at issue time.
    #[error("parent mandate {parent_mandate_id} is not yet valid")]
    ParentNotYetValid {
        /// The not-yet-valid parent.
        parent_mandate_id: Uuid,
    },

    /// Issuer's policy does not permit delegation.
    #[error("policy of principal {principal_id} does not permit delegation")]
    DelegationNotPermitted {
        /// The issuer whose policy forbids delegation.
        principal_id: Uuid,
    },

    /// Child scope or validity is not a subset of the parent's.
    #[error("delegation must narrow the parent mandate: {detail}")]
    NotNarrowing {
        /// Which dimension widened.
        detail: String,
    },

    /// Delegation depth beyond the policy maximum.
    #[error("delegation depth {depth} exceeds policy maximum {max}")]
    DepthExceeded {
        /// The would-be depth.
        depth: u32,
        /// Policy ceiling.
        max: u32,
    },

    /// Revoker is neither issuer, subject, nor admin.
    #[error("principal {revoker_id} is not authorized to revoke mandate {mandate_id}")]
    NotAuthorized {
        /// The rejected revoker.
        revoker_id: Uuid,
        /// The target mandate.
        mandate_id: Uuid,
    },

    /// Mandate already revoked; revocation is one-shot.
    #[error("mandate {mandate_id} is already revoked")]
    AlreadyRevoked {
        /// The already-revoked mandate.
        mandate_id: Uuid,
    },

    /// Revocation reason too long.
    #[error("revocation reason longer than {MAX_REVOCATION_REASON_LENGTH} bytes")]
    ReasonTooLong,

    /// Signing key unavailable for the issuer.
    #[error("signing key unavailable: {0}")]
    SigningKey(#[from] KeyManagerError),

    /// Structural mandate validation failed.
    #[error(transparent)]
    Mandate(#[from] MandateError),

    /// Policy validation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Receives invalidation signals when authority state changes.
///
/// The evaluator's read-through caches implement this so a revocation or a
/// policy change takes effect ahead of TTL expiry.
pub trait RevocationListener: Send + Sync {
    /// A mandate (or a whole subtree, delivered per mandate) was revoked.
    fn mandate_revoked(&self, mandate_id: Uuid);

    /// A principal's active policy changed.
    fn policy_changed(&self, principal_id: Uuid);
}

/// Result of a revocation, including the cascade fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationOutcome {
    /// Mandates revoked by this call, root of the revocation first.
    pub revoked: Vec<Uuid>,

    /// Descendants that failed to revoke; logged, never aborting the
    /// cascade.
    pub failed: Vec<Uuid>,
}

/// Parameters for issuing (or, with `parent_mandate_id`, delegating) a
/// mandate.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Issuing (signing) principal.
    pub issuer_id: Uuid,

    /// Subject principal; may equal the issuer for root self-grants.
    pub subject_id: Uuid,

    /// Resource scope of the grant.
    pub resources: Vec<ResourcePattern>,

    /// Action scope of the grant.
    pub actions: Vec<String>,

    /// Window start, milliseconds since epoch.
    pub not_before_ms: i64,

    /// Window end, milliseconds since epoch.
    pub not_after_ms: i64,

    /// Optional binding to one declared operation.
    pub intent_hash: Option<Hash>,

    /// Parent mandate when delegating.
    pub parent_mandate_id: Option<Uuid>,

    /// Correlation id threaded into the ledger event.
    pub correlation_id: Option<String>,
}

/// Parameters for revoking a mandate.
#[derive(Debug, Clone)]
pub struct RevokeRequest {
    /// Principal performing the revocation.
    pub revoker_id: Uuid,

    /// Target mandate.
    pub mandate_id: Uuid,

    /// Operator-supplied reason.
    pub reason: String,

    /// Recursively revoke all descendants.
    pub cascade: bool,

    /// The revoker holds an admin capability; bypasses the
    /// issuer-or-subject check.
    pub admin_override: bool,

    /// Correlation id threaded into the ledger events.
    pub correlation_id: Option<String>,
}

/// Manages the mandate lifecycle with full validation.
///
/// Runs in the same process as the partition's ledger writer; mandate and
/// ledger rows for one operation are committed in a single store
/// transaction.
pub struct MandateManager {
    store: Arc<SqliteStore>,
    keys: Arc<KeyManager>,
    partition: i32,
    aggregator: Option<Arc<MerkleAggregator>>,
    listeners: Vec<Arc<dyn RevocationListener>>,
}

impl MandateManager {
    /// Creates a manager writing to `partition`.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, keys: Arc<KeyManager>, partition: i32) -> Self {
        Self {
            store,
            keys,
            partition,
            aggregator: None,
            listeners: Vec::new(),
        }
    }

    /// Attaches the partition's Merkle aggregator.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<MerkleAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Registers an invalidation listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RevocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Issues a mandate (root when `parent_mandate_id` is `None`,
    /// delegation otherwise).
    ///
    /// # Errors
    ///
    /// Any policy, chain or store violation; see [`MandateOpError`].
    pub fn issue_mandate(&self, request: &IssueRequest) -> Result<Mandate, MandateOpError> {
        self.issue_mandate_at(request, now_ms())
    }

    /// Issues with an explicit clock (tests and replay).
    ///
    /// # Errors
    ///
    /// Same as [`MandateManager::issue_mandate`].
    pub fn issue_mandate_at(
        &self,
        request: &IssueRequest,
        now_ms: i64,
    ) -> Result<Mandate, MandateOpError> {
        let policy = self
            .store
            .get_active_policy(request.issuer_id)
            .map_err(|err| match err {
                StoreError::NotFound { .. } => MandateOpError::NoAuthority {
                    principal_id: request.issuer_id,
                },
                other => MandateOpError::Store(other),
            })?;

        // Subject must exist; issuer == subject is a permitted self-grant.
        self.store.get_principal(request.subject_id)?;

        check_against_policy(request, &policy)?;

        let depth = match request.parent_mandate_id {
            None => 0,
            Some(parent_id) => {
                self.check_parent(request, &policy, parent_id, now_ms)?
            },
        };

        let keypair = self.keys.get_keypair(request.issuer_id)?;
        let mut mandate = Mandate {
            mandate_id: Uuid::new_v4(),
            issuer_id: request.issuer_id,
            subject_id: request.subject_id,
            resources: request.resources.clone(),
            actions: request.actions.clone(),
            not_before_ms: request.not_before_ms,
            not_after_ms: request.not_after_ms,
            parent_mandate_id: request.parent_mandate_id,
            depth,
            intent_hash: request.intent_hash,
            signature: Vec::new(),
            created_ms: now_ms,
            revocation: RevocationState::Active,
        };
        mandate.validate()?;
        mandate.signature = keypair.signer().sign(&mandate.signing_bytes()?);

        let kind = if request.parent_mandate_id.is_some() {
            EventKind::Delegate
        } else {
            EventKind::Issue
        };
        let mut body = EventBody::new(request.issuer_id, kind);
        body.mandate_id = Some(mandate.mandate_id);
        body.correlation_id = request.correlation_id.clone();
        body.metadata = json!({
            "subject_id": mandate.subject_id.to_string(),
            "depth": mandate.depth,
            "parent_mandate_id": mandate.parent_mandate_id.map(|id| id.to_string()),
        });

        let event = self
            .store
            .insert_mandate_with_event(&mandate, self.partition, &body, now_ms)?;
        self.notify_aggregator(&event);

        info!(
            mandate_id = %mandate.mandate_id,
            issuer = %mandate.issuer_id,
            subject = %mandate.subject_id,
            depth = mandate.depth,
            kind = %kind,
            "mandate issued"
        );
        Ok(mandate)
    }

    /// Delegates from an existing mandate. Equivalent to
    /// [`MandateManager::issue_mandate`] with `parent_mandate_id` set.
    ///
    /// # Errors
    ///
    /// Same as [`MandateManager::issue_mandate`], plus `UnknownParent` if
    /// the request carries no parent.
    pub fn delegate_mandate(&self, request: &IssueRequest) -> Result<Mandate, MandateOpError> {
        if request.parent_mandate_id.is_none() {
            return Err(MandateOpError::UnknownParent {
                parent_mandate_id: Uuid::nil(),
            });
        }
        self.issue_mandate(request)
    }

    /// Revokes a mandate, optionally cascading to its descendants.
    ///
    /// Cascade semantics: each descendant revocation is its own row and
    /// ledger event; an individual child failure is logged and recorded in
    /// the outcome but does not abort the cascade.
    ///
    /// # Errors
    ///
    /// Authorization and store violations for the *root* revocation only.
    pub fn revoke_mandate(&self, request: &RevokeRequest) -> Result<RevocationOutcome, MandateOpError> {
        self.revoke_mandate_at(request, now_ms())
    }

    /// Revokes with an explicit clock (tests and replay).
    ///
    /// # Errors
    ///
    /// Same as [`MandateManager::revoke_mandate`].
    pub fn revoke_mandate_at(
        &self,
        request: &RevokeRequest,
        now_ms: i64,
    ) -> Result<RevocationOutcome, MandateOpError> {
        if request.reason.len() > MAX_REVOCATION_REASON_LENGTH {
            return Err(MandateOpError::ReasonTooLong);
        }

        let mandate = self.store.get_mandate(request.mandate_id)?;
        if mandate.is_revoked() {
            return Err(MandateOpError::AlreadyRevoked {
                mandate_id: request.mandate_id,
            });
        }

        let authorized = request.admin_override
            || request.revoker_id == mandate.issuer_id
            || request.revoker_id == mandate.subject_id;
        if !authorized {
            return Err(MandateOpError::NotAuthorized {
                revoker_id: request.revoker_id,
                mandate_id: request.mandate_id,
            });
        }

        self.revoke_one(request, request.mandate_id, &request.reason, now_ms)?;
        let mut outcome = RevocationOutcome {
            revoked: vec![request.mandate_id],
            failed: Vec::new(),
        };

        if request.cascade {
            self.cascade_revoke(request, now_ms, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Validates and activates a new policy version, deactivating the
    /// prior active one in the same transaction and invalidating caches.
    ///
    /// # Errors
    ///
    /// Policy validation or store failure.
    pub fn activate_policy(&self, policy: &AuthorityPolicy) -> Result<(), MandateOpError> {
        policy.validate()?;
        self.store.activate_policy(policy)?;
        for listener in &self.listeners {
            listener.policy_changed(policy.principal_id);
        }
        info!(
            principal = %policy.principal_id,
            version = policy.version,
            "authority policy activated"
        );
        Ok(())
    }

    fn check_parent(
        &self,
        request: &IssueRequest,
        policy: &AuthorityPolicy,
        parent_id: Uuid,
        now_ms: i64,
    ) -> Result<u32, MandateOpError> {
        if !policy.allow_delegation {
            return Err(MandateOpError::DelegationNotPermitted {
                principal_id: request.issuer_id,
            });
        }

        let parent = self.store.get_mandate(parent_id).map_err(|err| match err {
            StoreError::NotFound { .. } => MandateOpError::UnknownParent {
                parent_mandate_id: parent_id,
            },
            other => MandateOpError::Store(other),
        })?;

        if parent.is_revoked() {
            return Err(MandateOpError::ParentRevoked {
                parent_mandate_id: parent_id,
            });
        }
        if parent.is_expired(now_ms) {
            return Err(MandateOpError::ParentExpired {
                parent_mandate_id: parent_id,
            });
        }
        if parent.is_not_yet_valid(now_ms) {
            return Err(MandateOpError::ParentNotYetValid {
                parent_mandate_id: parent_id,
            });
        }

        if !scope_is_subset(&request.resources, &parent.resources) {
            return Err(MandateOpError::NotNarrowing {
                detail: "resource scope widens the parent's".to_string(),
            });
        }
        if let Some(action) = request
            .actions
            .iter()
            .find(|a| !parent.actions.contains(*a))
        {
            return Err(MandateOpError::NotNarrowing {
                detail: format!("action '{action}' is outside the parent's scope"),
            });
        }
        if request.not_before_ms < parent.not_before_ms
            || request.not_after_ms > parent.not_after_ms
        {
            return Err(MandateOpError::NotNarrowing {
                detail: "validity window extends beyond the parent's".to_string(),
            });
        }

        let depth = parent.depth + 1;
        if depth > policy.max_delegation_depth {
            return Err(MandateOpError::DepthExceeded {
                depth,
                max: policy.max_delegation_depth,
            });
        }
        Ok(depth)
    }

    fn cascade_revoke(
        &self,
        request: &RevokeRequest,
        now_ms: i64,
        outcome: &mut RevocationOutcome,
    ) -> Result<(), MandateOpError> {
        let mut queue: VecDeque<Uuid> = self
            .store
            .mandate_children(request.mandate_id)?
            .into();
        let cascade_reason = format!("cascade: {}", request.reason);

        while let Some(child_id) = queue.pop_front() {
            match self.store.mandate_children(child_id) {
                Ok(grandchildren) => queue.extend(grandchildren),
                Err(error) => {
                    warn!(mandate_id = %child_id, %error, "failed to list descendants");
                },
            }

            match self.revoke_one(request, child_id, &cascade_reason, now_ms) {
                Ok(()) => outcome.revoked.push(child_id),
                // Already-revoked descendants are fine; the cascade goal
                // (everything revoked) is met for them.
                Err(MandateOpError::Store(StoreError::Conflict { .. })) => {},
                Err(error) => {
                    warn!(mandate_id = %child_id, %error, "cascade revocation failed for child");
                    outcome.failed.push(child_id);
                },
            }
        }
        Ok(())
    }

    fn revoke_one(
        &self,
        request: &RevokeRequest,
        mandate_id: Uuid,
        reason: &str,
        now_ms: i64,
    ) -> Result<(), MandateOpError> {
        let mut body = EventBody::new(request.revoker_id, EventKind::Revoke);
        body.mandate_id = Some(mandate_id);
        body.correlation_id = request.correlation_id.clone();
        body.metadata = json!({
            "reason": reason,
            "cascade_root": request.mandate_id.to_string(),
        });

        let event = self.store.revoke_mandate_with_event(
            mandate_id,
            now_ms,
            reason,
            request.revoker_id,
            self.partition,
            &body,
            now_ms,
        )?;
        self.notify_aggregator(&event);

        for listener in &self.listeners {
            listener.mandate_revoked(mandate_id);
        }
        info!(mandate_id = %mandate_id, revoker = %request.revoker_id, "mandate revoked");
        Ok(())
    }

    fn notify_aggregator(&self, event: &crate::ledger::LedgerEvent) {
        if let Some(aggregator) = &self.aggregator {
            if let Err(error) = aggregator.observe(event) {
                warn!(
                    event_id = event.event_id,
                    %error,
                    "aggregator notification failed; catch-up will recover"
                );
            }
        }
    }
}

fn check_against_policy(
    request: &IssueRequest,
    policy: &AuthorityPolicy,
) -> Result<(), MandateOpError> {
    if !scope_is_subset(&request.resources, &policy.resources) {
        return Err(MandateOpError::ResourceScopeExceedsPolicy);
    }
    if let Some(action) = request
        .actions
        .iter()
        .find(|a| !policy.permits_action(a))
    {
        return Err(MandateOpError::ActionExceedsPolicy {
            action: action.clone(),
        });
    }
    let requested_ms = request.not_after_ms.saturating_sub(request.not_before_ms);
    if requested_ms > policy.max_validity_ms {
        return Err(MandateOpError::ValidityExceedsPolicy {
            requested_ms,
            max_ms: policy.max_validity_ms,
        });
    }
    Ok(())
}
