//! Authority policies: the ceiling on what a principal may authorize.
//!
//! Exactly one policy per principal is active at a time; activating a new
//! version deactivates the prior one in the same transaction, and prior
//! versions are retained as history for audit.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scope::ResourcePattern;

/// Maximum number of resource patterns in a policy.
pub const MAX_POLICY_RESOURCES: usize = 64;

/// Maximum number of action names in a policy.
pub const MAX_POLICY_ACTIONS: usize = 64;

/// Maximum length of an action name.
pub const MAX_ACTION_LENGTH: usize = 64;

/// Upper bound on delegation depth any policy may allow.
pub const MAX_DELEGATION_DEPTH: u32 = 16;

/// Validation errors for policy records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Resource set empty or too large.
    #[error("policy must carry 1..={MAX_POLICY_RESOURCES} resource patterns, got {count}")]
    InvalidResourceCount {
        /// Actual pattern count.
        count: usize,
    },

    /// Action set empty or too large.
    #[error("policy must carry 1..={MAX_POLICY_ACTIONS} actions, got {count}")]
    InvalidActionCount {
        /// Actual action count.
        count: usize,
    },

    /// An action name is empty, too long, or not lowercase word characters.
    #[error("invalid action name: '{action}'")]
    InvalidAction {
        /// The rejected action name.
        action: String,
    },

    /// Maximum validity must be positive.
    #[error("max_validity_ms must be positive, got {value}")]
    NonPositiveValidity {
        /// The rejected value.
        value: i64,
    },

    /// Delegation depth beyond the system bound.
    #[error("max_delegation_depth {value} exceeds system bound {MAX_DELEGATION_DEPTH}")]
    DepthBeyondBound {
        /// The rejected depth.
        value: u32,
    },
}

/// A principal's authority ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityPolicy {
    /// Stable identifier of this policy version.
    pub policy_id: Uuid,

    /// The principal this policy governs.
    pub principal_id: Uuid,

    /// Resource patterns the principal may issue mandates for.
    pub resources: Vec<ResourcePattern>,

    /// Action names the principal may issue mandates for.
    pub actions: Vec<String>,

    /// Longest validity window the principal may grant, in milliseconds.
    pub max_validity_ms: i64,

    /// Deepest delegation chain the principal may anchor.
    pub max_delegation_depth: u32,

    /// Whether mandates issued under this policy may be delegated.
    pub allow_delegation: bool,

    /// Whether this version is the active one.
    pub active: bool,

    /// Monotonic version number within the principal's policy history.
    pub version: u32,

    /// Creation time, milliseconds since epoch.
    pub created_ms: i64,
}

impl AuthorityPolicy {
    /// Validates field bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violation found (fail-closed).
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.resources.is_empty() || self.resources.len() > MAX_POLICY_RESOURCES {
            return Err(PolicyError::InvalidResourceCount {
                count: self.resources.len(),
            });
        }
        if self.actions.is_empty() || self.actions.len() > MAX_POLICY_ACTIONS {
            return Err(PolicyError::InvalidActionCount {
                count: self.actions.len(),
            });
        }
        for action in &self.actions {
            validate_action_name(action)?;
        }
        if self.max_validity_ms <= 0 {
            return Err(PolicyError::NonPositiveValidity {
                value: self.max_validity_ms,
            });
        }
        if self.max_delegation_depth > MAX_DELEGATION_DEPTH {
            return Err(PolicyError::DepthBeyondBound {
                value: self.max_delegation_depth,
            });
        }
        Ok(())
    }

    /// Tests whether an action name is permitted by this policy.
    #[must_use]
    pub fn permits_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// Validates an action name: non-empty, bounded, `[a-z0-9_.-]`.
///
/// # Errors
///
/// Returns `InvalidAction` on violation.
pub fn validate_action_name(action: &str) -> Result<(), PolicyError> {
    let valid = !action.is_empty()
        && action.len() <= MAX_ACTION_LENGTH
        && action
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(PolicyError::InvalidAction {
            action: action.to_string(),
        })
    }
}
