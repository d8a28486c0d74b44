//! Durable store for principals, policies, mandates, ledger events, Merkle
//! batches, snapshots and consumer offsets.
//!
//! `SQLite` with WAL mode backs everything. All writes that touch more than
//! one table (issue mandate + ledger event, seal batch + backfill
//! `batch_id`) execute in one transaction. Retries for transient I/O are the
//! caller's responsibility.

mod sqlite;

pub use sqlite::{EventFilter, SqliteStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::CanonicalJsonError;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// Unique-constraint violation (duplicate id, duplicate producer_seq,
    /// second active policy).
    #[error("conflict: {detail}")]
    Conflict {
        /// What collided.
        detail: String,
    },

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier that missed.
        id: String,
    },

    /// Foreign-key or other referential violation.
    #[error("integrity violation: {detail}")]
    Integrity {
        /// Description of the violation.
        detail: String,
    },

    /// A stored record failed to deserialize.
    #[error("corrupt record: {detail}")]
    CorruptRecord {
        /// Description of the corruption.
        detail: String,
    },

    /// JSON (de)serialization failure for embedded blobs.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Canonicalization failure while hashing event content.
    #[error("canonical form: {0}")]
    Canonical(#[from] CanonicalJsonError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        if let rusqlite::Error::SqliteFailure(ffi_err, message) = &err {
            if ffi_err.code == ErrorCode::ConstraintViolation {
                let detail = message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string());
                // UNIQUE and PRIMARY KEY violations surface as conflicts the
                // caller may treat as benign (dedupe); FK violations are
                // integrity bugs.
                const SQLITE_CONSTRAINT_FOREIGNKEY: std::ffi::c_int = 787;
                if ffi_err.extended_code == SQLITE_CONSTRAINT_FOREIGNKEY {
                    return Self::Integrity { detail };
                }
                return Self::Conflict { detail };
            }
        }
        Self::Database(err)
    }
}

/// Retry schedule for transient I/O, milliseconds between attempts.
pub const TRANSIENT_RETRY_BACKOFF_MS: [u64; 3] = [50, 200, 800];

/// Runs `op`, retrying transient database failures with the standard
/// exponential schedule (3 retries at 50/200/800 ms). Typed failures
/// (`Conflict`, `NotFound`, `Integrity`, corrupt records) are never
/// retried: they are deterministic.
///
/// # Errors
///
/// The last error once the schedule is exhausted.
pub fn retry_transient<T>(
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ StoreError::Database(_))
                if attempt < TRANSIENT_RETRY_BACKOFF_MS.len() =>
            {
                tracing::warn!(attempt = attempt + 1, error = %err, "transient store failure");
                std::thread::sleep(std::time::Duration::from_millis(
                    TRANSIENT_RETRY_BACKOFF_MS[attempt],
                ));
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}

/// A point-in-time materialization of derived state, used to bound
/// recovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Assigned by the store on insert; 0 before insertion.
    pub snapshot_id: i64,

    /// Partition the snapshot covers.
    pub partition: i32,

    /// Highest ledger event id folded into the snapshot state.
    pub as_of_event_id: i64,

    /// Creation time, milliseconds since epoch.
    pub created_ms: i64,

    /// Derived state: spending totals and active-mandate index, as JSON.
    pub state: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StoreError {
        StoreError::Database(rusqlite::Error::InvalidQuery)
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let mut failures_left = 2;
        let result = retry_transient(|| {
            if failures_left > 0 {
                failures_left -= 1;
                Err(transient())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retry_gives_up_after_schedule() {
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(|| {
            calls += 1;
            Err(transient())
        });
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(calls, TRANSIENT_RETRY_BACKOFF_MS.len() + 1);
    }

    #[test]
    fn typed_errors_never_retry() {
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(|| {
            calls += 1;
            Err(StoreError::NotFound {
                entity: "mandate",
                id: "x".to_string(),
            })
        });
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls, 1);
    }
}
