//! `SQLite`-backed store implementation.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params};
use uuid::Uuid;

use super::{Snapshot, StoreError};
use crate::crypto::{HASH_SIZE, Hash};
use crate::ledger::{EventBody, EventKind, EventOutcome, LedgerEvent};
use crate::mandate::{Mandate, RevocationState};
use crate::merkle::SealedBatch;
use crate::policy::{AuthorityPolicy, MAX_DELEGATION_DEPTH};
use crate::principal::Principal;
use crate::scope::ResourcePattern;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Columns of `ledger_events` in select order, shared by every event query.
const EVENT_COLUMNS: &str = "partition, event_id, ts_ms, principal_id, event_type, mandate_id, \
     action, resource, cost_minor_units, currency, outcome, correlation_id, producer_seq, \
     metadata, content_hash, batch_id";

/// Filter for audit queries over the ledger.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one principal.
    pub principal_id: Option<Uuid>,

    /// Restrict to one event type.
    pub kind: Option<EventKind>,

    /// Restrict to one correlation id.
    pub correlation_id: Option<String>,

    /// Inclusive lower bound on `ts_ms`.
    pub from_ms: Option<i64>,

    /// Exclusive upper bound on `ts_ms`.
    pub to_ms: Option<i64>,

    /// Maximum rows returned (default 1000).
    pub limit: Option<u32>,

    /// Offset for pagination.
    pub offset: u32,
}

/// The durable store.
///
/// A single connection behind a mutex keeps transaction scoping simple; WAL
/// mode still allows independent read-only connections elsewhere.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Principals
    // =========================================================================

    /// Inserts a principal.
    ///
    /// # Errors
    ///
    /// `Conflict` on duplicate id, `Integrity` on a dangling parent link.
    pub fn insert_principal(&self, principal: &Principal) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO principals (principal_id, public_key, display_name, owner, \
             parent_principal_id, created_ms, deactivated_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                principal.principal_id.to_string(),
                principal.public_key,
                principal.display_name,
                principal.owner,
                principal.parent_principal_id.map(|id| id.to_string()),
                principal.created_ms,
                principal.deactivated_ms,
            ],
        )?;
        Ok(())
    }

    /// Loads a principal by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn get_principal(&self, principal_id: Uuid) -> Result<Principal, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT principal_id, public_key, display_name, owner, parent_principal_id, \
             created_ms, deactivated_ms FROM principals WHERE principal_id = ?1",
            params![principal_id.to_string()],
            principal_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "principal",
            id: principal_id.to_string(),
        })
    }

    /// Soft-deactivates a principal (tombstone; never deleted).
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn deactivate_principal(
        &self,
        principal_id: Uuid,
        deactivated_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE principals SET deactivated_ms = ?2 \
             WHERE principal_id = ?1 AND deactivated_ms IS NULL",
            params![principal_id.to_string(), deactivated_ms],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "principal",
                id: principal_id.to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Inserts a new policy version and deactivates the principal's prior
    /// active version in the same transaction.
    ///
    /// # Errors
    ///
    /// `Conflict` on duplicate (principal, version).
    pub fn activate_policy(&self, policy: &AuthorityPolicy) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if policy.active {
            tx.execute(
                "UPDATE policies SET active = 0 WHERE principal_id = ?1 AND active = 1",
                params![policy.principal_id.to_string()],
            )?;
        }
        tx.execute(
            "INSERT INTO policies (policy_id, principal_id, resources, actions, \
             max_validity_ms, max_delegation_depth, allow_delegation, active, version, \
             created_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                policy.policy_id.to_string(),
                policy.principal_id.to_string(),
                serde_json::to_string(&policy.resources)?,
                serde_json::to_string(&policy.actions)?,
                policy.max_validity_ms,
                policy.max_delegation_depth,
                policy.allow_delegation,
                policy.active,
                policy.version,
                policy.created_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Loads the single active policy for a principal.
    ///
    /// # Errors
    ///
    /// `NotFound` if the principal has no active policy.
    pub fn get_active_policy(&self, principal_id: Uuid) -> Result<AuthorityPolicy, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT policy_id, principal_id, resources, actions, max_validity_ms, \
             max_delegation_depth, allow_delegation, active, version, created_ms \
             FROM policies WHERE principal_id = ?1 AND active = 1",
            params![principal_id.to_string()],
            policy_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "active policy",
            id: principal_id.to_string(),
        })
    }

    /// Lists all policy versions for a principal, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn list_policy_versions(
        &self,
        principal_id: Uuid,
    ) -> Result<Vec<AuthorityPolicy>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT policy_id, principal_id, resources, actions, max_validity_ms, \
             max_delegation_depth, allow_delegation, active, version, created_ms \
             FROM policies WHERE principal_id = ?1 ORDER BY version DESC",
        )?;
        let rows = stmt
            .query_map(params![principal_id.to_string()], policy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Mandates
    // =========================================================================

    /// Inserts a mandate and its issue/delegate ledger event in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// `Conflict` on duplicate mandate id, `Integrity` on dangling
    /// issuer/subject/parent references.
    pub fn insert_mandate_with_event(
        &self,
        mandate: &Mandate,
        partition: i32,
        event_body: &EventBody,
        ts_ms: i64,
    ) -> Result<LedgerEvent, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_mandate_tx(&tx, mandate)?;
        let event = append_event_tx(&tx, partition, event_body, ts_ms)?;
        tx.commit()?;
        Ok(event)
    }

    /// Loads a mandate by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn get_mandate(&self, mandate_id: Uuid) -> Result<Mandate, StoreError> {
        let conn = self.conn.lock().unwrap();
        get_mandate_conn(&conn, mandate_id)
    }

    /// Loads a mandate and its ancestors, leaf first, root last.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing link, `CorruptRecord` if the chain exceeds
    /// the system depth bound (which only a corrupted parent cycle can
    /// produce).
    pub fn get_mandate_chain(&self, mandate_id: Uuid) -> Result<Vec<Mandate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut chain = Vec::new();
        let mut cursor = Some(mandate_id);
        while let Some(id) = cursor {
            if chain.len() > MAX_DELEGATION_DEPTH as usize {
                return Err(StoreError::CorruptRecord {
                    detail: format!("mandate chain from {mandate_id} exceeds depth bound"),
                });
            }
            let mandate = get_mandate_conn(&conn, id)?;
            cursor = mandate.parent_mandate_id;
            chain.push(mandate);
        }
        Ok(chain)
    }

    /// Lists direct children of a mandate.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn mandate_children(&self, mandate_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mandate_id FROM mandates WHERE parent_mandate_id = ?1 ORDER BY created_ms",
        )?;
        let rows = stmt
            .query_map(params![mandate_id.to_string()], |row| {
                let text: String = row.get(0)?;
                parse_uuid(0, &text)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Lists mandates held by a subject, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn mandates_for_subject(&self, subject_id: Uuid) -> Result<Vec<Mandate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mandate_id, issuer_id, subject_id, resources, actions, not_before_ms, \
             not_after_ms, parent_mandate_id, depth, intent_hash, signature, created_ms, \
             revoked_ms, revoked_reason, revoked_by \
             FROM mandates WHERE subject_id = ?1 ORDER BY created_ms DESC",
        )?;
        let rows = stmt
            .query_map(params![subject_id.to_string()], mandate_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Marks a mandate revoked and appends the revoke ledger event in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// `NotFound` if the mandate is absent, `Conflict` if it is already
    /// revoked.
    pub fn revoke_mandate_with_event(
        &self,
        mandate_id: Uuid,
        revoked_ms: i64,
        reason: &str,
        revoked_by: Uuid,
        partition: i32,
        event_body: &EventBody,
        ts_ms: i64,
    ) -> Result<LedgerEvent, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM mandates WHERE mandate_id = ?1",
                params![mandate_id.to_string()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::NotFound {
                entity: "mandate",
                id: mandate_id.to_string(),
            });
        }

        let changed = tx.execute(
            "UPDATE mandates SET revoked_ms = ?2, revoked_reason = ?3, revoked_by = ?4 \
             WHERE mandate_id = ?1 AND revoked_ms IS NULL",
            params![
                mandate_id.to_string(),
                revoked_ms,
                reason,
                revoked_by.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                detail: format!("mandate {mandate_id} already revoked"),
            });
        }

        let event = append_event_tx(&tx, partition, event_body, ts_ms)?;
        tx.commit()?;
        Ok(event)
    }

    // =========================================================================
    // Ledger events
    // =========================================================================

    /// Appends an event, allocating the next dense id for the partition.
    ///
    /// # Errors
    ///
    /// `Conflict` on a duplicate `(principal_id, producer_seq)` pair.
    pub fn append_event(
        &self,
        partition: i32,
        body: &EventBody,
        ts_ms: i64,
    ) -> Result<LedgerEvent, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let event = append_event_tx(&tx, partition, body, ts_ms)?;
        tx.commit()?;
        Ok(event)
    }

    /// Loads a single event.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn get_event(&self, partition: i32, event_id: i64) -> Result<LedgerEvent, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM ledger_events \
                 WHERE partition = ?1 AND event_id = ?2"
            ),
            params![partition, event_id],
            event_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "ledger event",
            id: format!("{partition}/{event_id}"),
        })
    }

    /// Reads events with `event_id >= from_id`, ascending, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn read_events_from(
        &self,
        partition: i32,
        from_id: i64,
        limit: u32,
    ) -> Result<Vec<LedgerEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events \
             WHERE partition = ?1 AND event_id >= ?2 ORDER BY event_id ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![partition, from_id, limit], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Reads the inclusive id range `[first, last]`, ascending.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn events_in_range(
        &self,
        partition: i32,
        first_event_id: i64,
        last_event_id: i64,
    ) -> Result<Vec<LedgerEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events \
             WHERE partition = ?1 AND event_id >= ?2 AND event_id <= ?3 ORDER BY event_id ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![partition, first_event_id, last_event_id],
                event_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Highest event id in the partition; 0 when empty.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn max_event_id(&self, partition: i32) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(event_id) FROM ledger_events WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Sums metering costs for a principal over `[from_ms, to_ms)`.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn sum_metering_costs(
        &self,
        principal_id: Uuid,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sum: Option<i64> = conn.query_row(
            "SELECT SUM(cost_minor_units) FROM ledger_events \
             WHERE principal_id = ?1 AND event_type = 'metering' \
             AND ts_ms >= ?2 AND ts_ms < ?3",
            params![principal_id.to_string(), from_ms, to_ms],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0))
    }

    /// Audit query with dynamic filters, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, StoreError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM ledger_events WHERE 1 = 1");
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(principal_id) = filter.principal_id {
            sql.push_str(" AND principal_id = ?");
            values.push(principal_id.to_string().into());
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND event_type = ?");
            values.push(kind.as_str().to_string().into());
        }
        if let Some(correlation_id) = &filter.correlation_id {
            sql.push_str(" AND correlation_id = ?");
            values.push(correlation_id.clone().into());
        }
        if let Some(from_ms) = filter.from_ms {
            sql.push_str(" AND ts_ms >= ?");
            values.push(from_ms.into());
        }
        if let Some(to_ms) = filter.to_ms {
            sql.push_str(" AND ts_ms < ?");
            values.push(to_ms.into());
        }
        sql.push_str(" ORDER BY ts_ms DESC, event_id DESC LIMIT ? OFFSET ?");
        values.push(i64::from(filter.limit.unwrap_or(1000)).into());
        values.push(i64::from(filter.offset).into());

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Merkle batches
    // =========================================================================

    /// Inserts a sealed batch and backfills `batch_id` on the covered
    /// events in one transaction.
    ///
    /// Re-sealing an identical batch is an idempotent no-op; returns
    /// `false` in that case.
    ///
    /// # Errors
    ///
    /// `Conflict` if a batch with the same id but a different range exists.
    pub fn insert_batch(&self, batch: &SealedBatch) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT first_event_id, last_event_id FROM merkle_batches \
                 WHERE partition = ?1 AND batch_id = ?2",
                params![batch.partition, batch.batch_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((first, last)) = existing {
            if first == batch.first_event_id && last == batch.last_event_id {
                return Ok(false);
            }
            return Err(StoreError::Conflict {
                detail: format!(
                    "batch {}/{} already sealed over [{first}, {last}]",
                    batch.partition, batch.batch_id
                ),
            });
        }

        tx.execute(
            "INSERT INTO merkle_batches (batch_id, partition, first_event_id, last_event_id, \
             root_hash, signing_key_id, signature, created_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                batch.batch_id,
                batch.partition,
                batch.first_event_id,
                batch.last_event_id,
                batch.root_hash.as_slice(),
                batch.signing_key_id,
                batch.signature,
                batch.created_ms,
            ],
        )?;
        tx.execute(
            "UPDATE ledger_events SET batch_id = ?1 \
             WHERE partition = ?2 AND event_id >= ?3 AND event_id <= ?4",
            params![
                batch.batch_id,
                batch.partition,
                batch.first_event_id,
                batch.last_event_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Loads a batch.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn get_batch(&self, partition: i32, batch_id: i64) -> Result<SealedBatch, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT batch_id, partition, first_event_id, last_event_id, root_hash, \
             signing_key_id, signature, created_ms FROM merkle_batches \
             WHERE partition = ?1 AND batch_id = ?2",
            params![partition, batch_id],
            batch_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "merkle batch",
            id: format!("{partition}/{batch_id}"),
        })
    }

    /// Latest sealed batch in the partition, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn latest_batch(&self, partition: i32) -> Result<Option<SealedBatch>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT batch_id, partition, first_event_id, last_event_id, root_hash, \
                 signing_key_id, signature, created_ms FROM merkle_batches \
                 WHERE partition = ?1 ORDER BY batch_id DESC LIMIT 1",
                params![partition],
                batch_from_row,
            )
            .optional()?)
    }

    /// The sealed batch whose range covers `event_id`, if sealed yet.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn batch_covering_event(
        &self,
        partition: i32,
        event_id: i64,
    ) -> Result<Option<SealedBatch>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT batch_id, partition, first_event_id, last_event_id, root_hash, \
                 signing_key_id, signature, created_ms FROM merkle_batches \
                 WHERE partition = ?1 AND first_event_id <= ?2 AND last_event_id >= ?2",
                params![partition, event_id],
                batch_from_row,
            )
            .optional()?)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Inserts a snapshot and returns its assigned id.
    ///
    /// # Errors
    ///
    /// Returns a database error on insert failure.
    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshots (partition, as_of_event_id, created_ms, state) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.partition,
                snapshot.as_of_event_id,
                snapshot.created_ms,
                snapshot.state.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest snapshot for a partition, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn latest_snapshot(&self, partition: i32) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT snapshot_id, partition, as_of_event_id, created_ms, state \
                 FROM snapshots WHERE partition = ?1 \
                 ORDER BY as_of_event_id DESC, snapshot_id DESC LIMIT 1",
                params![partition],
                snapshot_from_row,
            )
            .optional()?)
    }

    /// Deletes snapshots beyond the newest `keep_last` for a partition.
    /// Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns a database error on delete failure.
    pub fn prune_snapshots(&self, partition: i32, keep_last: u32) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM snapshots WHERE partition = ?1 AND snapshot_id NOT IN ( \
                 SELECT snapshot_id FROM snapshots WHERE partition = ?1 \
                 ORDER BY as_of_event_id DESC, snapshot_id DESC LIMIT ?2)",
            params![partition, keep_last],
        )?;
        Ok(u32::try_from(deleted).unwrap_or(u32::MAX))
    }

    // =========================================================================
    // Consumer offsets
    // =========================================================================

    /// Commits an offset for a consumer group.
    ///
    /// # Errors
    ///
    /// Returns a database error on write failure.
    pub fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO consumer_offsets (group_name, topic, partition, committed_offset) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(group_name, topic, partition) DO UPDATE SET committed_offset = ?4",
            params![group, topic, partition, offset],
        )?;
        Ok(())
    }

    /// Reads the committed offset for a consumer group, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT committed_offset FROM consumer_offsets \
                 WHERE group_name = ?1 AND topic = ?2 AND partition = ?3",
                params![group, topic, partition],
                |row| row.get(0),
            )
            .optional()?)
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

fn insert_mandate_tx(tx: &Transaction<'_>, mandate: &Mandate) -> Result<(), StoreError> {
    let (revoked_ms, revoked_reason, revoked_by) = match &mandate.revocation {
        RevocationState::Active => (None, None, None),
        RevocationState::Revoked {
            revoked_ms,
            reason,
            revoked_by,
        } => (
            Some(*revoked_ms),
            Some(reason.clone()),
            Some(revoked_by.to_string()),
        ),
    };
    tx.execute(
        "INSERT INTO mandates (mandate_id, issuer_id, subject_id, resources, actions, \
         not_before_ms, not_after_ms, parent_mandate_id, depth, intent_hash, signature, \
         created_ms, revoked_ms, revoked_reason, revoked_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            mandate.mandate_id.to_string(),
            mandate.issuer_id.to_string(),
            mandate.subject_id.to_string(),
            serde_json::to_string(&mandate.resources)?,
            serde_json::to_string(&mandate.actions)?,
            mandate.not_before_ms,
            mandate.not_after_ms,
            mandate.parent_mandate_id.map(|id| id.to_string()),
            mandate.depth,
            mandate.intent_hash.as_ref().map(<[u8; HASH_SIZE]>::as_slice),
            mandate.signature,
            mandate.created_ms,
            revoked_ms,
            revoked_reason,
            revoked_by,
        ],
    )?;
    Ok(())
}

fn append_event_tx(
    tx: &Transaction<'_>,
    partition: i32,
    body: &EventBody,
    ts_ms: i64,
) -> Result<LedgerEvent, StoreError> {
    let next_id: i64 = tx
        .query_row(
            "SELECT next_event_id FROM event_heads WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(1);
    tx.execute(
        "INSERT INTO event_heads (partition, next_event_id) VALUES (?1, ?2) \
         ON CONFLICT(partition) DO UPDATE SET next_event_id = ?2",
        params![partition, next_id + 1],
    )?;

    let mut event = LedgerEvent {
        event_id: next_id,
        partition,
        ts_ms,
        body: body.clone(),
        content_hash: [0u8; HASH_SIZE],
        batch_id: None,
    };
    event.content_hash = event.compute_content_hash()?;

    tx.execute(
        "INSERT INTO ledger_events (partition, event_id, ts_ms, principal_id, event_type, \
         mandate_id, action, resource, cost_minor_units, currency, outcome, correlation_id, \
         producer_seq, metadata, content_hash, batch_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            event.partition,
            event.event_id,
            event.ts_ms,
            event.body.principal_id.to_string(),
            event.body.kind.as_str(),
            event.body.mandate_id.map(|id| id.to_string()),
            event.body.action,
            event.body.resource,
            event.body.cost_minor_units,
            event.body.currency,
            event.body.outcome.map(EventOutcome::as_str),
            event.body.correlation_id,
            event.body.producer_seq,
            event.body.metadata.to_string(),
            event.content_hash.as_slice(),
            event.batch_id,
        ],
    )?;
    Ok(event)
}

fn get_mandate_conn(conn: &Connection, mandate_id: Uuid) -> Result<Mandate, StoreError> {
    conn.query_row(
        "SELECT mandate_id, issuer_id, subject_id, resources, actions, not_before_ms, \
         not_after_ms, parent_mandate_id, depth, intent_hash, signature, created_ms, \
         revoked_ms, revoked_reason, revoked_by FROM mandates WHERE mandate_id = ?1",
        params![mandate_id.to_string()],
        mandate_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "mandate",
        id: mandate_id.to_string(),
    })
}

// =============================================================================
// Row mappers
// =============================================================================

fn corrupt(idx: usize, detail: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("{detail}").into(),
    )
}

fn parse_uuid(idx: usize, text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| corrupt(idx, e))
}

fn parse_opt_uuid(idx: usize, text: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    text.map(|t| parse_uuid(idx, &t)).transpose()
}

fn parse_hash(idx: usize, bytes: Vec<u8>) -> rusqlite::Result<Hash> {
    bytes
        .try_into()
        .map_err(|_| corrupt(idx, "hash must be 32 bytes"))
}

fn principal_from_row(row: &Row<'_>) -> rusqlite::Result<Principal> {
    Ok(Principal {
        principal_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        public_key: row.get(1)?,
        display_name: row.get(2)?,
        owner: row.get(3)?,
        parent_principal_id: parse_opt_uuid(4, row.get(4)?)?,
        created_ms: row.get(5)?,
        deactivated_ms: row.get(6)?,
    })
}

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<AuthorityPolicy> {
    let resources: Vec<ResourcePattern> =
        serde_json::from_str(&row.get::<_, String>(2)?).map_err(|e| corrupt(2, e))?;
    let actions: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| corrupt(3, e))?;
    Ok(AuthorityPolicy {
        policy_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        principal_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        resources,
        actions,
        max_validity_ms: row.get(4)?,
        max_delegation_depth: row.get(5)?,
        allow_delegation: row.get(6)?,
        active: row.get(7)?,
        version: row.get(8)?,
        created_ms: row.get(9)?,
    })
}

fn mandate_from_row(row: &Row<'_>) -> rusqlite::Result<Mandate> {
    let resources: Vec<ResourcePattern> =
        serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| corrupt(3, e))?;
    let actions: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(4)?).map_err(|e| corrupt(4, e))?;
    let intent_hash = row
        .get::<_, Option<Vec<u8>>>(9)?
        .map(|bytes| parse_hash(9, bytes))
        .transpose()?;

    let revoked_ms: Option<i64> = row.get(12)?;
    let revocation = match revoked_ms {
        None => RevocationState::Active,
        Some(revoked_ms) => RevocationState::Revoked {
            revoked_ms,
            reason: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            revoked_by: parse_uuid(14, &row.get::<_, String>(14)?)?,
        },
    };

    Ok(Mandate {
        mandate_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        issuer_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        subject_id: parse_uuid(2, &row.get::<_, String>(2)?)?,
        resources,
        actions,
        not_before_ms: row.get(5)?,
        not_after_ms: row.get(6)?,
        parent_mandate_id: parse_opt_uuid(7, row.get(7)?)?,
        depth: row.get(8)?,
        intent_hash,
        signature: row.get(10)?,
        created_ms: row.get(11)?,
        revocation,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let kind_text: String = row.get(4)?;
    let kind = EventKind::parse(&kind_text)
        .ok_or_else(|| corrupt(4, format!("unknown event type '{kind_text}'")))?;
    let outcome = row
        .get::<_, Option<String>>(10)?
        .map(|text| {
            EventOutcome::parse(&text)
                .ok_or_else(|| corrupt(10, format!("unknown outcome '{text}'")))
        })
        .transpose()?;
    let metadata: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(13)?).map_err(|e| corrupt(13, e))?;

    Ok(LedgerEvent {
        partition: row.get(0)?,
        event_id: row.get(1)?,
        ts_ms: row.get(2)?,
        body: EventBody {
            principal_id: parse_uuid(3, &row.get::<_, String>(3)?)?,
            kind,
            mandate_id: parse_opt_uuid(5, row.get(5)?)?,
            action: row.get(6)?,
            resource: row.get(7)?,
            cost_minor_units: row.get(8)?,
            currency: row.get(9)?,
            outcome,
            correlation_id: row.get(11)?,
            producer_seq: row.get(12)?,
            metadata,
        },
        content_hash: parse_hash(14, row.get(14)?)?,
        batch_id: row.get(15)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<SealedBatch> {
    Ok(SealedBatch {
        batch_id: row.get(0)?,
        partition: row.get(1)?,
        first_event_id: row.get(2)?,
        last_event_id: row.get(3)?,
        root_hash: parse_hash(4, row.get(4)?)?,
        signing_key_id: row.get(5)?,
        signature: row.get(6)?,
        created_ms: row.get(7)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let state: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(4)?).map_err(|e| corrupt(4, e))?;
    Ok(Snapshot {
        snapshot_id: row.get(0)?,
        partition: row.get(1)?,
        as_of_event_id: row.get(2)?,
        created_ms: row.get(3)?,
        state,
    })
}
