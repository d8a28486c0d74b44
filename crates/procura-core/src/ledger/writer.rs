//! Single-writer ledger append path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use thiserror::Error;
use tracing::{info, warn};

use super::event::{EventBody, EventBodyError, EventKind, LedgerEvent};
use crate::clock::now_ms;
use crate::merkle::MerkleAggregator;
use crate::spending::SpendingCache;
use crate::store::{SqliteStore, StoreError};

/// Errors from the ledger writer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerWriteError {
    /// Event body failed validation.
    #[error("invalid event body: {0}")]
    InvalidBody(#[from] EventBodyError),

    /// Store failure. Appends are fail-loud: this always propagates.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Another writer holds the partition lock.
    #[error("partition {partition} is locked by another writer ({path})")]
    LockHeld {
        /// The contended partition.
        partition: i32,
        /// Lock file path.
        path: String,
    },

    /// I/O failure acquiring the partition lock.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusive advisory lock on a partition, held for the lifetime of the
/// owning writer (normally the process lifetime).
#[derive(Debug)]
pub struct PartitionLock {
    file: File,
    path: PathBuf,
}

impl PartitionLock {
    /// Acquires the lock for `partition`, creating the lock file under
    /// `lock_dir` if needed. Does not block: a held lock is an error so
    /// the would-be writer can decide to wait or exit.
    ///
    /// # Errors
    ///
    /// `LockHeld` if another process owns the partition, or an I/O error.
    pub fn acquire(lock_dir: impl AsRef<Path>, partition: i32) -> Result<Self, LedgerWriteError> {
        let lock_dir = lock_dir.as_ref();
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("partition-{partition}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(LedgerWriteError::LockHeld {
                partition,
                path: path.display().to_string(),
            });
        }
        Ok(Self { file, path })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PartitionLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Appends signed-off events to one ledger partition.
///
/// The advisory lock acquired at open time enforces the single-writer
/// discipline that makes dense monotonic ids possible without a
/// contention point. Appends are durable before they return (the store
/// runs `synchronous=FULL`); the spending-cache update and aggregator
/// notification that follow are best-effort and recovered elsewhere.
pub struct LedgerWriter {
    store: Arc<SqliteStore>,
    partition: i32,
    _lock: PartitionLock,
    spending: Option<Arc<SpendingCache>>,
    aggregator: Option<Arc<MerkleAggregator>>,
}

impl LedgerWriter {
    /// Opens the writer for `partition`, acquiring its advisory lock.
    ///
    /// # Errors
    ///
    /// `LockHeld` if another writer owns the partition.
    pub fn open(
        store: Arc<SqliteStore>,
        partition: i32,
        lock_dir: impl AsRef<Path>,
    ) -> Result<Self, LedgerWriteError> {
        let lock = PartitionLock::acquire(lock_dir, partition)?;
        info!(partition, lock = %lock.path().display(), "ledger writer acquired partition lock");
        Ok(Self {
            store,
            partition,
            _lock: lock,
            spending: None,
            aggregator: None,
        })
    }

    /// Attaches the spending cache for best-effort updates on metering
    /// appends.
    #[must_use]
    pub fn with_spending_cache(mut self, cache: Arc<SpendingCache>) -> Self {
        self.spending = Some(cache);
        self
    }

    /// Attaches the Merkle aggregator notified after each append.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<MerkleAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Returns the partition this writer owns.
    #[must_use]
    pub const fn partition(&self) -> i32 {
        self.partition
    }

    /// Appends an event and returns the materialized row.
    ///
    /// # Errors
    ///
    /// Fail-loud: validation and store errors always propagate. A spending
    /// cache or aggregator notification failure does not fail the append —
    /// the row is already durable and the aggregator re-pulls it from its
    /// high-water mark on the next catch-up.
    pub fn append(&self, body: &EventBody) -> Result<LedgerEvent, LedgerWriteError> {
        self.append_at(body, now_ms())
    }

    /// Appends with an explicit timestamp (replay and tests).
    ///
    /// # Errors
    ///
    /// Same as [`LedgerWriter::append`].
    pub fn append_at(&self, body: &EventBody, ts_ms: i64) -> Result<LedgerEvent, LedgerWriteError> {
        body.validate()?;
        let event = self.store.append_event(self.partition, body, ts_ms)?;

        if event.body.kind == EventKind::Metering {
            if let Some(spending) = &self.spending {
                spending.record_metering(&event, ts_ms);
            }
        }
        if let Some(aggregator) = &self.aggregator {
            if let Err(error) = aggregator.observe(&event) {
                warn!(
                    partition = self.partition,
                    event_id = event.event_id,
                    %error,
                    "aggregator notification failed; event will be picked up by catch-up"
                );
            }
        }
        Ok(event)
    }
}
