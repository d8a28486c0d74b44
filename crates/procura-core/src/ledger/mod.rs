//! Append-only audit ledger.
//!
//! Events carry dense, monotonically increasing ids per partition and are
//! immutable once written. The [`LedgerWriter`] owns a partition through an
//! advisory lock; everything else reads through the store. Tamper evidence
//! comes from the Merkle aggregator, which commits contiguous id ranges
//! under signed roots.

mod event;
mod writer;

pub use event::{
    EventBody, EventBodyError, EventKind, EventOutcome, LedgerEvent, MAX_CORRELATION_ID_LENGTH,
    MAX_METADATA_BYTES,
};
pub use writer::{LedgerWriteError, LedgerWriter, PartitionLock};
