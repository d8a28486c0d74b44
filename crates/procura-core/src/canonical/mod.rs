//! Canonical JSON serialization for signed payloads.
//!
//! Every byte string that gets signed or hashed in this crate (mandate
//! canonical forms, ledger event content, intent claims) is produced by this
//! module. The profile is JCS (RFC 8785) restricted further for determinism:
//!
//! - **Integer-only numbers**: floats are rejected. Costs are minor units,
//!   timestamps are milliseconds; both fit in `i64`.
//! - **No duplicate keys**: objects with repeated keys are rejected.
//! - **UTF-8 NFC normalized strings**: non-NFC strings are rejected.
//! - **Deterministic key ordering**: object keys sorted in byte order.
//! - **Maximum depth**: structures nested deeper than 64 levels are rejected.
//!
//! Two syntactically different inputs that denote the same record therefore
//! produce identical canonical bytes, which the signature dedupe tests
//! assert as exact equality.

mod json;

pub use json::{
    CANONICAL_PROFILE_ID, CanonicalJsonError, MAX_DEPTH, canonical_bytes, canonicalize,
    parse_strict,
};
