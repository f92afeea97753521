//! Domain model for health records.
//!
//! # Responsibility
//! - Define the record envelope, kind bodies and schedule slots.
//! - Define the versioned payload codec and reader snapshots.
//!
//! # Invariants
//! - Every record is identified by `(kind, id)` and owned by one account.
//! - Deletion is represented by soft-delete tombstones, not hard delete.

pub mod codec;
pub mod record;
pub mod schedule;
pub mod snapshot;
