//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service/sync orchestration.
//!
//! # Invariants
//! - Repository writes must enforce `Record::validate()` before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `OwnerMismatch`) in
//!   addition to DB transport errors.

pub mod record_repo;
