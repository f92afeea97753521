//! Cloud synchronization for locally pending records.
//!
//! `engine` owns the push/pull passes; `remote` is the seam to the cloud
//! database, with an in-memory implementation for tests and demos.

pub mod engine;
pub mod remote;
