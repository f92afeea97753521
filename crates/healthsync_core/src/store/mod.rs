//! Shared store lifecycle: bootstrap, recovery and per-process access.
//!
//! Each process (primary app or memory-constrained secondary) builds exactly
//! one [`StoreHandle`] at startup and passes it to its dependents. Processes
//! never share in-memory state; they meet only at the store file, and SQLite
//! WAL provides eventual cross-process visibility.

pub mod bootstrap;
pub mod handle;

pub use bootstrap::{Availability, BootstrapOutcome, RecoveryStep, StoreBootstrapper, StoreStatus};
pub use handle::StoreHandle;
