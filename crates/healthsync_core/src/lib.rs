//! Offline-first shared storage and cloud sync for the health app.
//!
//! One SQLite store lives in a container shared by the primary app and its
//! memory-constrained extensions. Each process builds a single
//! [`StoreHandle`] at startup and hands it to the services below.

pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, StoreConfig};
pub use context::{CredentialStore, FileSharedContext, ProcessContext, SharedContext};
pub use error::{StoreError, StoreResult};
pub use health::memory::{FixedMemoryProbe, MemoryBudget, MemoryProbe, ProcessMemoryProbe};
pub use health::monitor::{HealthClass, HealthMonitor, HealthReport};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::record::{
    CaregiverTask, ConflictAnalysis, ConflictFinding, ConflictSeverity, DietEntry, Doctor,
    Medication, Record, RecordBody, RecordKey, RecordKind, Supplement, SyncState, UserProfile,
};
pub use model::schedule::ScheduleSlot;
pub use model::snapshot::Snapshot;
pub use service::accessor::{CombinedSnapshot, FetchOptions, SharedStoreAccessor};
pub use service::mutation_service::{MutationService, SlotCompletion};
pub use store::{Availability, StoreHandle, StoreStatus};
pub use sync::engine::{PullReport, ReconcileReport, ReconciliationEngine, SyncFailure};
pub use sync::remote::{InMemoryRemote, PushAck, RemoteRecord, RemoteStore};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
