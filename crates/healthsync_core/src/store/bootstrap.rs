//! Store bootstrapper with an ordered recovery ladder.
//!
//! # Responsibility
//! - Open (or create) the store file inside the shared container.
//! - Recover from migration failure and corruption without crashing.
//!
//! # Invariants
//! - `run` never panics and never returns an error; failures are reported
//!   through [`BootstrapOutcome`].
//! - Reset deletes the primary file and its `-wal`/`-shm` side files before
//!   recreating an empty store. The remote database stays authoritative, so
//!   local data loss is accepted.
//! - Ladder order: open, migration retry, reset, fallback.

use crate::config::StoreConfig;
use crate::db::{open_db, quick_check, DbError, DbResult, OpenOptions};
use log::{error, info, warn};
use rusqlite::Connection;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Observable store state for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    Available,
    /// Usable connection, but the last operation hit a store-level error.
    Degraded(String),
    Unavailable(String),
}

impl Display for StoreStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

/// Result of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    Opened,
    MigrationRetried,
    Reset,
    Fallback,
}

impl RecoveryStep {
    fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "open",
            Self::MigrationRetried => "migration_retry",
            Self::Reset => "reset",
            Self::Fallback => "fallback",
        }
    }
}

/// Everything one ladder run produced.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub connection: Option<Connection>,
    pub availability: Availability,
    pub steps: Vec<RecoveryStep>,
    /// The error that triggered recovery, kept even when recovery succeeded.
    pub last_error: Option<String>,
}

impl BootstrapOutcome {
    fn available(connection: Connection, steps: Vec<RecoveryStep>, last_error: Option<String>) -> Self {
        Self {
            connection: Some(connection),
            availability: Availability::Available,
            steps,
            last_error,
        }
    }

    fn fallback(mut steps: Vec<RecoveryStep>, reason: String) -> Self {
        steps.push(RecoveryStep::Fallback);
        Self {
            connection: None,
            availability: Availability::Unavailable(reason.clone()),
            steps,
            last_error: Some(reason),
        }
    }
}

/// Opens the shared store file and runs the recovery ladder.
#[derive(Debug, Clone)]
pub struct StoreBootstrapper {
    container_dir: PathBuf,
    db_path: PathBuf,
    options: OpenOptions,
}

impl StoreBootstrapper {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            container_dir: config.container_dir.clone(),
            db_path: config.db_path(),
            options: OpenOptions {
                busy_timeout: config.busy_timeout(),
            },
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// Primary file followed by its WAL and shared-memory index files.
    pub fn store_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.db_path.clone()];
        for suffix in SIDE_FILE_SUFFIXES {
            let mut name = OsString::from(self.db_path.as_os_str());
            name.push(suffix);
            files.push(PathBuf::from(name));
        }
        files
    }

    /// Runs the ladder. `force_reset` skips straight to the reset step, used
    /// after corruption was detected on a live connection.
    pub fn run(&self, force_reset: bool) -> BootstrapOutcome {
        let started_at = Instant::now();
        let outcome = self.run_ladder(force_reset);
        let steps = outcome
            .steps
            .iter()
            .map(|step| step.as_str())
            .collect::<Vec<_>>()
            .join(",");
        match &outcome.availability {
            Availability::Available => info!(
                "event=store_bootstrap module=store status=ok steps={} duration_ms={}",
                steps,
                started_at.elapsed().as_millis()
            ),
            Availability::Unavailable(reason) => error!(
                "event=store_bootstrap module=store status=unavailable steps={} duration_ms={} error={}",
                steps,
                started_at.elapsed().as_millis(),
                reason
            ),
        }
        outcome
    }

    fn run_ladder(&self, force_reset: bool) -> BootstrapOutcome {
        let mut steps = Vec::new();

        if let Err(err) = std::fs::create_dir_all(&self.container_dir) {
            return BootstrapOutcome::fallback(
                steps,
                format!(
                    "container `{}` is not reachable: {err}",
                    self.container_dir.display()
                ),
            );
        }

        if force_reset {
            return self.reset_and_reopen(steps, "corruption detected on live connection".to_string());
        }

        let first_error = match self.open_verified() {
            Ok(conn) => {
                steps.push(RecoveryStep::Opened);
                return BootstrapOutcome::available(conn, steps, None);
            }
            Err(err) => err,
        };

        match recovery_step_for(&first_error) {
            RecoveryStep::MigrationRetried => {
                warn!(
                    "event=store_bootstrap module=store status=retry step=migration_retry error={}",
                    first_error
                );
                steps.push(RecoveryStep::MigrationRetried);
                match self.open_verified() {
                    Ok(conn) => {
                        BootstrapOutcome::available(conn, steps, Some(first_error.to_string()))
                    }
                    Err(retry_error) => self.reset_and_reopen(steps, retry_error.to_string()),
                }
            }
            RecoveryStep::Reset => self.reset_and_reopen(steps, first_error.to_string()),
            RecoveryStep::Opened | RecoveryStep::Fallback => {
                BootstrapOutcome::fallback(steps, first_error.to_string())
            }
        }
    }

    fn reset_and_reopen(&self, mut steps: Vec<RecoveryStep>, trigger: String) -> BootstrapOutcome {
        warn!(
            "event=store_bootstrap module=store status=reset step=reset trigger={}",
            trigger
        );
        steps.push(RecoveryStep::Reset);

        if let Err(err) = self.delete_store_files() {
            return BootstrapOutcome::fallback(
                steps,
                format!("reset failed to delete store files: {err}; trigger: {trigger}"),
            );
        }

        match self.open_verified() {
            Ok(conn) => BootstrapOutcome::available(conn, steps, Some(trigger)),
            Err(err) => BootstrapOutcome::fallback(
                steps,
                format!("store could not be recreated: {err}; trigger: {trigger}"),
            ),
        }
    }

    fn open_verified(&self) -> DbResult<Connection> {
        let conn = open_db(&self.db_path, &self.options)?;
        quick_check(&conn)?;
        Ok(conn)
    }

    fn delete_store_files(&self) -> io::Result<()> {
        for path in self.store_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Maps an open failure onto the ladder step that handles it.
pub fn recovery_step_for(error: &DbError) -> RecoveryStep {
    if error.is_migration_failure() {
        RecoveryStep::MigrationRetried
    } else if error.is_corruption() {
        RecoveryStep::Reset
    } else {
        RecoveryStep::Fallback
    }
}
