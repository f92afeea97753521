//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the shared health store.
//! - Apply schema migrations in deterministic order.
//! - Classify SQLite failures so the bootstrapper can pick a recovery step.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Core code must not read/write records before migrations succeed.

use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory, quick_check, OpenOptions};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// One registered migration failed to apply.
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// `PRAGMA quick_check` reported something other than `ok`.
    IntegrityCheckFailed(String),
}

impl DbError {
    /// Returns whether this failure means the file content cannot be trusted.
    ///
    /// A schema version newer than this binary understands is treated the same
    /// way: the local file is a disposable cache of the remote store.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => is_corruption_code(err),
            Self::UnsupportedSchemaVersion { .. } => true,
            Self::IntegrityCheckFailed(_) => true,
        }
    }

    pub fn is_migration_failure(&self) -> bool {
        matches!(self, Self::Migration { .. })
    }
}

fn is_corruption_code(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Migration { version, source } => {
                write!(f, "schema migration {version} failed: {source}")
            }
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::IntegrityCheckFailed(detail) => {
                write!(f, "database integrity check failed: {detail}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Migration { source, .. } => Some(source),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::IntegrityCheckFailed(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
