//! Store-level error taxonomy surfaced to callers.
//!
//! # Invariants
//! - Store failures are returned as values; nothing in this crate panics on a
//!   storage error.
//! - Per-record decode and remote failures are aggregated by their callers and
//!   only appear here when a single-record operation hits them.

use crate::db::DbError;
use crate::model::record::RecordKey;
use crate::repo::record_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Neutral text for end-user-facing callers.
pub const NO_DATA_MESSAGE: &str = "No data available.";

#[derive(Debug)]
pub enum StoreError {
    /// The bootstrapper has not produced a usable store.
    StoreUnavailable(String),
    ValidationFailed(String),
    RecordNotFound(RecordKey),
    MemoryLimitExceeded {
        resident_bytes: u64,
        ceiling_bytes: u64,
    },
    DecodeFailed {
        key: RecordKey,
        reason: String,
    },
    RemoteSyncFailed {
        key: RecordKey,
        reason: String,
    },
    /// SQLite reported a corrupt file; the next `initialize` resets the store.
    CorruptionDetected(String),
    Db(DbError),
}

impl StoreError {
    /// Message safe to show to an end user. Never includes internal detail.
    pub fn user_facing(&self) -> &'static str {
        NO_DATA_MESSAGE
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreUnavailable(reason) => write!(f, "store unavailable: {reason}"),
            Self::ValidationFailed(reason) => write!(f, "validation failed: {reason}"),
            Self::RecordNotFound(key) => write!(f, "record not found: {key}"),
            Self::MemoryLimitExceeded {
                resident_bytes,
                ceiling_bytes,
            } => write!(
                f,
                "resident memory {resident_bytes} bytes exceeds ceiling {ceiling_bytes} bytes"
            ),
            Self::DecodeFailed { key, reason } => write!(f, "record {key} decode failed: {reason}"),
            Self::RemoteSyncFailed { key, reason } => {
                write!(f, "remote sync failed for {key}: {reason}")
            }
            Self::CorruptionDetected(detail) => write!(f, "store corruption detected: {detail}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        if value.is_corruption() {
            Self::CorruptionDetected(value.to_string())
        } else {
            Self::Db(value)
        }
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::ValidationFailed(err.to_string()),
            RepoError::Db(err) => err.into(),
            RepoError::NotFound(key) => Self::RecordNotFound(key),
            RepoError::OwnerMismatch(key) => {
                Self::ValidationFailed(format!("owner of record {key} cannot change"))
            }
            RepoError::Decode { key, error } => Self::DecodeFailed {
                key,
                reason: error.to_string(),
            },
            RepoError::Encode(message) => Self::ValidationFailed(message),
        }
    }
}
