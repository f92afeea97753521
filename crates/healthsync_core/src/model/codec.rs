//! Versioned JSON payload codec for record bodies.
//!
//! # Responsibility
//! - Encode kind bodies into the `records.payload` column.
//! - Decode one stored payload into a typed body, or report why not.
//!
//! # Invariants
//! - Unknown extra fields are ignored; optional fields default when missing.
//! - Missing required fields fail only the row being decoded.

use super::record::{
    CaregiverTask, ConflictFinding, DietEntry, Doctor, Medication, RecordBody, RecordKind,
    Supplement, UserProfile,
};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Payload layout version written by this binary.
pub const CURRENT_PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnsupportedVersion(u32),
    Malformed { kind: RecordKind, message: String },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported payload version {version}")
            }
            Self::Malformed { kind, message } => {
                write!(f, "malformed {kind} payload: {message}")
            }
        }
    }
}

impl Error for DecodeError {}

/// Serializes a body into its payload JSON.
pub fn encode_body(body: &RecordBody) -> Result<String, serde_json::Error> {
    match body {
        RecordBody::Medication(inner) => serde_json::to_string(inner),
        RecordBody::Supplement(inner) => serde_json::to_string(inner),
        RecordBody::Doctor(inner) => serde_json::to_string(inner),
        RecordBody::DietEntry(inner) => serde_json::to_string(inner),
        RecordBody::ConflictFinding(inner) => serde_json::to_string(inner),
        RecordBody::UserProfile(inner) => serde_json::to_string(inner),
        RecordBody::CaregiverTask(inner) => serde_json::to_string(inner),
    }
}

/// Decodes one stored payload for `kind`.
pub fn decode_body(kind: RecordKind, version: u32, payload: &str) -> Result<RecordBody, DecodeError> {
    if version != CURRENT_PAYLOAD_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let malformed = |err: serde_json::Error| DecodeError::Malformed {
        kind,
        message: err.to_string(),
    };

    let body = match kind {
        RecordKind::Medication => {
            RecordBody::Medication(serde_json::from_str::<Medication>(payload).map_err(malformed)?)
        }
        RecordKind::Supplement => {
            RecordBody::Supplement(serde_json::from_str::<Supplement>(payload).map_err(malformed)?)
        }
        RecordKind::Doctor => {
            RecordBody::Doctor(serde_json::from_str::<Doctor>(payload).map_err(malformed)?)
        }
        RecordKind::DietEntry => {
            RecordBody::DietEntry(serde_json::from_str::<DietEntry>(payload).map_err(malformed)?)
        }
        RecordKind::ConflictFinding => RecordBody::ConflictFinding(
            serde_json::from_str::<ConflictFinding>(payload).map_err(malformed)?,
        ),
        RecordKind::UserProfile => RecordBody::UserProfile(
            serde_json::from_str::<UserProfile>(payload).map_err(malformed)?,
        ),
        RecordKind::CaregiverTask => RecordBody::CaregiverTask(
            serde_json::from_str::<CaregiverTask>(payload).map_err(malformed)?,
        ),
    };
    Ok(body)
}
