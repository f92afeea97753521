//! Health record domain model.
//!
//! # Responsibility
//! - Define the record envelope shared by every domain kind.
//! - Define kind-specific bodies and their validation rules.
//!
//! # Invariants
//! - `(kind, id)` identifies a record; `owner_id` never changes after creation.
//! - `is_deleted` is a tombstone; the row survives until remote deletion is
//!   confirmed.
//! - Every local mutation leaves `sync_state == SyncState::PendingPush`.

use super::schedule::ScheduleSlot;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Domain record category. Each kind has its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Medication,
    Supplement,
    Doctor,
    DietEntry,
    ConflictFinding,
    UserProfile,
    CaregiverTask,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Medication,
        RecordKind::Supplement,
        RecordKind::Doctor,
        RecordKind::DietEntry,
        RecordKind::ConflictFinding,
        RecordKind::UserProfile,
        RecordKind::CaregiverTask,
    ];

    /// Storage/wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medication => "medication",
            Self::Supplement => "supplement",
            Self::Doctor => "doctor",
            Self::DietEntry => "diet_entry",
            Self::ConflictFinding => "conflict_finding",
            Self::UserProfile => "user_profile",
            Self::CaregiverTask => "caregiver_task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Whether bodies of this kind carry schedule slots.
    pub fn has_schedule(self) -> bool {
        matches!(
            self,
            Self::Medication | Self::Supplement | Self::CaregiverTask
        )
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local synchronization state against the remote database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local row matches the last acknowledged remote version.
    Synced,
    /// Local change not yet acknowledged by the remote store.
    PendingPush,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingPush => "pending_push",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(Self::Synced),
            "pending_push" => Some(Self::PendingPush),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dosage: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub slots: Vec<ScheduleSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supplement {
    pub name: String,
    pub dosage: String,
    #[serde(default)]
    pub slots: Vec<ScheduleSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub name: String,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DietEntry {
    pub description: String,
    #[serde(default)]
    pub calories: Option<u32>,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub consumed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    None,
    Low,
    Moderate,
    High,
    Severe,
}

/// Persisted result of a medication/supplement interaction analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictFinding {
    /// Medication and supplement names that were analyzed together.
    pub items: Vec<String>,
    pub severity: ConflictSeverity,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Analyzer confidence in `0.0..=1.0`.
    pub confidence: f64,
}

/// Analyzer output as received; stored as a `ConflictFinding` record.
pub type ConflictAnalysis = ConflictFinding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaregiverTask {
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub slots: Vec<ScheduleSlot>,
}

/// Kind-specific record content.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Medication(Medication),
    Supplement(Supplement),
    Doctor(Doctor),
    DietEntry(DietEntry),
    ConflictFinding(ConflictFinding),
    UserProfile(UserProfile),
    CaregiverTask(CaregiverTask),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Medication(_) => RecordKind::Medication,
            Self::Supplement(_) => RecordKind::Supplement,
            Self::Doctor(_) => RecordKind::Doctor,
            Self::DietEntry(_) => RecordKind::DietEntry,
            Self::ConflictFinding(_) => RecordKind::ConflictFinding,
            Self::UserProfile(_) => RecordKind::UserProfile,
            Self::CaregiverTask(_) => RecordKind::CaregiverTask,
        }
    }

    /// Human-readable label used for search.
    pub fn display_name(&self) -> String {
        match self {
            Self::Medication(body) => body.name.clone(),
            Self::Supplement(body) => body.name.clone(),
            Self::Doctor(body) => body.name.clone(),
            Self::DietEntry(body) => body.description.clone(),
            Self::ConflictFinding(body) => body.items.join(", "),
            Self::UserProfile(body) => body.display_name.clone(),
            Self::CaregiverTask(body) => body.title.clone(),
        }
    }

    /// Lowercased search key persisted next to the payload.
    pub fn search_text(&self) -> String {
        self.display_name().trim().to_lowercase()
    }

    pub fn slots(&self) -> Option<&[ScheduleSlot]> {
        match self {
            Self::Medication(body) => Some(&body.slots),
            Self::Supplement(body) => Some(&body.slots),
            Self::CaregiverTask(body) => Some(&body.slots),
            _ => None,
        }
    }

    pub fn slots_mut(&mut self) -> Option<&mut Vec<ScheduleSlot>> {
        match self {
            Self::Medication(body) => Some(&mut body.slots),
            Self::Supplement(body) => Some(&mut body.slots),
            Self::CaregiverTask(body) => Some(&mut body.slots),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), RecordValidationError> {
        let kind = self.kind();
        let label_blank = match self {
            Self::ConflictFinding(body) => body.items.iter().all(|item| item.trim().is_empty()),
            _ => self.display_name().trim().is_empty(),
        };
        if label_blank {
            return Err(RecordValidationError::BlankLabel(kind));
        }

        if let Self::ConflictFinding(body) = self {
            if !(0.0..=1.0).contains(&body.confidence) {
                return Err(RecordValidationError::ConfidenceOutOfRange(body.confidence));
            }
        }

        if let Some(slots) = self.slots() {
            if let Some(index) = slots.iter().position(|slot| !slot.is_consistent()) {
                return Err(RecordValidationError::InconsistentSlot(index));
            }
        }

        Ok(())
    }
}

/// Identity of one record within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub id: String,
}

impl RecordKey {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Validation failures for record writes.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValidationError {
    BlankId,
    BlankOwner,
    /// The kind's name/title/description field is blank.
    BlankLabel(RecordKind),
    ConfidenceOutOfRange(f64),
    /// Slot at index has `completed_at_ms` without being completed.
    InconsistentSlot(usize),
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankId => write!(f, "record id must not be blank"),
            Self::BlankOwner => write!(f, "owner id must not be blank"),
            Self::BlankLabel(kind) => write!(f, "{kind} label must not be blank"),
            Self::ConfidenceOutOfRange(value) => {
                write!(f, "confidence {value} is outside 0.0..=1.0")
            }
            Self::InconsistentSlot(index) => {
                write!(f, "schedule slot {index} has a completion time but is not completed")
            }
        }
    }
}

impl Error for RecordValidationError {}

/// Envelope persisted for every domain record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub owner_id: String,
    pub body: RecordBody,
    /// Unix epoch milliseconds of the latest local or applied remote change.
    pub last_modified_ms: i64,
    pub sync_state: SyncState,
    pub is_deleted: bool,
}

impl Record {
    /// Creates a record with a generated stable id.
    pub fn new(owner_id: impl Into<String>, body: RecordBody) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), owner_id, body)
    }

    /// Creates a record with a caller-provided id.
    ///
    /// The record starts as `PendingPush`; the mutation layer stamps
    /// `last_modified_ms` when it is saved.
    pub fn with_id(id: impl Into<String>, owner_id: impl Into<String>, body: RecordBody) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            body,
            last_modified_ms: 0,
            sync_state: SyncState::PendingPush,
            is_deleted: false,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind(), self.id.clone())
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::PendingPush
    }

    /// Checks envelope and body invariants before persistence.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.id.trim().is_empty() {
            return Err(RecordValidationError::BlankId);
        }
        if self.owner_id.trim().is_empty() {
            return Err(RecordValidationError::BlankOwner);
        }
        self.body.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConflictFinding, ConflictSeverity, Doctor, Medication, Record, RecordBody, RecordKind,
        RecordValidationError, SyncState,
    };
    use crate::model::schedule::ScheduleSlot;

    fn medication(name: &str) -> RecordBody {
        RecordBody::Medication(Medication {
            name: name.to_string(),
            dosage: "10mg".to_string(),
            instructions: None,
            slots: vec![],
        })
    }

    #[test]
    fn kind_names_roundtrip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("unknown"), None);
    }

    #[test]
    fn new_record_starts_pending_and_active() {
        let record = Record::new("u1", medication("Aspirin"));
        assert!(!record.id.is_empty());
        assert_eq!(record.sync_state, SyncState::PendingPush);
        assert!(record.is_active());
        assert_eq!(record.kind(), RecordKind::Medication);
    }

    #[test]
    fn validate_rejects_blank_owner_and_label() {
        let record = Record::with_id("m1", "  ", medication("Aspirin"));
        assert_eq!(record.validate(), Err(RecordValidationError::BlankOwner));

        let record = Record::with_id("m1", "u1", medication(" "));
        assert_eq!(
            record.validate(),
            Err(RecordValidationError::BlankLabel(RecordKind::Medication))
        );
    }

    #[test]
    fn validate_rejects_confidence_out_of_range() {
        let body = RecordBody::ConflictFinding(ConflictFinding {
            items: vec!["warfarin".to_string(), "ginkgo".to_string()],
            severity: ConflictSeverity::High,
            findings: vec![],
            recommendations: vec![],
            confidence: 1.5,
        });
        let record = Record::with_id("c1", "u1", body);
        assert_eq!(
            record.validate(),
            Err(RecordValidationError::ConfidenceOutOfRange(1.5))
        );
    }

    #[test]
    fn validate_rejects_completion_time_on_open_slot() {
        let mut slot = ScheduleSlot::at(8, 0).unwrap();
        slot.completed_at_ms = Some(10);
        let body = RecordBody::Medication(Medication {
            name: "Aspirin".to_string(),
            dosage: "10mg".to_string(),
            instructions: None,
            slots: vec![slot],
        });
        let record = Record::with_id("m1", "u1", body);
        assert_eq!(
            record.validate(),
            Err(RecordValidationError::InconsistentSlot(0))
        );
    }

    #[test]
    fn search_text_is_lowercased_label() {
        let body = RecordBody::Doctor(Doctor {
            name: " Dr. House ".to_string(),
            specialty: None,
            phone: None,
            email: None,
        });
        assert_eq!(body.search_text(), "dr. house");
        assert!(body.slots().is_none());
    }
}
