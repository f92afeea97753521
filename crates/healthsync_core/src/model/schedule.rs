//! Daily schedule slots for medication, supplement and caregiver records.
//!
//! # Invariants
//! - `completed_at_ms` is set only when `completed` is true.
//! - Slot order is caller-defined and preserved through persistence.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// One time-of-day entry in a record's daily schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    /// Local wall-clock time of day.
    pub time: NaiveTime,
    #[serde(default)]
    pub completed: bool,
    /// Unix epoch milliseconds of completion.
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
}

impl ScheduleSlot {
    /// Creates an incomplete slot at `hour:minute`.
    ///
    /// Returns `None` for out-of-range values.
    pub fn at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|time| Self {
            time,
            completed: false,
            completed_at_ms: None,
        })
    }

    pub fn complete(&mut self, at_ms: i64) {
        self.completed = true;
        self.completed_at_ms = Some(at_ms);
    }

    pub fn is_consistent(&self) -> bool {
        self.completed || self.completed_at_ms.is_none()
    }
}

/// Returns the index of the incomplete slot closest to `time_of_day`.
///
/// Distance is the absolute difference in seconds within one day; it does not
/// wrap around midnight. Ties resolve to the slot listed first.
pub fn nearest_incomplete_slot(slots: &[ScheduleSlot], time_of_day: NaiveTime) -> Option<usize> {
    let target = i64::from(time_of_day.num_seconds_from_midnight());
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| !slot.completed)
        .min_by_key(|(_, slot)| (i64::from(slot.time.num_seconds_from_midnight()) - target).abs())
        .map(|(index, _)| index)
}
