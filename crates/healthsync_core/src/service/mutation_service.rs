//! Local mutation layer: the only writer of domain records.
//!
//! # Responsibility
//! - Create, update and soft-delete records for the primary process.
//! - Complete schedule slots and persist conflict-analysis findings.
//!
//! # Invariants
//! - Every successful write stamps `last_modified_ms` (strictly increasing per
//!   record) and sets `sync_state = PendingPush`.
//! - Rows are never physically removed here.
//! - `owner_id` of an existing record cannot be changed.
//! - A soft-deleted record counts as absent: it can be deleted again but
//!   never written back to life.
//! - Read-modify-write sequences run in one SQLite transaction.

use crate::clock::{next_stamp, Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::model::record::{
    ConflictAnalysis, Record, RecordBody, RecordKey, RecordKind, SyncState,
};
use crate::model::schedule::{nearest_incomplete_slot, ScheduleSlot};
use crate::repo::record_repo::{RecordRepository, RepoError, SqliteRecordRepository};
use crate::store::StoreHandle;
use chrono::{DateTime, FixedOffset};
use log::info;
use std::sync::Arc;

/// Outcome of [`MutationService::mark_slot_completed`].
#[derive(Debug, Clone, PartialEq)]
pub enum SlotCompletion {
    /// The nearest open slot was completed and the record re-saved.
    Completed { slot: ScheduleSlot, record: Record },
    /// Every slot was already completed; nothing was written.
    NoIncompleteSlot,
}

pub struct MutationService {
    store: Arc<StoreHandle>,
    clock: Arc<dyn Clock>,
}

impl MutationService {
    pub fn new(store: Arc<StoreHandle>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Upserts `record` by `(kind, id)` and returns the stamped copy.
    ///
    /// # Errors
    /// - `RecordNotFound` when the id belongs to a soft-deleted record.
    pub async fn save(&self, record: Record) -> StoreResult<Record> {
        self.write(record, false).await
    }

    /// Overwrites an existing record.
    ///
    /// # Errors
    /// - `RecordNotFound` when no row exists for `(kind, id)` and owner, or
    ///   the row is soft-deleted. Deleted records are never resurrected.
    pub async fn update(&self, record: Record) -> StoreResult<Record> {
        self.write(record, true).await
    }

    /// Marks a record deleted while keeping its row for sync.
    ///
    /// Repeated deletes re-stamp the record and keep it pending.
    pub async fn soft_delete(&self, kind: RecordKind, owner_id: &str, id: &str) -> StoreResult<()> {
        require_non_blank("owner id", owner_id)?;
        require_non_blank("record id", id)?;

        let key = RecordKey::new(kind, id);
        let owner_id = owner_id.to_string();
        let now_ms = self.clock.now_ms();
        let log_key = key.clone();
        self.store
            .run("soft_delete", move |conn| {
                let tx = conn.transaction()?;
                {
                    let repo = SqliteRecordRepository::new(&tx);
                    let meta = repo
                        .record_meta(&key)?
                        .filter(|meta| meta.owner_id == owner_id)
                        .ok_or_else(|| RepoError::NotFound(key.clone()))?;
                    let stamp = next_stamp(now_ms, Some(meta.last_modified_ms));
                    repo.soft_delete_record(&key, &owner_id, stamp)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(
            "event=record_soft_delete module=service status=ok kind={} id={}",
            log_key.kind, log_key.id
        );
        Ok(())
    }

    /// Completes the open schedule slot nearest to `at`'s local time of day.
    ///
    /// # Errors
    /// - `ValidationFailed` when `kind` has no schedule.
    /// - `RecordNotFound` when the record is absent, deleted or not owned by
    ///   `owner_id`.
    pub async fn mark_slot_completed(
        &self,
        kind: RecordKind,
        owner_id: &str,
        record_id: &str,
        at: DateTime<FixedOffset>,
    ) -> StoreResult<SlotCompletion> {
        require_non_blank("owner id", owner_id)?;
        require_non_blank("record id", record_id)?;
        if !kind.has_schedule() {
            return Err(StoreError::ValidationFailed(format!(
                "{kind} records have no schedule"
            )));
        }

        let key = RecordKey::new(kind, record_id);
        let owner_id = owner_id.to_string();
        let now_ms = self.clock.now_ms();
        let completion = self
            .store
            .run("mark_slot_completed", move |conn| {
                let tx = conn.transaction()?;
                let completion = {
                    let repo = SqliteRecordRepository::new(&tx);
                    let mut record = repo
                        .get_record(&key, &owner_id, false)?
                        .ok_or_else(|| RepoError::NotFound(key.clone()))?;

                    let completed = record.body.slots_mut().and_then(|slots| {
                        let index = nearest_incomplete_slot(slots.as_slice(), at.time())?;
                        slots[index].complete(at.timestamp_millis());
                        Some(slots[index])
                    });
                    match completed {
                        Some(slot) => {
                            let previous = record.last_modified_ms;
                            stamp_pending(&mut record, now_ms, Some(previous));
                            repo.upsert_record(&record)?;
                            SlotCompletion::Completed { slot, record }
                        }
                        None => SlotCompletion::NoIncompleteSlot,
                    }
                };
                tx.commit()?;
                Ok(completion)
            })
            .await?;

        match &completion {
            SlotCompletion::Completed { record, .. } => info!(
                "event=slot_complete module=service status=ok kind={} id={}",
                kind, record.id
            ),
            SlotCompletion::NoIncompleteSlot => info!(
                "event=slot_complete module=service status=noop kind={} id={}",
                kind, record_id
            ),
        }
        Ok(completion)
    }

    /// Persists one interaction-analysis result for `owner_id`.
    pub async fn record_conflict_finding(
        &self,
        owner_id: &str,
        analysis: ConflictAnalysis,
    ) -> StoreResult<Record> {
        self.save(Record::new(owner_id, RecordBody::ConflictFinding(analysis)))
            .await
    }

    async fn write(&self, record: Record, require_existing: bool) -> StoreResult<Record> {
        record.validate().map_err(RepoError::from)?;

        let operation = if require_existing { "update" } else { "save" };
        let now_ms = self.clock.now_ms();
        let saved = self
            .store
            .run(operation, move |conn| {
                let mut record = record;
                let key = record.key();
                let tx = conn.transaction()?;
                {
                    let repo = SqliteRecordRepository::new(&tx);
                    let previous = repo.record_meta(&key)?;
                    match &previous {
                        Some(meta) if meta.owner_id != record.owner_id => {
                            return Err(if require_existing {
                                RepoError::NotFound(key)
                            } else {
                                RepoError::OwnerMismatch(key)
                            });
                        }
                        Some(meta) if meta.is_deleted => return Err(RepoError::NotFound(key)),
                        None if require_existing => return Err(RepoError::NotFound(key)),
                        _ => {}
                    }
                    stamp_pending(
                        &mut record,
                        now_ms,
                        previous.map(|meta| meta.last_modified_ms),
                    );
                    repo.upsert_record(&record)?;
                }
                tx.commit()?;
                Ok(record)
            })
            .await?;

        info!(
            "event=record_{} module=service status=ok kind={} id={}",
            operation,
            saved.kind(),
            saved.id
        );
        Ok(saved)
    }
}

fn stamp_pending(record: &mut Record, now_ms: i64, previous_ms: Option<i64>) {
    record.last_modified_ms = next_stamp(now_ms, previous_ms);
    record.sync_state = SyncState::PendingPush;
}

fn require_non_blank(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::ValidationFailed(format!(
            "{field} must not be blank"
        )));
    }
    Ok(())
}
