//! Read path for memory-constrained processes.
//!
//! # Responsibility
//! - Serve owner-scoped, batch-limited reads as immutable snapshots.
//! - Refuse work up front when the process is over its memory budget.
//!
//! # Invariants
//! - Validation and the memory check happen before any store I/O.
//! - Results never contain another owner's records.
//! - Row count never exceeds the configured batch limit.
//! - One malformed row is skipped and logged; the rest of the batch returns.

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::health::memory::{MemoryBudget, MemoryProbe};
use crate::model::record::{Record, RecordKey, RecordKind};
use crate::model::snapshot::Snapshot;
use crate::repo::record_repo::{RecordListQuery, RecordRepository, SqliteRecordRepository};
use crate::store::StoreHandle;
use log::debug;
use std::sync::Arc;

/// Options for reads that may include tombstones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub include_deleted: bool,
    /// `None` means the configured batch limit.
    pub limit: Option<u32>,
}

/// Medications and supplements of one owner, read together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedSnapshot {
    pub medications: Vec<Snapshot<Record>>,
    pub supplements: Vec<Snapshot<Record>>,
}

pub struct SharedStoreAccessor {
    store: Arc<StoreHandle>,
    memory: Arc<dyn MemoryProbe>,
    budget: MemoryBudget,
    batch_limit: u32,
    clock: Arc<dyn Clock>,
}

impl SharedStoreAccessor {
    pub fn new(store: Arc<StoreHandle>, memory: Arc<dyn MemoryProbe>, config: &StoreConfig) -> Self {
        Self {
            store,
            memory,
            budget: MemoryBudget::new(config.memory_ceiling_bytes()),
            batch_limit: config.batch_limit,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for snapshot timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn batch_limit(&self) -> u32 {
        self.batch_limit
    }

    /// Active (non-deleted) records of one kind, newest first.
    pub async fn fetch_active(
        &self,
        kind: RecordKind,
        owner_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Snapshot<Record>>> {
        self.fetch_all(kind, owner_id, FetchOptions {
            include_deleted: false,
            limit,
        })
        .await
    }

    /// Records of one kind with optional tombstones.
    pub async fn fetch_all(
        &self,
        kind: RecordKind,
        owner_id: &str,
        options: FetchOptions,
    ) -> StoreResult<Vec<Snapshot<Record>>> {
        let owner_id = require_owner(owner_id)?;
        self.query(RecordListQuery {
            kind,
            owner_id,
            include_deleted: options.include_deleted,
            text: None,
            limit: Some(self.clamp_limit(options.limit)),
        })
        .await
    }

    /// Active records whose label contains `text`, case-insensitively.
    pub async fn search(
        &self,
        kind: RecordKind,
        owner_id: &str,
        text: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Snapshot<Record>>> {
        let owner_id = require_owner(owner_id)?;
        if text.trim().is_empty() {
            return Err(StoreError::ValidationFailed(
                "search query must not be blank".to_string(),
            ));
        }
        self.query(RecordListQuery {
            kind,
            owner_id,
            include_deleted: false,
            text: Some(text.to_string()),
            limit: Some(self.clamp_limit(limit)),
        })
        .await
    }

    /// Fetches medications and supplements concurrently.
    pub async fn fetch_combined(&self, owner_id: &str) -> StoreResult<CombinedSnapshot> {
        let (medications, supplements) = tokio::try_join!(
            self.fetch_active(RecordKind::Medication, owner_id, None),
            self.fetch_active(RecordKind::Supplement, owner_id, None),
        )?;
        Ok(CombinedSnapshot {
            medications,
            supplements,
        })
    }

    /// One record by key, or `None` when absent or owned by someone else.
    pub async fn fetch_one(
        &self,
        key: RecordKey,
        owner_id: &str,
        include_deleted: bool,
    ) -> StoreResult<Option<Snapshot<Record>>> {
        let owner_id = require_owner(owner_id)?;
        self.budget.check(self.memory.as_ref())?;

        let taken_at_ms = self.clock.now_ms();
        let record = self
            .store
            .run("fetch_one", move |conn| {
                SqliteRecordRepository::new(conn).get_record(&key, &owner_id, include_deleted)
            })
            .await?;
        Ok(record.map(|record| Snapshot::new(record, taken_at_ms)))
    }

    async fn query(&self, query: RecordListQuery) -> StoreResult<Vec<Snapshot<Record>>> {
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }
        self.budget.check(self.memory.as_ref())?;

        let kind = query.kind;
        let taken_at_ms = self.clock.now_ms();
        let batch = self
            .store
            .run("fetch", move |conn| {
                SqliteRecordRepository::new(conn).list_records(&query)
            })
            .await?;

        debug!(
            "event=accessor_fetch module=service status=ok kind={} rows={} skipped={}",
            kind,
            batch.records.len(),
            batch.skipped.len()
        );
        Ok(batch
            .records
            .into_iter()
            .map(|record| Snapshot::new(record, taken_at_ms))
            .collect())
    }

    fn clamp_limit(&self, requested: Option<u32>) -> u32 {
        requested.map_or(self.batch_limit, |limit| limit.min(self.batch_limit))
    }
}

fn require_owner(owner_id: &str) -> StoreResult<String> {
    if owner_id.trim().is_empty() {
        return Err(StoreError::ValidationFailed(
            "owner id must not be blank".to_string(),
        ));
    }
    Ok(owner_id.to_string())
}
