//! Remote cloud database seam.
//!
//! # Responsibility
//! - Define the async contract the reconciliation engine pushes to and pulls
//!   from.
//! - Provide an in-memory last-writer-wins remote for tests and demos.
//!
//! # Invariants
//! - Upserts are idempotent by `(kind, owner_id, id)`.
//! - A write older than the stored version is reported as superseded and
//!   leaves the remote unchanged.
//! - Every stored write gets a fresh `change_seq`, strictly increasing across
//!   the whole remote. Pull cursors follow `change_seq`, never device clocks.

use crate::model::record::{Record, RecordBody, RecordKey, RecordKind, SyncState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A record as the remote store sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub owner_id: String,
    pub body: RecordBody,
    pub last_modified_ms: i64,
    pub is_deleted: bool,
    /// Position in the remote change feed, assigned by the remote on every
    /// stored write. Zero for versions the remote has not stored yet.
    pub change_seq: i64,
}

impl RemoteRecord {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind(), self.id.clone())
    }

    /// Local copy of this remote version, already acknowledged.
    pub fn into_synced_record(self) -> Record {
        Record {
            id: self.id,
            owner_id: self.owner_id,
            body: self.body,
            last_modified_ms: self.last_modified_ms,
            sync_state: SyncState::Synced,
            is_deleted: self.is_deleted,
        }
    }
}

impl From<&Record> for RemoteRecord {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            body: record.body.clone(),
            last_modified_ms: record.last_modified_ms,
            is_deleted: record.is_deleted,
            change_seq: 0,
        }
    }
}

/// Remote acknowledgment of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAck {
    Applied,
    /// The remote holds a newer version and kept it.
    Superseded { remote_last_modified_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or service failure; the write may be retried.
    Transport(String),
    /// The remote refused the write.
    Rejected(String),
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "remote transport failed: {reason}"),
            Self::Rejected(reason) => write!(f, "remote rejected write: {reason}"),
        }
    }
}

impl Error for RemoteError {}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates or overwrites the record addressed by its id.
    async fn upsert(&self, record: RemoteRecord) -> RemoteResult<PushAck>;

    /// Marks the record deleted as of `deleted_at_ms`.
    async fn delete(
        &self,
        kind: RecordKind,
        owner_id: &str,
        id: &str,
        deleted_at_ms: i64,
    ) -> RemoteResult<PushAck>;

    /// Versions of one owner's records of `kind` stored after feed position
    /// `since_seq`, in `change_seq` order. Deletions are returned as
    /// tombstones.
    async fn changes_since(
        &self,
        kind: RecordKind,
        owner_id: &str,
        since_seq: i64,
    ) -> RemoteResult<Vec<RemoteRecord>>;
}

type RemoteKey = (RecordKind, String, String);

/// In-process remote applying last-writer-wins by `last_modified_ms`.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    records: Mutex<BTreeMap<RemoteKey, RemoteRecord>>,
    failing_ids: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    /// Last assigned `change_seq`; bumped only while `records` is locked.
    last_seq: AtomicI64,
    upsert_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write for `id` fail with a transport error.
    pub fn fail_id(&self, id: impl Into<String>) {
        lock(&self.failing_ids).insert(id.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_ids).clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Stores a version written by another device, unconditionally.
    pub fn seed(&self, mut record: RemoteRecord) {
        let mut records = lock(&self.records);
        record.change_seq = self.next_seq();
        records.insert(remote_key(record.kind(), &record.owner_id, &record.id), record);
    }

    pub fn get(&self, kind: RecordKind, owner_id: &str, id: &str) -> Option<RemoteRecord> {
        lock(&self.records).get(&remote_key(kind, owner_id, id)).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    fn next_seq(&self) -> i64 {
        self.last_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn simulate_call(&self, id: &str) -> RemoteResult<()> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if lock(&self.failing_ids).contains(id) {
            return Err(RemoteError::Transport(format!("injected failure for `{id}`")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn upsert(&self, record: RemoteRecord) -> RemoteResult<PushAck> {
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_call(&record.id).await?;

        let mut records = lock(&self.records);
        let key = remote_key(record.kind(), &record.owner_id, &record.id);
        if let Some(existing) = records.get(&key) {
            if existing.last_modified_ms > record.last_modified_ms {
                return Ok(PushAck::Superseded {
                    remote_last_modified_ms: existing.last_modified_ms,
                });
            }
        }
        let mut record = record;
        record.change_seq = self.next_seq();
        records.insert(key, record);
        Ok(PushAck::Applied)
    }

    async fn delete(
        &self,
        kind: RecordKind,
        owner_id: &str,
        id: &str,
        deleted_at_ms: i64,
    ) -> RemoteResult<PushAck> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_call(id).await?;

        let mut records = lock(&self.records);
        match records.get_mut(&remote_key(kind, owner_id, id)) {
            Some(existing) if existing.last_modified_ms > deleted_at_ms => {
                Ok(PushAck::Superseded {
                    remote_last_modified_ms: existing.last_modified_ms,
                })
            }
            Some(existing) => {
                existing.is_deleted = true;
                existing.last_modified_ms = deleted_at_ms;
                existing.change_seq = self.next_seq();
                Ok(PushAck::Applied)
            }
            // Never pushed, so no other device knows about it.
            None => Ok(PushAck::Applied),
        }
    }

    async fn changes_since(
        &self,
        kind: RecordKind,
        owner_id: &str,
        since_seq: i64,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        let mut changes: Vec<RemoteRecord> = lock(&self.records)
            .iter()
            .filter(|((record_kind, record_owner, _), record)| {
                *record_kind == kind
                    && record_owner == owner_id
                    && record.change_seq > since_seq
            })
            .map(|(_, record)| record.clone())
            .collect();
        changes.sort_by_key(|record| record.change_seq);
        Ok(changes)
    }
}

fn remote_key(kind: RecordKind, owner_id: &str, id: &str) -> RemoteKey {
    (kind, owner_id.to_string(), id.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
