//! Push/pull reconciliation between the local store and the remote store.
//!
//! # Responsibility
//! - Push every pending record of an owner, kind by kind.
//! - Pull remote changes since the last cursor and apply them last-writer-wins.
//! - Report per-record outcomes; one failure never aborts a pass.
//!
//! # Invariants
//! - A record is cleared to `Synced` (or purged, for tombstones) only when
//!   its `last_modified_ms` still equals the pushed version.
//! - Failed pushes stay `PendingPush`; there is no retry loop here.
//! - Every remote call runs under the configured timeout.
//! - Pull cursors track the remote `change_seq`; `last_modified_ms` only
//!   decides which version wins.
//! - Pull never physically removes a row that has unpushed local changes.

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::context::SharedContext;
use crate::error::{StoreError, StoreResult};
use crate::model::record::{Record, RecordKey, RecordKind, SyncState};
use crate::repo::record_repo::{RecordRepository, RepoError, SqliteRecordRepository};
use crate::store::StoreHandle;
use crate::sync::remote::{PushAck, RemoteRecord, RemoteResult, RemoteStore};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One record that could not be reconciled in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub key: RecordKey,
    pub reason: String,
}

impl From<SyncFailure> for StoreError {
    fn from(value: SyncFailure) -> Self {
        StoreError::RemoteSyncFailed {
            key: value.key,
            reason: value.reason,
        }
    }
}

/// Outcome of one push pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending rows examined, including rows that failed to decode.
    pub scanned: usize,
    pub pushed: usize,
    /// Tombstones acknowledged by the remote and purged locally.
    pub deleted: usize,
    /// Pushes the remote kept a newer version for; pull to converge.
    pub superseded: Vec<RecordKey>,
    /// Acknowledged pushes whose record changed locally in the meantime.
    pub skipped_stale: usize,
    pub failures: Vec<SyncFailure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The first failure as a store error, for callers that need one.
    pub fn first_error(&self) -> Option<StoreError> {
        self.failures.first().cloned().map(StoreError::from)
    }
}

/// A kind whose remote changes could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullFailure {
    pub kind: RecordKind,
    pub reason: String,
}

/// Outcome of one pull pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub fetched: usize,
    /// Remote versions written locally.
    pub applied: usize,
    /// Synced local rows removed because of a newer remote deletion.
    pub purged: usize,
    /// Pending local rows that lost to a newer remote deletion. They stay as
    /// pending tombstones until the next push acknowledges the deletion.
    pub deleted_remotely: Vec<RecordKey>,
    /// Remote versions ignored because the local copy is as new or newer.
    pub kept_local: usize,
    /// Remote versions that failed validation or targeted another owner.
    pub rejected: Vec<SyncFailure>,
    pub failures: Vec<PullFailure>,
}

#[derive(Debug, Default)]
struct PullKindOutcome {
    applied: usize,
    purged: usize,
    deleted_remotely: Vec<RecordKey>,
    kept_local: usize,
    rejected: Vec<SyncFailure>,
}

pub struct ReconciliationEngine {
    store: Arc<StoreHandle>,
    remote: Arc<dyn RemoteStore>,
    push_timeout: Duration,
    context: Option<Arc<dyn SharedContext>>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<StoreHandle>, remote: Arc<dyn RemoteStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            remote,
            push_timeout: config.push_timeout(),
            context: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Publishes `last_sync_ms` to `context` after every pass.
    pub fn with_context(mut self, context: Arc<dyn SharedContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    /// Pushes every pending record of `owner_id`.
    ///
    /// # Errors
    /// - `ValidationFailed` for a blank owner.
    /// - Store-level errors (unavailable, corruption) end the pass early;
    ///   per-record remote failures are reported instead.
    pub async fn reconcile(&self, owner_id: &str) -> StoreResult<ReconcileReport> {
        require_owner(owner_id)?;
        let mut report = ReconcileReport::default();

        for kind in RecordKind::ALL {
            let owner = owner_id.to_string();
            let batch = self
                .store
                .run("list_pending", move |conn| {
                    SqliteRecordRepository::new(conn).list_pending(kind, &owner)
                })
                .await?;

            report.scanned += batch.records.len() + batch.skipped.len();
            report
                .failures
                .extend(batch.skipped.into_iter().map(|skipped| SyncFailure {
                    key: skipped.key,
                    reason: format!("decode failed: {}", skipped.reason),
                }));

            for record in batch.records {
                self.push_record(record, &mut report).await?;
            }
        }

        info!(
            "event=sync_reconcile module=sync status={} scanned={} pushed={} deleted={} superseded={} stale={} failed={}",
            if report.is_clean() { "ok" } else { "partial" },
            report.scanned,
            report.pushed,
            report.deleted,
            report.superseded.len(),
            report.skipped_stale,
            report.failures.len()
        );
        self.publish_last_sync();
        Ok(report)
    }

    /// Fetches remote changes since the stored feed cursor and applies them.
    ///
    /// The newer `last_modified_ms` wins; ties keep the local copy. A newer
    /// remote deletion purges a synced row but only tombstones a pending one.
    pub async fn pull(&self, owner_id: &str) -> StoreResult<PullReport> {
        require_owner(owner_id)?;
        let mut report = PullReport::default();

        for kind in RecordKind::ALL {
            let owner = owner_id.to_string();
            let since_seq = self
                .store
                .run("pull_cursor", move |conn| {
                    SqliteRecordRepository::new(conn).pull_cursor(&owner, kind)
                })
                .await?;

            let changes = match self
                .call_remote(self.remote.changes_since(kind, owner_id, since_seq))
                .await
            {
                Ok(changes) => changes,
                Err(reason) => {
                    warn!(
                        "event=sync_pull module=sync status=error kind={} reason={}",
                        kind, reason
                    );
                    report.failures.push(PullFailure { kind, reason });
                    continue;
                }
            };
            if changes.is_empty() {
                continue;
            }
            report.fetched += changes.len();

            let owner = owner_id.to_string();
            let outcome = self
                .store
                .run("apply_remote", move |conn| {
                    apply_remote_changes(conn, kind, &owner, since_seq, changes)
                })
                .await?;
            report.applied += outcome.applied;
            report.purged += outcome.purged;
            report.deleted_remotely.extend(outcome.deleted_remotely);
            report.kept_local += outcome.kept_local;
            report.rejected.extend(outcome.rejected);
        }

        info!(
            "event=sync_pull module=sync status={} fetched={} applied={} purged={} deleted_remotely={} kept_local={} rejected={} failed_kinds={}",
            if report.failures.is_empty() { "ok" } else { "partial" },
            report.fetched,
            report.applied,
            report.purged,
            report.deleted_remotely.len(),
            report.kept_local,
            report.rejected.len(),
            report.failures.len()
        );
        self.publish_last_sync();
        Ok(report)
    }

    async fn push_record(&self, record: Record, report: &mut ReconcileReport) -> StoreResult<()> {
        let key = record.key();
        let pushed_version = record.last_modified_ms;
        let ack = if record.is_deleted {
            self.call_remote(self.remote.delete(
                key.kind,
                &record.owner_id,
                &record.id,
                pushed_version,
            ))
            .await
        } else {
            self.call_remote(self.remote.upsert(RemoteRecord::from(&record)))
                .await
        };

        let ack = match ack {
            Ok(ack) => ack,
            Err(reason) => {
                warn!(
                    "event=sync_push module=sync status=error kind={} id={} reason={}",
                    key.kind, key.id, reason
                );
                report.failures.push(SyncFailure { key, reason });
                return Ok(());
            }
        };

        let purge = record.is_deleted && ack == PushAck::Applied;
        let owner = record.owner_id.clone();
        let ack_key = key.clone();
        let cleared = self
            .store
            .run("ack_push", move |conn| {
                let repo = SqliteRecordRepository::new(conn);
                if purge {
                    repo.purge_acknowledged(&ack_key, &owner, pushed_version)
                } else {
                    repo.mark_synced(&ack_key, &owner, pushed_version)
                }
            })
            .await?;

        if !cleared {
            report.skipped_stale += 1;
            return Ok(());
        }
        match ack {
            PushAck::Superseded {
                remote_last_modified_ms,
            } => {
                info!(
                    "event=sync_push module=sync status=superseded kind={} id={} remote_ms={}",
                    key.kind, key.id, remote_last_modified_ms
                );
                report.superseded.push(key);
            }
            PushAck::Applied if purge => report.deleted += 1,
            PushAck::Applied => report.pushed += 1,
        }
        Ok(())
    }

    async fn call_remote<T>(
        &self,
        call: impl Future<Output = RemoteResult<T>>,
    ) -> Result<T, String> {
        match tokio::time::timeout(self.push_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "remote call timed out after {} ms",
                self.push_timeout.as_millis()
            )),
        }
    }

    fn publish_last_sync(&self) {
        let Some(context) = &self.context else {
            return;
        };
        let now_ms = self.clock.now_ms();
        if let Err(err) = context.update(&mut |ctx| ctx.last_sync_ms = Some(now_ms)) {
            warn!(
                "event=context_publish module=sync status=error error={}",
                err
            );
        }
    }
}

fn apply_remote_changes(
    conn: &mut rusqlite::Connection,
    kind: RecordKind,
    owner_id: &str,
    since_seq: i64,
    changes: Vec<RemoteRecord>,
) -> Result<PullKindOutcome, RepoError> {
    let mut outcome = PullKindOutcome::default();
    let cursor_seq = changes
        .iter()
        .map(|change| change.change_seq)
        .fold(since_seq, i64::max);

    let tx = conn.transaction()?;
    {
        let repo = SqliteRecordRepository::new(&tx);
        for change in changes {
            let key = change.key();
            if change.owner_id != owner_id || key.kind != kind {
                outcome.rejected.push(SyncFailure {
                    key,
                    reason: "remote change does not match requested owner and kind".to_string(),
                });
                continue;
            }

            let local = repo.record_meta(&key)?;
            match local {
                Some(meta) if meta.owner_id != owner_id => {
                    outcome.rejected.push(SyncFailure {
                        key,
                        reason: "local record belongs to another owner".to_string(),
                    });
                }
                Some(meta) if meta.last_modified_ms >= change.last_modified_ms => {
                    outcome.kept_local += 1;
                }
                Some(meta) if change.is_deleted && meta.sync_state == SyncState::Synced => {
                    repo.purge_record(&key, owner_id)?;
                    outcome.purged += 1;
                }
                Some(_) if change.is_deleted => {
                    repo.soft_delete_record(&key, owner_id, change.last_modified_ms)?;
                    outcome.deleted_remotely.push(key);
                }
                // Deleted remotely before this device ever saw it.
                None if change.is_deleted => {}
                _ => match repo.upsert_record(&change.into_synced_record()) {
                    Ok(()) => outcome.applied += 1,
                    Err(RepoError::Validation(err)) => outcome.rejected.push(SyncFailure {
                        key,
                        reason: err.to_string(),
                    }),
                    Err(err) => return Err(err),
                },
            }
        }
        repo.set_pull_cursor(owner_id, kind, cursor_seq)?;
    }
    tx.commit()?;
    Ok(outcome)
}

fn require_owner(owner_id: &str) -> StoreResult<()> {
    if owner_id.trim().is_empty() {
        return Err(StoreError::ValidationFailed(
            "owner id must not be blank".to_string(),
        ));
    }
    Ok(())
}
