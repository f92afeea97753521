//! Per-process serialized access to the shared store.
//!
//! # Responsibility
//! - Own this process's single connection to the shared store file.
//! - Run store work one operation at a time off the async executor.
//! - Track availability, the last store error and I/O counters.
//!
//! # Invariants
//! - At most one store operation is in flight per handle.
//! - No operation reaches SQLite before `initialize` produced a connection.
//! - Corruption observed on a live connection makes the next `initialize`
//!   reset the store.

use super::bootstrap::{Availability, StoreBootstrapper, StoreStatus};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::repo::record_repo::{RecordRepository, RepoError, SqliteRecordRepository};
use log::{error, info, warn};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;

const NOT_INITIALIZED: &str = "store not initialized";

struct HandleState {
    status: StoreStatus,
    last_error: Option<String>,
    needs_reset: bool,
}

/// Explicit per-process store handle, shared with dependents through `Arc`.
pub struct StoreHandle {
    bootstrapper: StoreBootstrapper,
    conn: Arc<AsyncMutex<Option<Connection>>>,
    state: Mutex<HandleState>,
    io_calls: AtomicU64,
    cache_drops: AtomicU64,
}

impl StoreHandle {
    /// Creates a handle without touching the file system.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            bootstrapper: StoreBootstrapper::new(config),
            conn: Arc::new(AsyncMutex::new(None)),
            state: Mutex::new(HandleState {
                status: StoreStatus::Unavailable(NOT_INITIALIZED.to_string()),
                last_error: None,
                needs_reset: false,
            }),
            io_calls: AtomicU64::new(0),
            cache_drops: AtomicU64::new(0),
        }
    }

    /// Opens the store through the recovery ladder.
    ///
    /// Idempotent: a handle that already holds a healthy connection returns
    /// `Available` without reopening. Never panics and never returns an error.
    pub async fn initialize(&self) -> Availability {
        let mut guard = Arc::clone(&self.conn).lock_owned().await;
        let force_reset = {
            let state = self.lock_state();
            if guard.is_some() && !state.needs_reset {
                return Availability::Available;
            }
            state.needs_reset
        };

        // Release file handles before the ladder may delete the files.
        drop(guard.take());

        let bootstrapper = self.bootstrapper.clone();
        let joined = tokio::task::spawn_blocking(move || bootstrapper.run(force_reset)).await;
        let mut state = self.lock_state();
        match joined {
            Ok(outcome) => {
                *guard = outcome.connection;
                state.needs_reset = false;
                if outcome.last_error.is_some() {
                    state.last_error = outcome.last_error;
                }
                state.status = match &outcome.availability {
                    Availability::Available => StoreStatus::Available,
                    Availability::Unavailable(reason) => StoreStatus::Unavailable(reason.clone()),
                };
                outcome.availability
            }
            Err(join_err) => {
                let reason = format!("bootstrap worker failed: {join_err}");
                error!(
                    "event=store_bootstrap module=store status=error error={}",
                    reason
                );
                state.status = StoreStatus::Unavailable(reason.clone());
                state.last_error = Some(reason.clone());
                Availability::Unavailable(reason)
            }
        }
    }

    /// Drops the connection; later calls fail with `StoreUnavailable` until
    /// `initialize` runs again.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        drop(guard.take());
        self.lock_state().status = StoreStatus::Unavailable("store closed".to_string());
        info!("event=store_close module=store status=ok");
    }

    pub fn status(&self) -> StoreStatus {
        self.lock_state().status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn is_available(&self) -> bool {
        self.status() == StoreStatus::Available
    }

    pub fn db_path(&self) -> &Path {
        self.bootstrapper.db_path()
    }

    pub fn container_dir(&self) -> &Path {
        self.bootstrapper.container_dir()
    }

    /// Number of operations dispatched to SQLite through [`StoreHandle::run`].
    pub fn io_calls(&self) -> u64 {
        self.io_calls.load(Ordering::Relaxed)
    }

    pub fn cache_drops(&self) -> u64 {
        self.cache_drops.load(Ordering::Relaxed)
    }

    /// Runs `task` against the connection on the blocking pool.
    ///
    /// Callers queue on the handle's async mutex, so operations execute one
    /// at a time in arrival order.
    pub async fn run<T, F>(&self, operation: &'static str, task: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> Result<T, RepoError> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = Arc::clone(&self.conn).lock_owned().await;
        if guard.is_none() {
            return Err(StoreError::StoreUnavailable(self.unavailable_reason()));
        }

        self.io_calls.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let joined = tokio::task::spawn_blocking(move || (*guard).as_mut().map(task)).await;

        match joined {
            Ok(Some(Ok(value))) => {
                self.note_success();
                Ok(value)
            }
            Ok(Some(Err(err))) => Err(self.note_failure(operation, started_at, err)),
            Ok(None) => Err(StoreError::StoreUnavailable(self.unavailable_reason())),
            Err(join_err) => {
                let reason = format!("store worker failed during {operation}: {join_err}");
                error!(
                    "event=store_op module=store status=error op={} error={}",
                    operation, reason
                );
                self.lock_state().last_error = Some(reason.clone());
                Err(StoreError::StoreUnavailable(reason))
            }
        }
    }

    /// Cheap single-row read through the serialized worker.
    pub async fn probe(&self) -> StoreResult<()> {
        self.run("probe", |conn| SqliteRecordRepository::new(conn).probe())
            .await
    }

    /// Releases in-process caches: prepared statements and SQLite's page cache.
    ///
    /// Does not modify stored data. A handle without a connection has nothing
    /// to drop and returns `Ok`.
    pub async fn drop_caches(&self) -> StoreResult<()> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let joined = tokio::task::spawn_blocking(move || match guard.as_ref() {
            Some(conn) => {
                conn.flush_prepared_statement_cache();
                conn.execute_batch("PRAGMA shrink_memory;").map(|()| true)
            }
            None => Ok(false),
        })
        .await;

        match joined {
            Ok(Ok(dropped)) => {
                if dropped {
                    self.cache_drops.fetch_add(1, Ordering::Relaxed);
                }
                info!(
                    "event=cache_drop module=store status=ok dropped={}",
                    dropped
                );
                Ok(())
            }
            Ok(Err(err)) => Err(RepoError::from(err).into()),
            Err(join_err) => Err(StoreError::StoreUnavailable(format!(
                "store worker failed during cache drop: {join_err}"
            ))),
        }
    }

    fn note_success(&self) {
        let mut state = self.lock_state();
        if matches!(state.status, StoreStatus::Degraded(_)) && !state.needs_reset {
            state.status = StoreStatus::Available;
        }
    }

    fn note_failure(&self, operation: &'static str, started_at: Instant, err: RepoError) -> StoreError {
        if let RepoError::Db(_) = &err {
            let message = err.to_string();
            let mut state = self.lock_state();
            state.status = StoreStatus::Degraded(message.clone());
            state.last_error = Some(message.clone());
            if err.is_corruption() {
                state.needs_reset = true;
                error!(
                    "event=store_op module=store status=corrupt op={} duration_ms={} error={}",
                    operation,
                    started_at.elapsed().as_millis(),
                    message
                );
            } else {
                warn!(
                    "event=store_op module=store status=error op={} duration_ms={} error={}",
                    operation,
                    started_at.elapsed().as_millis(),
                    message
                );
            }
        }
        err.into()
    }

    fn unavailable_reason(&self) -> String {
        match self.status() {
            StoreStatus::Unavailable(reason) => reason,
            other => other.to_string(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
