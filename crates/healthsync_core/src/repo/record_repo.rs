//! Record repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide owner-scoped CRUD and sync-state APIs over the `records` table.
//! - Keep SQL details inside the core persistence boundary.
//!
//! # Invariants
//! - Write paths call `Record::validate()` before SQL mutations.
//! - An existing row's `owner_id` is never rewritten.
//! - List reads decode every row independently; one malformed row is skipped
//!   and logged instead of failing the batch.
//! - Rows are only physically deleted through the purge methods.

use crate::db::DbError;
use crate::model::codec::{decode_body, encode_body, DecodeError, CURRENT_PAYLOAD_VERSION};
use crate::model::record::{Record, RecordKey, RecordKind, RecordValidationError, SyncState};
use log::warn;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

const RECORD_SELECT_SQL: &str = "SELECT
    id,
    owner_id,
    payload,
    payload_version,
    last_modified_ms,
    sync_state,
    is_deleted
FROM records";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for record persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(RecordValidationError),
    Db(DbError),
    NotFound(RecordKey),
    /// Write targeted an existing record that belongs to another owner.
    OwnerMismatch(RecordKey),
    Decode {
        key: RecordKey,
        error: DecodeError,
    },
    Encode(String),
}

impl RepoError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_corruption())
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(key) => write!(f, "record not found: {key}"),
            Self::OwnerMismatch(key) => write!(f, "record {key} belongs to another owner"),
            Self::Decode { key, error } => write!(f, "record {key} could not be decoded: {error}"),
            Self::Encode(message) => write!(f, "record payload could not be encoded: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Decode { error, .. } => Some(error),
            Self::NotFound(_) | Self::OwnerMismatch(_) | Self::Encode(_) => None,
        }
    }
}

impl From<RecordValidationError> for RepoError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Row metadata used for ownership and timestamp decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub owner_id: String,
    pub last_modified_ms: i64,
    pub sync_state: SyncState,
    pub is_deleted: bool,
}

/// A row that could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub key: RecordKey,
    pub reason: String,
}

/// Decoded rows plus the rows that were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedRow>,
}

/// Query options for listing one owner's records of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordListQuery {
    pub kind: RecordKind,
    pub owner_id: String,
    pub include_deleted: bool,
    /// Case-insensitive substring filter on the record label.
    pub text: Option<String>,
    pub limit: Option<u32>,
}

impl RecordListQuery {
    pub fn active(kind: RecordKind, owner_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            include_deleted: false,
            text: None,
            limit: None,
        }
    }
}

/// Repository interface for record persistence.
pub trait RecordRepository {
    fn record_meta(&self, key: &RecordKey) -> RepoResult<Option<RecordMeta>>;
    /// Inserts or overwrites a record exactly as given.
    fn upsert_record(&self, record: &Record) -> RepoResult<()>;
    fn get_record(
        &self,
        key: &RecordKey,
        owner_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Record>>;
    fn list_records(&self, query: &RecordListQuery) -> RepoResult<RecordBatch>;
    /// Lists every `pending_push` row of one owner and kind, tombstones included.
    fn list_pending(&self, kind: RecordKind, owner_id: &str) -> RepoResult<RecordBatch>;
    fn count_pending(&self, owner_id: &str) -> RepoResult<u64>;
    fn soft_delete_record(&self, key: &RecordKey, owner_id: &str, stamp_ms: i64)
        -> RepoResult<()>;
    /// Clears `pending_push` only if the row was not modified since it was read.
    fn mark_synced(
        &self,
        key: &RecordKey,
        owner_id: &str,
        expected_last_modified_ms: i64,
    ) -> RepoResult<bool>;
    /// Removes a tombstone whose deletion the remote store acknowledged.
    fn purge_acknowledged(
        &self,
        key: &RecordKey,
        owner_id: &str,
        expected_last_modified_ms: i64,
    ) -> RepoResult<bool>;
    /// Removes a row unconditionally after a newer remote deletion.
    fn purge_record(&self, key: &RecordKey, owner_id: &str) -> RepoResult<bool>;
    /// Remote feed position (`change_seq`) already pulled; 0 before the first pull.
    fn pull_cursor(&self, owner_id: &str, kind: RecordKind) -> RepoResult<i64>;
    /// Advances the cursor; it never moves backwards.
    fn set_pull_cursor(&self, owner_id: &str, kind: RecordKind, cursor_seq: i64)
        -> RepoResult<()>;
    /// Cheap single-row read used for health probing.
    fn probe(&self) -> RepoResult<()>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn record_meta(&self, key: &RecordKey) -> RepoResult<Option<RecordMeta>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT owner_id, last_modified_ms, sync_state, is_deleted
             FROM records
             WHERE kind = ?1 AND id = ?2;",
        )?;
        let raw = stmt
            .query_row(params![key.kind.as_str(), key.id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .optional()?;

        let Some((owner_id, last_modified_ms, sync_text, deleted_flag)) = raw else {
            return Ok(None);
        };
        let sync_state = SyncState::parse(&sync_text).ok_or_else(|| RepoError::Decode {
            key: key.clone(),
            error: DecodeError::Malformed {
                kind: key.kind,
                message: format!("invalid sync_state `{sync_text}`"),
            },
        })?;
        let is_deleted = parse_deleted_flag(deleted_flag).map_err(|message| RepoError::Decode {
            key: key.clone(),
            error: DecodeError::Malformed {
                kind: key.kind,
                message,
            },
        })?;

        Ok(Some(RecordMeta {
            owner_id,
            last_modified_ms,
            sync_state,
            is_deleted,
        }))
    }

    fn upsert_record(&self, record: &Record) -> RepoResult<()> {
        record.validate()?;
        let key = record.key();
        if let Some(existing) = self.record_meta(&key)? {
            if existing.owner_id != record.owner_id {
                return Err(RepoError::OwnerMismatch(key));
            }
        }

        let payload = encode_body(&record.body).map_err(|err| RepoError::Encode(err.to_string()))?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO records (
                kind,
                id,
                owner_id,
                payload,
                payload_version,
                search_text,
                last_modified_ms,
                sync_state,
                is_deleted
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (kind, id) DO UPDATE SET
                payload = excluded.payload,
                payload_version = excluded.payload_version,
                search_text = excluded.search_text,
                last_modified_ms = excluded.last_modified_ms,
                sync_state = excluded.sync_state,
                is_deleted = excluded.is_deleted;",
        )?;
        stmt.execute(params![
            key.kind.as_str(),
            record.id.as_str(),
            record.owner_id.as_str(),
            payload,
            CURRENT_PAYLOAD_VERSION,
            record.body.search_text(),
            record.last_modified_ms,
            record.sync_state.as_str(),
            bool_to_int(record.is_deleted),
        ])?;

        Ok(())
    }

    fn get_record(
        &self,
        key: &RecordKey,
        owner_id: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Record>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{RECORD_SELECT_SQL}
             WHERE kind = ?1
               AND id = ?2
               AND owner_id = ?3
               AND (?4 = 1 OR is_deleted = 0);"
        ))?;

        let mut rows = stmt.query(params![
            key.kind.as_str(),
            key.id.as_str(),
            owner_id,
            bool_to_int(include_deleted),
        ])?;
        match rows.next()? {
            Some(row) => decode_row(key.kind, row)
                .map(Some)
                .map_err(|skipped| RepoError::Decode {
                    key: skipped.key,
                    error: DecodeError::Malformed {
                        kind: key.kind,
                        message: skipped.reason,
                    },
                }),
            None => Ok(None),
        }
    }

    fn list_records(&self, query: &RecordListQuery) -> RepoResult<RecordBatch> {
        let mut sql = format!("{RECORD_SELECT_SQL} WHERE kind = ? AND owner_id = ?");
        let mut bind_values: Vec<Value> = vec![
            Value::Text(query.kind.as_str().to_string()),
            Value::Text(query.owner_id.clone()),
        ];

        if !query.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }

        if let Some(text) = query.text.as_deref() {
            sql.push_str(" AND search_text LIKE ? ESCAPE '\\'");
            bind_values.push(Value::Text(like_pattern(text)));
        }

        sql.push_str(" ORDER BY last_modified_ms DESC, id ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        collect_batch(query.kind, &mut rows)
    }

    fn list_pending(&self, kind: RecordKind, owner_id: &str) -> RepoResult<RecordBatch> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{RECORD_SELECT_SQL}
             WHERE kind = ?1
               AND owner_id = ?2
               AND sync_state = 'pending_push'
             ORDER BY last_modified_ms ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![kind.as_str(), owner_id])?;
        collect_batch(kind, &mut rows)
    }

    fn count_pending(&self, owner_id: &str) -> RepoResult<u64> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT COUNT(*) FROM records
             WHERE owner_id = ?1 AND sync_state = 'pending_push';",
        )?;
        let count: i64 = stmt.query_row([owner_id], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn soft_delete_record(
        &self,
        key: &RecordKey,
        owner_id: &str,
        stamp_ms: i64,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE records
             SET
                is_deleted = 1,
                last_modified_ms = ?4,
                sync_state = 'pending_push'
             WHERE kind = ?1 AND id = ?2 AND owner_id = ?3;",
            params![key.kind.as_str(), key.id.as_str(), owner_id, stamp_ms],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(key.clone()));
        }

        Ok(())
    }

    fn mark_synced(
        &self,
        key: &RecordKey,
        owner_id: &str,
        expected_last_modified_ms: i64,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE records
             SET sync_state = 'synced'
             WHERE kind = ?1
               AND id = ?2
               AND owner_id = ?3
               AND last_modified_ms = ?4
               AND sync_state = 'pending_push';",
            params![
                key.kind.as_str(),
                key.id.as_str(),
                owner_id,
                expected_last_modified_ms
            ],
        )?;
        Ok(changed > 0)
    }

    fn purge_acknowledged(
        &self,
        key: &RecordKey,
        owner_id: &str,
        expected_last_modified_ms: i64,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM records
             WHERE kind = ?1
               AND id = ?2
               AND owner_id = ?3
               AND last_modified_ms = ?4
               AND is_deleted = 1;",
            params![
                key.kind.as_str(),
                key.id.as_str(),
                owner_id,
                expected_last_modified_ms
            ],
        )?;
        Ok(changed > 0)
    }

    fn purge_record(&self, key: &RecordKey, owner_id: &str) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM records WHERE kind = ?1 AND id = ?2 AND owner_id = ?3;",
            params![key.kind.as_str(), key.id.as_str(), owner_id],
        )?;
        Ok(changed > 0)
    }

    fn pull_cursor(&self, owner_id: &str, kind: RecordKind) -> RepoResult<i64> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT last_pulled_seq FROM sync_cursors WHERE owner_id = ?1 AND kind = ?2;",
        )?;
        let cursor = stmt
            .query_row(params![owner_id, kind.as_str()], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(cursor.unwrap_or(0))
    }

    fn set_pull_cursor(
        &self,
        owner_id: &str,
        kind: RecordKind,
        cursor_seq: i64,
    ) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO sync_cursors (owner_id, kind, last_pulled_seq)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (owner_id, kind) DO UPDATE SET
                last_pulled_seq = MAX(sync_cursors.last_pulled_seq, excluded.last_pulled_seq);",
            params![owner_id, kind.as_str(), cursor_seq],
        )?;
        Ok(())
    }

    fn probe(&self) -> RepoResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT kind, id FROM records LIMIT 1;")?;
        let mut rows = stmt.query([])?;
        let _ = rows.next()?;
        Ok(())
    }
}

fn collect_batch(kind: RecordKind, rows: &mut rusqlite::Rows<'_>) -> RepoResult<RecordBatch> {
    let mut batch = RecordBatch::default();
    while let Some(row) = rows.next()? {
        match decode_row(kind, row) {
            Ok(record) => batch.records.push(record),
            Err(skipped) => {
                warn!(
                    "event=record_decode module=repo status=skipped kind={} id={} reason={}",
                    skipped.key.kind, skipped.key.id, skipped.reason
                );
                batch.skipped.push(skipped);
            }
        }
    }
    Ok(batch)
}

fn decode_row(kind: RecordKind, row: &Row<'_>) -> Result<Record, SkippedRow> {
    let id = row
        .get::<_, String>("id")
        .unwrap_or_else(|_| "<unreadable>".to_string());
    let skip = |reason: String| SkippedRow {
        key: RecordKey::new(kind, id.clone()),
        reason,
    };

    let owner_id: String = row.get("owner_id").map_err(|err| skip(err.to_string()))?;
    let payload: String = row.get("payload").map_err(|err| skip(err.to_string()))?;
    let version: u32 = row
        .get("payload_version")
        .map_err(|err| skip(err.to_string()))?;
    let last_modified_ms: i64 = row
        .get("last_modified_ms")
        .map_err(|err| skip(err.to_string()))?;
    let sync_text: String = row.get("sync_state").map_err(|err| skip(err.to_string()))?;
    let sync_state = SyncState::parse(&sync_text)
        .ok_or_else(|| skip(format!("invalid sync_state `{sync_text}`")))?;
    let deleted_flag: i64 = row.get("is_deleted").map_err(|err| skip(err.to_string()))?;
    let is_deleted = parse_deleted_flag(deleted_flag).map_err(skip)?;

    let body = decode_body(kind, version, &payload).map_err(|err| skip(err.to_string()))?;

    Ok(Record {
        id: id.clone(),
        owner_id,
        body,
        last_modified_ms,
        sync_state,
        is_deleted,
    })
}

fn parse_deleted_flag(value: i64) -> Result<bool, String> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(format!("invalid is_deleted value `{other}`")),
    }
}

/// Builds a `LIKE` pattern that matches `text` literally as a substring.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.trim().to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
