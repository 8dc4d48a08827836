//! Table-agnostic storage engine.
//!
//! One [`StorageEngine`] exists per content domain. It owns that domain's
//! `SQLite` connection behind a single mutex, which is also the coarse lock
//! serializing cross-session access to the domain (one mutex guards all
//! tables of one database). Every content domain is a thin layer over this
//! engine: the dispatcher resolves field ids and offset masks through the
//! domain's [`DomainSchema`] and calls the generic operations here.
//!
//! # Failure semantics
//!
//! Every operation returns a [`StorageError`]; callers write the mapped wire
//! code back before unwinding. `SQLITE_BUSY`/`SQLITE_FULL` are recoverable
//! next request: after any such failure the engine marks the connection
//! suspect and the next call runs a quick `SELECT 1` probe, dropping cached
//! statements and reopening the database if the probe fails.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bdp_core::ErrorCode;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use super::schema::{DomainSchema, FieldKind, FieldSpec};

/// Hard cap on any id list or search result, bounding reply memory.
pub const MAX_RESULT_ROWS: u32 = 65_535;

/// Attempts at minting a fresh id before giving up.
const MINT_ATTEMPTS: u32 = 16;

/// Engine error kinds; each maps onto one wire [`ErrorCode`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bad field id, kind mismatch, or otherwise malformed arguments.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The addressed record does not exist.
    #[error("record {0} not found")]
    IdNotFound(i64),
    /// A caller-supplied id is already present.
    #[error("record {0} already exists")]
    DuplicatedId(i64),
    /// The query legitimately matched nothing.
    #[error("no data")]
    NoData,
    /// `SQLITE_BUSY`/`SQLITE_LOCKED`; recoverable next request.
    #[error("database busy")]
    DiskBusy,
    /// `SQLITE_FULL`; recoverable next request.
    #[error("disk full")]
    DiskFull,
    /// Payload exceeds a protocol bound.
    #[error("payload too large")]
    TooBigData,
    /// Any other `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl StorageError {
    /// The wire code to answer with.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::IdNotFound(_) => ErrorCode::IdNotFound,
            Self::DuplicatedId(_) => ErrorCode::DuplicatedId,
            Self::NoData => ErrorCode::NoData,
            Self::DiskBusy => ErrorCode::DiskBusy,
            Self::DiskFull => ErrorCode::DiskFull,
            Self::TooBigData => ErrorCode::TooBigData,
            Self::Sqlite(_) => ErrorCode::Unknown,
        }
    }

    /// Whether the next call should health-probe the connection.
    const fn taints_connection(&self) -> bool {
        matches!(self, Self::DiskBusy | Self::DiskFull | Self::Sqlite(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NoData,
            rusqlite::Error::SqliteFailure(code, message) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::DiskBusy
                },
                rusqlite::ErrorCode::DiskFull => Self::DiskFull,
                rusqlite::ErrorCode::ConstraintViolation => Self::DuplicatedId(-1),
                _ => Self::Sqlite(rusqlite::Error::SqliteFailure(code, message)),
            },
            other => Self::Sqlite(other),
        }
    }
}

/// Result type for engine operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A single typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Integer column.
    Int(i64),
    /// Text column.
    Text(String),
}

impl FieldValue {
    fn as_sql(&self) -> Value {
        match self {
            Self::Int(v) => Value::Integer(*v),
            Self::Text(v) => Value::Text(v.clone()),
        }
    }

    fn matches(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Int(_), FieldKind::Int) | (Self::Text(_), FieldKind::Text)
        )
    }
}

/// Id-list filters over the soft-delete/dirty flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFilter {
    /// Live records only (`is_deleted = 0`).
    Live,
    /// Everything, tombstones included.
    WithDeleted,
    /// Live records with local changes not yet propagated.
    Dirty,
    /// Soft-deleted tombstones only.
    Deleted,
}

impl IdFilter {
    const fn where_clause(self) -> &'static str {
        match self {
            Self::Live => "is_deleted = 0",
            Self::WithDeleted => "1 = 1",
            Self::Dirty => "is_deleted = 0 AND dirty = 1",
            Self::Deleted => "is_deleted = 1",
        }
    }
}

/// An image attachment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobData {
    /// Image width in pixels.
    pub width: i32,
    /// Image height in pixels.
    pub height: i32,
    /// Raw encoded bytes.
    pub bytes: Vec<u8>,
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Table-agnostic storage engine for one content domain.
pub struct StorageEngine {
    schema: &'static DomainSchema,
    path: PathBuf,
    conn: Mutex<Connection>,
    /// Set after a disk error; the next call probes and may reopen.
    suspect: AtomicBool,
}

impl StorageEngine {
    /// Open (creating if needed) the domain database and run its DDL.
    ///
    /// # Errors
    ///
    /// Any `SQLite` failure while opening or preparing the schema.
    pub fn open(path: impl AsRef<Path>, schema: &'static DomainSchema) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Self::open_connection(&path, schema)?;
        debug!(db = %path.display(), table = schema.main_table, "storage engine opened");
        Ok(Self { schema, path, conn: Mutex::new(conn), suspect: AtomicBool::new(false) })
    }

    /// The schema this engine serves.
    #[must_use]
    pub fn schema(&self) -> &'static DomainSchema {
        self.schema
    }

    fn open_connection(path: &Path, schema: &'static DomainSchema) -> StorageResult<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(500))?;
        // WAL keeps readers from stalling the single writer during sweeps.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(schema.ddl)?;
        Ok(conn)
    }

    /// Run `f` under the domain mutex, probing and reopening a suspect
    /// connection first. Errors classify the connection as suspect again
    /// where appropriate.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if self.suspect.swap(false, Ordering::AcqRel) {
            let healthy = guard
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok();
            if !healthy {
                warn!(db = %self.path.display(), "health probe failed; reopening database");
                // Dropping the old handle closes caches and finalizes any
                // prepared statements before the replacement opens.
                match Self::open_connection(&self.path, self.schema) {
                    Ok(fresh) => *guard = fresh,
                    Err(err) => {
                        self.suspect.store(true, Ordering::Release);
                        return Err(err);
                    },
                }
            }
        }
        let result = f(&guard);
        if let Err(err) = &result {
            if err.taints_connection() {
                self.suspect.store(true, Ordering::Release);
            }
        }
        result
    }

    fn exists(conn: &Connection, table: &str, id: i64) -> StorageResult<bool> {
        let found: Option<i64> = conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a bare record.
    ///
    /// A non-negative `requested` id is used verbatim after a presence check;
    /// a negative id asks the engine to mint one from the current time with
    /// a short duplicate-retry loop. New records are born dirty.
    ///
    /// # Errors
    ///
    /// [`StorageError::DuplicatedId`] when the requested id is taken or
    /// minting failed to find a free id.
    pub fn create(&self, requested: i64) -> StorageResult<i64> {
        self.with_conn(|conn| {
            let table = self.schema.main_table;
            let now = unix_time();
            let insert = format!(
                "INSERT INTO {table} (id, is_deleted, dirty, date_created, date_modified) \
                 VALUES (?1, 0, 1, ?2, ?2)"
            );
            if requested >= 0 {
                if Self::exists(conn, table, requested)? {
                    return Err(StorageError::DuplicatedId(requested));
                }
                conn.execute(&insert, params![requested, now])?;
                return Ok(requested);
            }
            let mut candidate = 0;
            for _ in 0..MINT_ATTEMPTS {
                candidate = mint_id();
                if !Self::exists(conn, table, candidate)? {
                    conn.execute(&insert, params![candidate, now])?;
                    return Ok(candidate);
                }
            }
            Err(StorageError::DuplicatedId(candidate))
        })
    }

    /// Hard-delete a record and its image attachments.
    ///
    /// # Errors
    ///
    /// [`StorageError::IdNotFound`] when no row was removed.
    pub fn delete(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            for (_, blob_table) in self.schema.blob_tables {
                conn.execute(&format!("DELETE FROM {blob_table} WHERE id = ?1"), params![id])?;
            }
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.schema.main_table),
                params![id],
            )?;
            if removed == 0 {
                return Err(StorageError::IdNotFound(id));
            }
            Ok(())
        })
    }

    /// Soft-delete: mark the tombstone for a sync counterpart to observe.
    ///
    /// # Errors
    ///
    /// [`StorageError::IdNotFound`] when no live row was marked.
    pub fn soft_delete(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET is_deleted = 1, dirty = 1, date_modified = ?1 \
                     WHERE id = ?2 AND is_deleted = 0",
                    self.schema.main_table
                ),
                params![unix_time(), id],
            )?;
            if changed == 0 {
                return Err(StorageError::IdNotFound(id));
            }
            Ok(())
        })
    }

    /// Id list filtered by the soft-delete/dirty flags, ordered by creation
    /// time ascending, capped at [`MAX_RESULT_ROWS`].
    pub fn get_ids(&self, filter: IdFilter) -> StorageResult<Vec<i64>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id FROM {} WHERE {} ORDER BY date_created ASC, id ASC LIMIT {}",
                self.schema.main_table,
                filter.where_clause(),
                MAX_RESULT_ROWS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Live ids whose integer field equals `value` (bookmark children
    /// lookups), creation order, capped.
    pub fn ids_where_int(&self, field_id: u32, value: i64) -> StorageResult<Vec<i64>> {
        let field = self.int_field(field_id)?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id FROM {} WHERE is_deleted = 0 AND {} = ?1 \
                 ORDER BY date_created ASC, id ASC LIMIT {}",
                self.schema.main_table, field.column, MAX_RESULT_ROWS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![value], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Clear the dirty flag on every row.
    pub fn clear_dirty(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {} SET dirty = 0 WHERE dirty = 1", self.schema.main_table),
                [],
            )?;
            Ok(())
        })
    }

    /// Hard-delete every soft-deleted tombstone and its attachments.
    pub fn clear_deleted(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            let table = self.schema.main_table;
            for (_, blob_table) in self.schema.blob_tables {
                conn.execute(
                    &format!(
                        "DELETE FROM {blob_table} WHERE id IN \
                         (SELECT id FROM {table} WHERE is_deleted = 1)"
                    ),
                    [],
                )?;
            }
            conn.execute(&format!("DELETE FROM {table} WHERE is_deleted = 1"), [])?;
            Ok(())
        })
    }

    fn field(&self, field_id: u32) -> StorageResult<&'static FieldSpec> {
        self.schema
            .field(field_id)
            .ok_or(StorageError::InvalidParameter("unknown field id"))
    }

    fn int_field(&self, field_id: u32) -> StorageResult<&'static FieldSpec> {
        let field = self.field(field_id)?;
        if field.kind != FieldKind::Int {
            return Err(StorageError::InvalidParameter("field is not an integer column"));
        }
        Ok(field)
    }

    fn text_field(&self, field_id: u32) -> StorageResult<&'static FieldSpec> {
        let field = self.field(field_id)?;
        if field.kind != FieldKind::Text {
            return Err(StorageError::InvalidParameter("field is not a text column"));
        }
        Ok(field)
    }

    /// Read a single integer column.
    ///
    /// # Errors
    ///
    /// [`StorageError::IdNotFound`] for a missing row, [`StorageError::NoData`]
    /// for a NULL value.
    pub fn get_int(&self, id: i64, field_id: u32) -> StorageResult<i64> {
        let field = self.int_field(field_id)?;
        self.with_conn(|conn| {
            let value: Option<Option<i64>> = conn
                .query_row(
                    &format!("SELECT {} FROM {} WHERE id = ?1", field.column, self.schema.main_table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match value {
                None => Err(StorageError::IdNotFound(id)),
                Some(None) => Err(StorageError::NoData),
                Some(Some(v)) => Ok(v),
            }
        })
    }

    /// Read a single string column.
    ///
    /// # Errors
    ///
    /// As [`StorageEngine::get_int`].
    pub fn get_string(&self, id: i64, field_id: u32) -> StorageResult<String> {
        let field = self.text_field(field_id)?;
        self.with_conn(|conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    &format!("SELECT {} FROM {} WHERE id = ?1", field.column, self.schema.main_table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match value {
                None => Err(StorageError::IdNotFound(id)),
                Some(None) => Err(StorageError::NoData),
                Some(Some(v)) => Ok(v),
            }
        })
    }

    /// Write a single integer column. Not an upsert: a missing row is
    /// [`StorageError::IdNotFound`], never an implicit create.
    pub fn set_int(&self, id: i64, field_id: u32, value: i64) -> StorageResult<()> {
        let field = self.int_field(field_id)?;
        self.set_column(id, field, Value::Integer(value))
    }

    /// Write a single string column. Not an upsert.
    pub fn set_string(&self, id: i64, field_id: u32, value: &str) -> StorageResult<()> {
        let field = self.text_field(field_id)?;
        self.set_column(id, field, Value::Text(value.to_owned()))
    }

    fn set_column(&self, id: i64, field: &'static FieldSpec, value: Value) -> StorageResult<()> {
        if !field.settable {
            return Err(StorageError::InvalidParameter("field is read-only"));
        }
        self.with_conn(|conn| {
            // Explicit timestamp writes must not be clobbered by the
            // bookkeeping stamp.
            let sql = if field.column.starts_with("date_") {
                format!(
                    "UPDATE {} SET {} = ?1, dirty = 1 WHERE id = ?2",
                    self.schema.main_table, field.column
                )
            } else {
                format!(
                    "UPDATE {} SET {} = ?1, dirty = 1, date_modified = ?3 WHERE id = ?2",
                    self.schema.main_table, field.column
                )
            };
            let changed = if field.column.starts_with("date_") {
                conn.execute(&sql, params![value, id])?
            } else {
                conn.execute(&sql, params![value, id, unix_time()])?
            };
            if changed == 0 {
                return Err(StorageError::IdNotFound(id));
            }
            Ok(())
        })
    }

    /// Offset-mask bulk read: returns the mask of fields actually present
    /// (NULL columns drop out) and their values in mask-bit order. Unknown
    /// mask bits are skipped, never an error.
    pub fn get_fields(
        &self,
        id: i64,
        mask: u32,
    ) -> StorageResult<(u32, Vec<(&'static FieldSpec, FieldValue)>)> {
        let wanted: Vec<&'static FieldSpec> =
            self.schema.fields.iter().filter(|f| f.mask_bit & mask != 0).collect();
        if wanted.is_empty() {
            return Err(StorageError::InvalidParameter("empty offset mask"));
        }
        self.with_conn(|conn| {
            let columns: Vec<&str> = wanted.iter().map(|f| f.column).collect();
            let sql = format!(
                "SELECT {} FROM {} WHERE id = ?1",
                columns.join(", "),
                self.schema.main_table
            );
            let row: Option<Vec<Option<FieldValue>>> = conn
                .query_row(&sql, params![id], |row| {
                    let mut values = Vec::with_capacity(wanted.len());
                    for (idx, field) in wanted.iter().enumerate() {
                        let value = match field.kind {
                            FieldKind::Int => row.get::<_, Option<i64>>(idx)?.map(FieldValue::Int),
                            FieldKind::Text => {
                                row.get::<_, Option<String>>(idx)?.map(FieldValue::Text)
                            },
                        };
                        values.push(value);
                    }
                    Ok(values)
                })
                .optional()?;
            let Some(values) = row else {
                return Err(StorageError::IdNotFound(id));
            };
            let mut present_mask = 0;
            let mut out = Vec::new();
            for (field, value) in wanted.iter().zip(values) {
                if let Some(value) = value {
                    present_mask |= field.mask_bit;
                    out.push((*field, value));
                }
            }
            Ok((present_mask, out))
        })
    }

    /// Offset-mask bulk write. Fields the caller did not supply are left
    /// untouched, never written as defaults.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidParameter`] on a bad field id or kind mismatch;
    /// [`StorageError::IdNotFound`] when the row does not exist.
    pub fn set_fields(&self, id: i64, values: &[(u32, FieldValue)]) -> StorageResult<()> {
        if values.is_empty() {
            return Err(StorageError::InvalidParameter("no fields to set"));
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut params_list: Vec<Value> = Vec::with_capacity(values.len() + 2);
        let mut touched_modified = false;
        for (field_id, value) in values {
            let field = self.field(*field_id)?;
            if !field.settable {
                return Err(StorageError::InvalidParameter("field is read-only"));
            }
            if !value.matches(field.kind) {
                return Err(StorageError::InvalidParameter("field value has the wrong type"));
            }
            touched_modified |= field.column == "date_modified";
            columns.push(field.column);
            params_list.push(value.as_sql());
        }
        self.with_conn(|conn| {
            let mut assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(idx, col)| format!("{col} = ?{}", idx + 1))
                .collect();
            assignments.push("dirty = 1".to_owned());
            let mut all_params = params_list.clone();
            if !touched_modified {
                assignments.push(format!("date_modified = ?{}", all_params.len() + 1));
                all_params.push(Value::Integer(unix_time()));
            }
            let id_slot = all_params.len() + 1;
            all_params.push(Value::Integer(id));
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ?{id_slot}",
                self.schema.main_table,
                assignments.join(", ")
            );
            let changed = conn.execute(&sql, rusqlite::params_from_iter(all_params.iter()))?;
            if changed == 0 {
                return Err(StorageError::IdNotFound(id));
            }
            Ok(())
        })
    }

    /// Read an image attachment.
    ///
    /// # Errors
    ///
    /// [`StorageError::IdNotFound`] when the record does not exist;
    /// [`StorageError::NoData`] when the record has no image of this kind.
    pub fn get_blob(&self, id: i64, blob_table: &'static str) -> StorageResult<BlobData> {
        self.with_conn(|conn| {
            if !Self::exists(conn, self.schema.main_table, id)? {
                return Err(StorageError::IdNotFound(id));
            }
            let row: Option<BlobData> = conn
                .query_row(
                    &format!("SELECT width, height, data FROM {blob_table} WHERE id = ?1"),
                    params![id],
                    |row| {
                        Ok(BlobData {
                            width: row.get(0)?,
                            height: row.get(1)?,
                            bytes: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                        })
                    },
                )
                .optional()?;
            row.ok_or(StorageError::NoData)
        })
    }

    /// Write (or replace) an image attachment and mark the record dirty.
    ///
    /// # Errors
    ///
    /// [`StorageError::IdNotFound`] when the record does not exist.
    pub fn set_blob(
        &self,
        id: i64,
        blob_table: &'static str,
        blob: &BlobData,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            if !Self::exists(conn, self.schema.main_table, id)? {
                return Err(StorageError::IdNotFound(id));
            }
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {blob_table} (id, width, height, data) \
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![id, blob.width, blob.height, blob.bytes],
            )?;
            conn.execute(
                &format!(
                    "UPDATE {} SET dirty = 1, date_modified = ?1 WHERE id = ?2",
                    self.schema.main_table
                ),
                params![unix_time(), id],
            )?;
            Ok(())
        })
    }

    /// Run a caller-built SELECT returning ids. Used by the query builder;
    /// the SQL is assembled from schema constants and `?` placeholders only.
    pub(crate) fn query_ids(&self, sql: &str, params_list: &[Value]) -> StorageResult<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params_list.iter()), |row| {
                row.get::<_, i64>(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Run a caller-built `SELECT COUNT(*)`.
    pub(crate) fn query_count(&self, sql: &str, params_list: &[Value]) -> StorageResult<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                sql,
                rusqlite::params_from_iter(params_list.iter()),
                |row| row.get(0),
            )?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }
}

/// Time-derived candidate id: millisecond stamp widened with a small random
/// suffix so two creates in the same millisecond stay distinguishable.
fn mint_id() -> i64 {
    let stamp = unix_millis() & 0x3FFF_FFFF_FFFF;
    (stamp << 10) | i64::from(rand::random::<u16>() & 0x3FF)
}

#[cfg(test)]
mod tests {
    use bdp_core::DomainFamily;
    use tempfile::TempDir;

    use super::super::schema::{
        schema_for, BlobKind, FIELD_BM_PARENT, FIELD_BM_TYPE, FIELD_DATE_CREATED, FIELD_TITLE,
        FIELD_URL,
    };
    use super::*;

    fn bookmark_engine(tmp: &TempDir) -> StorageEngine {
        let schema = schema_for(DomainFamily::Bookmark);
        StorageEngine::open(tmp.path().join(schema.db_file), schema).unwrap()
    }

    #[test]
    fn create_with_explicit_id_then_duplicate_fails() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);

        assert_eq!(engine.create(7).unwrap(), 7);
        let err = engine.create(7).unwrap_err();
        assert!(matches!(err, StorageError::DuplicatedId(7)));
        // The existing row is untouched.
        assert_eq!(engine.get_ids(IdFilter::WithDeleted).unwrap(), vec![7]);
    }

    #[test]
    fn minted_ids_are_fresh() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let id = engine.create(-1).unwrap();
            assert!(id >= 0);
            assert!(seen.insert(id), "minted id {id} twice");
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();

        engine.set_string(id, FIELD_TITLE, "T").unwrap();
        engine.set_string(id, FIELD_URL, "http://a.com").unwrap();
        engine.set_int(id, FIELD_BM_PARENT, 0).unwrap();

        assert_eq!(engine.get_string(id, FIELD_TITLE).unwrap(), "T");
        assert_eq!(engine.get_string(id, FIELD_URL).unwrap(), "http://a.com");
        assert_eq!(engine.get_int(id, FIELD_BM_PARENT).unwrap(), 0);
    }

    #[test]
    fn setter_on_missing_record_is_not_an_upsert() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);

        let err = engine.set_string(999, FIELD_TITLE, "ghost").unwrap_err();
        assert!(matches!(err, StorageError::IdNotFound(999)));
        assert!(engine.get_ids(IdFilter::WithDeleted).unwrap().is_empty());
    }

    #[test]
    fn getter_on_missing_record_reports_id_not_found() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let err = engine.get_string(12345, FIELD_TITLE).unwrap_err();
        assert!(matches!(err, StorageError::IdNotFound(12345)));
    }

    #[test]
    fn null_column_is_no_data() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();
        assert!(matches!(engine.get_string(id, FIELD_TITLE), Err(StorageError::NoData)));
    }

    #[test]
    fn soft_delete_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();

        engine.soft_delete(id).unwrap();
        assert!(!engine.get_ids(IdFilter::Live).unwrap().contains(&id));
        assert!(engine.get_ids(IdFilter::WithDeleted).unwrap().contains(&id));
        assert!(engine.get_ids(IdFilter::Deleted).unwrap().contains(&id));

        engine.clear_deleted().unwrap();
        assert!(!engine.get_ids(IdFilter::WithDeleted).unwrap().contains(&id));
    }

    #[test]
    fn hard_delete_removes_everywhere() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();
        engine.delete(id).unwrap();
        assert!(!engine.get_ids(IdFilter::WithDeleted).unwrap().contains(&id));
        assert!(matches!(engine.delete(id), Err(StorageError::IdNotFound(_))));
    }

    #[test]
    fn dirty_bookkeeping() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();

        // Created dirty.
        assert!(engine.get_ids(IdFilter::Dirty).unwrap().contains(&id));
        engine.clear_dirty().unwrap();
        assert!(engine.get_ids(IdFilter::Dirty).unwrap().is_empty());

        engine.set_string(id, FIELD_TITLE, "edited").unwrap();
        assert!(engine.get_ids(IdFilter::Dirty).unwrap().contains(&id));
    }

    #[test]
    fn id_lists_are_creation_ordered() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        engine.create(30).unwrap();
        engine.create(10).unwrap();
        engine.create(20).unwrap();
        // Same creation second: id breaks the tie.
        assert_eq!(engine.get_ids(IdFilter::Live).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn bulk_fields_round_trip_and_skip_null() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let schema = engine.schema();
        let id = engine.create(-1).unwrap();

        let title_bit = schema.field(FIELD_TITLE).unwrap().mask_bit;
        let url_bit = schema.field(FIELD_URL).unwrap().mask_bit;
        let type_bit = schema.field(FIELD_BM_TYPE).unwrap().mask_bit;

        engine
            .set_fields(
                id,
                &[
                    (FIELD_TITLE, FieldValue::Text("home".into())),
                    (FIELD_BM_TYPE, FieldValue::Int(1)),
                ],
            )
            .unwrap();

        let (present, values) = engine.get_fields(id, title_bit | url_bit | type_bit).unwrap();
        // URL was never written, so its bit drops out.
        assert_eq!(present, title_bit | type_bit);
        assert!(values
            .iter()
            .any(|(f, v)| f.id == FIELD_TITLE && *v == FieldValue::Text("home".into())));
        assert!(values.iter().any(|(f, v)| f.id == FIELD_BM_TYPE && *v == FieldValue::Int(1)));
    }

    #[test]
    fn bulk_set_rejects_kind_mismatch() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();
        let err = engine
            .set_fields(id, &[(FIELD_BM_TYPE, FieldValue::Text("folder".into()))])
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidParameter(_)));
    }

    #[test]
    fn explicit_timestamp_write_is_preserved() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let id = engine.create(-1).unwrap();
        engine.set_int(id, FIELD_DATE_CREATED, 1111).unwrap();
        assert_eq!(engine.get_int(id, FIELD_DATE_CREATED).unwrap(), 1111);
    }

    #[test]
    fn blob_attachment_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let schema = engine.schema();
        let id = engine.create(-1).unwrap();
        let table = schema.blob_table(BlobKind::Favicon).unwrap();

        // Absent image is NoData, not an error about the record.
        assert!(matches!(engine.get_blob(id, table), Err(StorageError::NoData)));

        let blob = BlobData { width: 16, height: 16, bytes: vec![1, 2, 3, 4] };
        engine.set_blob(id, table, &blob).unwrap();
        assert_eq!(engine.get_blob(id, table).unwrap(), blob);

        // Missing record stays IdNotFound.
        assert!(matches!(engine.get_blob(777, table), Err(StorageError::IdNotFound(777))));

        engine.delete(id).unwrap();
        assert!(matches!(engine.get_blob(id, table), Err(StorageError::IdNotFound(_))));
    }

    #[test]
    fn children_lookup_by_parent() {
        let tmp = TempDir::new().unwrap();
        let engine = bookmark_engine(&tmp);
        let folder = engine.create(-1).unwrap();
        let a = engine.create(-1).unwrap();
        let b = engine.create(-1).unwrap();
        engine.set_int(a, FIELD_BM_PARENT, folder).unwrap();
        engine.set_int(b, FIELD_BM_PARENT, folder).unwrap();

        let children = engine.ids_where_int(FIELD_BM_PARENT, folder).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&a) && children.contains(&b));
    }
}
