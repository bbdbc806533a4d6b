//! SQLite-backed event log.
//!
//! The whole log is a single file containing one table, `events`. The file is
//! committed to git as-is, so the store must leave nothing beside it: the
//! connection runs in rollback-journal (`DELETE`) mode and every write is
//! committed before the call returns.
//!
//! # Schema
//!
//! The table shape is fixed. `ensure_schema` creates it when missing and
//! refuses to touch a file whose `events` table has any other shape; there are
//! no migrations.
//!
//! # Handle lifetime
//!
//! An `EventStore` is meant to live for a single capture attempt. Close it
//! (or use [`capture`]) before the file is staged, and never keep one open
//! across a hard reset of the working tree.


use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::{ffi, params, Connection, ErrorCode};
use thiserror::Error;
use tracing::debug;

use crate::event::{EventKind, EventRecord, RecordId};

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    event TEXT NOT NULL
);
"#;

/// Expected `(name, is_primary_key)` for each column, in declaration order.
const EVENT_COLUMNS: [(&str, bool); 4] = [
    ("id", true),
    ("timestamp", false),
    ("kind", false),
    ("event", false),
];

/// Errors raised by the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The file could not be opened, created, read or written.
    #[error("storage unavailable ({operation}): {message}")]
    StorageUnavailable {
        operation: &'static str,
        message: String,
    },

    /// An `events` table exists but does not have the expected columns.
    #[error("events table has an incompatible shape: found columns [{found}]")]
    Schema { found: String },

    /// A row with this id is already present in the local file.
    #[error("duplicate record id {0}")]
    DuplicateKey(RecordId),

    /// A stored row carries a kind this build does not know.
    #[error("record {id} has unrecognized kind '{kind}'")]
    UnknownKind { id: String, kind: String },
}

impl StoreError {
    pub(crate) fn unavailable(operation: &'static str, error: impl fmt::Display) -> Self {
        StoreError::StorageUnavailable {
            operation,
            message: error.to_string(),
        }
    }
}

/// Open handle on the event log file.
pub struct EventStore {
    conn: Connection,
    path: PathBuf,
}

impl EventStore {
    /// Open the log at `path`, creating an empty file if none exists.
    ///
    /// Fails with `StorageUnavailable` when the location is not writable or
    /// the file is not a SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::unavailable("open database", format!("{}: {}", path.display(), e))
        })?;

        Self::configure(&conn)?;

        // SQLite silently falls back to read-only for unwritable files.
        let read_only = match std::fs::metadata(path) {
            Ok(meta) => meta.permissions().readonly(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::unavailable("check database access", e)),
        };
        if read_only {
            return Err(StoreError::unavailable(
                "open database",
                format!("{} is not writable", path.display()),
            ));
        }

        debug!("Opened event store at {}", path.display());

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::unavailable("open database", e))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Journal and sync settings.
    ///
    /// Committed rows must live in the main file, never in `-wal`/`-shm`
    /// sidecars. Setting the journal mode reads the file header, which is
    /// where a corrupt or foreign file is first detected.
    fn configure(conn: &Connection) -> Result<(), StoreError> {
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))
            .map_err(|e| StoreError::unavailable("set journal_mode", e))?;

        if !journal_mode.eq_ignore_ascii_case("delete")
            && !journal_mode.eq_ignore_ascii_case("memory")
        {
            return Err(StoreError::unavailable(
                "configure journal_mode",
                format!("SQLite returned '{}' instead of 'delete'", journal_mode),
            ));
        }

        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| StoreError::unavailable("set synchronous", e))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the `events` table if it is missing, then check its shape.
    ///
    /// Safe to call on every open; never modifies existing rows.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(CREATE_EVENTS_TABLE)
            .map_err(|e| StoreError::unavailable("create events table", e))?;

        let columns = self.event_columns()?;
        let matches = columns.len() == EVENT_COLUMNS.len()
            && columns
                .iter()
                .zip(EVENT_COLUMNS.iter())
                .all(|((name, pk), (expected, expected_pk))| {
                    name == expected && pk == expected_pk
                });

        if !matches {
            let found = columns
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StoreError::Schema { found });
        }

        Ok(())
    }

    fn event_columns(&self) -> Result<Vec<(String, bool)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info(events)")
            .map_err(|e| StoreError::unavailable("inspect events table", e))?;

        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let pk: i64 = row.get(5)?;
                Ok((name, pk > 0))
            })
            .map_err(|e| StoreError::unavailable("inspect events table", e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::unavailable("inspect events table", e))
    }

    /// Append one row. The row is committed (and synced) before this returns.
    pub fn insert(&mut self, record: &EventRecord) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StoreError::unavailable("begin insert", e))?;

        tx.execute(
            "INSERT INTO events (id, timestamp, kind, event) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.0,
                record.timestamp,
                record.kind.as_str(),
                record.event
            ],
        )
        .map_err(|e| insert_error(e, &record.id))?;

        tx.commit()
            .map_err(|e| StoreError::unavailable("commit insert", e))?;

        debug!("Inserted record {} ({})", record.id, record.kind);
        Ok(())
    }

    /// Number of rows in the log.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(|e| StoreError::unavailable("count events", e))?;

        usize::try_from(count).map_err(|_| {
            StoreError::unavailable("count events", format!("invalid row count {}", count))
        })
    }

    /// Every row, oldest first (ties broken by id).
    pub fn records(&self) -> Result<Vec<EventRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, timestamp, kind, event FROM events ORDER BY timestamp, id")
            .map_err(|e| StoreError::unavailable("list events", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| StoreError::unavailable("list events", e))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, timestamp, kind, event) =
                row.map_err(|e| StoreError::unavailable("list events", e))?;
            let kind: EventKind = kind.parse().map_err(|_| StoreError::UnknownKind {
                id: id.clone(),
                kind: kind.clone(),
            })?;
            records.push(EventRecord {
                id: RecordId(id),
                timestamp,
                kind,
                event,
            });
        }

        Ok(records)
    }

    /// Release the connection. Must happen before the file is staged.
    pub fn close(self) -> Result<(), StoreError> {
        let path = self.path;
        self.conn
            .close()
            .map_err(|(_, e)| StoreError::unavailable("close database", e))?;
        debug!("Closed event store at {}", path.display());
        Ok(())
    }
}

fn insert_error(error: rusqlite::Error, id: &RecordId) -> StoreError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::DuplicateKey(id.clone())
        }
        _ => StoreError::unavailable("insert event", error),
    }
}

/// Write one record into the log at `path`: open, ensure the schema, insert,
/// close. The handle never outlives the call.
pub fn capture(path: &Path, record: &EventRecord) -> Result<(), StoreError> {
    let mut store = EventStore::open(path)?;
    store.ensure_schema()?;
    store.insert(record)?;
    store.close()
}

/// Remove the log file at `path`, returning whether anything was removed.
///
/// Used when an attempt started from a branch with no published commit, so
/// there is no earlier version of the file to reset to.
pub fn discard(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::unavailable(
            "remove database",
            format!("{}: {}", path.display(), e),
        )),
    }
}
