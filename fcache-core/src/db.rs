//! SQLite persistence shared by every cache component.
//!
//! One connection sits behind a re-entrant lock: a thread holding the lock may
//! call back into other components without deadlocking, which lets a scanner
//! pass run its whole children reconciliation in one transaction.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::Result;

/// Bump when the schema below changes.
pub const SCHEMA_VERSION: &str = "3";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS storages (
        numeric_id   INTEGER PRIMARY KEY AUTOINCREMENT,
        id           TEXT NOT NULL UNIQUE,
        available    INTEGER NOT NULL DEFAULT 1,
        last_checked INTEGER
    );

    CREATE TABLE IF NOT EXISTS mimetypes (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        mimetype TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS filecache (
        fileid           INTEGER PRIMARY KEY AUTOINCREMENT,
        storage          INTEGER NOT NULL,
        path             TEXT NOT NULL,
        path_hash        TEXT NOT NULL,
        parent           INTEGER NOT NULL,
        name             TEXT NOT NULL,
        mimetype         INTEGER NOT NULL,
        mimepart         INTEGER NOT NULL,
        size             INTEGER NOT NULL DEFAULT -1,
        mtime            INTEGER NOT NULL DEFAULT 0,
        storage_mtime    INTEGER NOT NULL DEFAULT 0,
        encrypted        INTEGER NOT NULL DEFAULT 0,
        unencrypted_size INTEGER NOT NULL DEFAULT 0,
        etag             TEXT NOT NULL DEFAULT '',
        permissions      INTEGER NOT NULL DEFAULT 0,
        extra            BLOB,
        UNIQUE (storage, path_hash)
    );
    CREATE INDEX IF NOT EXISTS fs_parent_name ON filecache (parent, name);
    CREATE INDEX IF NOT EXISTS fs_storage_size ON filecache (storage, size, fileid);
    CREATE INDEX IF NOT EXISTS fs_storage_mimetype ON filecache (storage, mimetype);
    CREATE INDEX IF NOT EXISTS fs_storage_mimepart ON filecache (storage, mimepart);

    CREATE TABLE IF NOT EXISTS permissions (
        fileid      INTEGER NOT NULL,
        user        TEXT NOT NULL,
        permissions INTEGER NOT NULL,
        UNIQUE (fileid, user)
    );

    CREATE TABLE IF NOT EXISTS vcategory (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        uid      TEXT NOT NULL,
        type     TEXT NOT NULL,
        category TEXT NOT NULL,
        UNIQUE (uid, type, category)
    );

    CREATE TABLE IF NOT EXISTS vcategory_to_object (
        objid      INTEGER NOT NULL,
        categoryid INTEGER NOT NULL,
        type       TEXT NOT NULL,
        PRIMARY KEY (categoryid, objid, type)
    );

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

struct Handle {
    conn: Connection,
    /// Open transaction scopes on this connection; 0 means autocommit.
    depth: Cell<u32>,
}

/// Shared handle to the index database
#[derive(Clone)]
pub struct Database {
    inner: Arc<ReentrantMutex<Handle>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// SQL helpers used by the cache queries.
///
/// `unicode_lower(text)` lowercases the full Unicode range; the built-in
/// `lower()` and `LIKE` only fold ASCII.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|text| text.to_lowercase()))
        },
    )
}

impl Database {
    /// Open (or create) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        debug!(path = %path.display(), "opened index database");
        Self::from_connection(conn)
    }

    /// Fresh private database, used by tests and throwaway scans.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL)?;
        register_functions(&conn)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                warn!(found = %v, expected = SCHEMA_VERSION, "index schema version mismatch");
            }
            Some(_) => {}
        }

        Ok(Self {
            inner: Arc::new(ReentrantMutex::new(Handle {
                conn,
                depth: Cell::new(0),
            })),
        })
    }

    /// Run `f` against the connection while holding the lock.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.inner.lock();
        Ok(f(&guard.conn)?)
    }

    /// Run `f` inside a transaction.
    ///
    /// The outermost call opens `BEGIN IMMEDIATE`; nested calls on the same
    /// thread use savepoints, so an `Err` rolls back only its own scope.
    pub fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = self.inner.lock();
        let depth = guard.depth.get();

        if depth == 0 {
            guard.conn.execute_batch("BEGIN IMMEDIATE")?;
        } else {
            guard.conn.execute_batch(&format!("SAVEPOINT sp_{depth}"))?;
        }
        guard.depth.set(depth + 1);

        let result = f();
        guard.depth.set(depth);

        let finish = match (&result, depth) {
            (Ok(_), 0) => guard.conn.execute_batch("COMMIT"),
            (Ok(_), _) => guard.conn.execute_batch(&format!("RELEASE sp_{depth}")),
            (Err(_), 0) => guard.conn.execute_batch("ROLLBACK"),
            (Err(_), _) => guard
                .conn
                .execute_batch(&format!("ROLLBACK TO sp_{depth}; RELEASE sp_{depth}")),
        };

        match finish {
            Ok(()) => result,
            Err(e) if result.is_err() => {
                warn!(error = %e, "rollback failed");
                result
            }
            Err(e) => Err(e.into()),
        }
    }
}
