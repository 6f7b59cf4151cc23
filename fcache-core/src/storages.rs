//! Numeric ids for storage identifiers.
//!
//! Storage identifiers can be long (`home::alice`, `s3::bucket/prefix/...`).
//! Every filecache row refers to its storage by a small numeric id instead.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{OptionalExtension, params};
use tracing::{debug, info};

use crate::db::Database;
use crate::{CacheError, Result};

/// Identifiers longer than this are stored as their MD5
pub const MAX_ID_LENGTH: usize = 64;

/// Availability flags of one storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    /// Unix time of the last availability change
    pub last_checked: Option<i64>,
}

/// A storage registered in the index
#[derive(Debug, Clone)]
pub struct StorageIdentity {
    db: Database,
    storage_id: String,
    numeric_id: i64,
}

impl StorageIdentity {
    /// Look up `storage_id`, registering it when it is new
    pub fn new(db: &Database, storage_id: &str) -> Result<Self> {
        let storage_id = adjust_storage_id(storage_id);

        let numeric_id = db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO storages (id, available) VALUES (?1, 1)",
                params![storage_id],
            )?;
            if inserted > 0 {
                debug!(storage = %storage_id, "registered storage");
            }
            conn.query_row(
                "SELECT numeric_id FROM storages WHERE id = ?1",
                params![storage_id],
                |row| row.get(0),
            )
        })?;

        Ok(Self {
            db: db.clone(),
            storage_id,
            numeric_id,
        })
    }

    pub fn numeric_id(&self) -> i64 {
        self.numeric_id
    }

    /// The (possibly hashed) identifier as stored
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn availability(&self) -> Result<Availability> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT available, last_checked FROM storages WHERE numeric_id = ?1",
                    params![self.numeric_id],
                    |row| {
                        Ok(Availability {
                            available: row.get(0)?,
                            last_checked: row.get(1)?,
                        })
                    },
                )
                .optional()
            })?
            .ok_or_else(|| {
                CacheError::invalid_state(format!("storage {} was removed", self.storage_id))
            })
    }

    pub fn set_availability(&self, available: bool) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE storages SET available = ?1, last_checked = ?2 WHERE numeric_id = ?3",
                params![available, now, self.numeric_id],
            )
        })?;
        info!(storage = %self.storage_id, available, "storage availability changed");
        Ok(())
    }
}

/// Hash identifiers that are too long to store verbatim
pub fn adjust_storage_id(storage_id: &str) -> String {
    if storage_id.len() > MAX_ID_LENGTH {
        format!("{:x}", md5::compute(storage_id.as_bytes()))
    } else {
        storage_id.to_string()
    }
}

/// Identifier string of a numeric storage id
pub fn storage_id(db: &Database, numeric_id: i64) -> Result<Option<String>> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT id FROM storages WHERE numeric_id = ?1",
            params![numeric_id],
            |row| row.get(0),
        )
        .optional()
    })
}

/// Numeric id of a storage identifier, without registering it
pub fn numeric_id(db: &Database, storage_id: &str) -> Result<Option<i64>> {
    let storage_id = adjust_storage_id(storage_id);
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT numeric_id FROM storages WHERE id = ?1",
            params![storage_id],
            |row| row.get(0),
        )
        .optional()
    })
}

pub fn exists(db: &Database, storage_id: &str) -> Result<bool> {
    Ok(numeric_id(db, storage_id)?.is_some())
}

/// Drop a storage together with its filecache rows and their overlays
pub fn remove(db: &Database, storage_id: &str) -> Result<()> {
    let Some(numeric) = numeric_id(db, storage_id)? else {
        return Ok(());
    };

    db.transaction(|| {
        db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM permissions WHERE fileid IN (SELECT fileid FROM filecache WHERE storage = ?1)",
                params![numeric],
            )?;
            conn.execute("DELETE FROM filecache WHERE storage = ?1", params![numeric])?;
            conn.execute("DELETE FROM storages WHERE numeric_id = ?1", params![numeric])
        })
    })?;
    info!(storage = storage_id, "removed storage");
    Ok(())
}
