use std::collections::HashMap;

use parking_lot::RwLock;
use rusqlite::params;
use tracing::{debug, trace};

use crate::cache::DIRECTORY_MIMETYPE;
use crate::db::Database;
use crate::{CacheError, Result};

#[derive(Default)]
struct Maps {
    by_name: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
    loaded: bool,
}

/// Process-wide mapping between mimetype strings and their numeric ids.
///
/// Shared by every cache on the same database. New mimetypes are inserted
/// with insert-or-ignore and the whole mapping is reloaded afterwards, so two
/// registries racing on the same mimetype converge on the row that won.
pub struct MimetypeRegistry {
    db: Database,
    maps: RwLock<Maps>,
}

impl MimetypeRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Id of `mimetype` if it is already known, without inserting it
    pub fn id_of(&self, mimetype: &str) -> Result<Option<i64>> {
        self.ensure_loaded()?;
        if let Some(&id) = self.maps.read().by_name.get(mimetype) {
            return Ok(Some(id));
        }
        // another registry may have added it since our last load
        self.reload()?;
        Ok(self.maps.read().by_name.get(mimetype).copied())
    }

    /// Id of `mimetype`, registering it first when needed
    pub fn get_id(&self, mimetype: &str) -> Result<i64> {
        if let Some(id) = self.id_of(mimetype)? {
            return Ok(id);
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO mimetypes (mimetype) VALUES (?1)",
                params![mimetype],
            )
        })?;
        debug!(mimetype, "registered mimetype");
        self.reload()?;

        self.maps
            .read()
            .by_name
            .get(mimetype)
            .copied()
            .ok_or_else(|| {
                CacheError::invalid_state(format!("mimetype {mimetype} vanished after insert"))
            })
    }

    /// Mimetype string for `id`
    pub fn mimetype(&self, id: i64) -> Result<Option<String>> {
        self.ensure_loaded()?;
        if let Some(name) = self.maps.read().by_id.get(&id) {
            return Ok(Some(name.clone()));
        }
        self.reload()?;
        Ok(self.maps.read().by_id.get(&id).cloned())
    }

    pub fn exists(&self, mimetype: &str) -> Result<bool> {
        Ok(self.id_of(mimetype)?.is_some())
    }

    /// Forget the in-memory mapping; the next lookup reloads it
    pub fn reset(&self) {
        *self.maps.write() = Maps::default();
    }

    /// Retag every file named `*.extension` with `mimetype_id`.
    ///
    /// Folders are left alone. Returns the number of rows changed.
    pub fn update_filecache(&self, extension: &str, mimetype_id: i64) -> Result<usize> {
        let folder_id = self.get_id(DIRECTORY_MIMETYPE)?;
        let mimetype = self
            .mimetype(mimetype_id)?
            .ok_or_else(|| {
                CacheError::invalid_state(format!("unknown mimetype id {mimetype_id}"))
            })?;
        let part_id = self.get_id(mimepart_of(&mimetype))?;
        let pattern = format!("%.{}", extension.to_lowercase());

        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE filecache SET mimetype = ?1, mimepart = ?2
                 WHERE mimetype != ?1 AND mimetype != ?3 AND LOWER(name) LIKE ?4",
                params![mimetype_id, part_id, folder_id, pattern],
            )
        })?;
        debug!(extension, mimetype = %mimetype, changed, "updated filecache mimetypes");
        Ok(changed)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.maps.read().loaded {
            return Ok(());
        }
        self.reload()
    }

    fn reload(&self) -> Result<()> {
        let rows: Vec<(i64, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id, mimetype FROM mimetypes")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        trace!(count = rows.len(), "loaded mimetypes");

        let mut maps = self.maps.write();
        maps.by_name.clear();
        maps.by_id.clear();
        for (id, name) in rows {
            maps.by_name.insert(name.clone(), id);
            maps.by_id.insert(id, name);
        }
        maps.loaded = true;
        Ok(())
    }
}

/// Part of a mimetype before the `/`
pub fn mimepart_of(mimetype: &str) -> &str {
    mimetype.split('/').next().unwrap_or(mimetype)
}
