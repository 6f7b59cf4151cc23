//! Per-user permission overlay.
//!
//! Rows keyed by `(fileid, user)` that replace the backend-reported
//! permission bits of an entry for one user.

use std::collections::HashMap;

use rusqlite::{OptionalExtension, params, params_from_iter};
use tracing::trace;

use crate::Result;
use crate::cache::FileId;
use crate::db::Database;

const CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct Permissions {
    db: Database,
}

impl Permissions {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Overlay bits of `file_id` for `user`
    pub fn get(&self, file_id: FileId, user: &str) -> Result<Option<u32>> {
        self.db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT permissions FROM permissions WHERE fileid = ?1 AND user = ?2",
            )?
            .query_row(params![file_id.0, user], |row| row.get(0))
                .optional()
        })
    }

    /// Insert or replace the overlay for `user`
    pub fn set(&self, file_id: FileId, user: &str, permissions: u32) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO permissions (fileid, user, permissions) VALUES (?1, ?2, ?3)
                 ON CONFLICT (fileid, user) DO UPDATE SET permissions = excluded.permissions",
            )?
            .execute(params![file_id.0, user, permissions])
        })?;
        trace!(file_id = file_id.0, user, permissions, "set permissions");
        Ok(())
    }

    /// Overlays of several files for one user; files without one are absent
    pub fn get_multiple(&self, file_ids: &[FileId], user: &str) -> Result<HashMap<FileId, u32>> {
        let mut result = HashMap::with_capacity(file_ids.len());
        for chunk in file_ids.chunks(CHUNK_SIZE) {
            let marks: Vec<String> = (0..chunk.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = format!(
                "SELECT fileid, permissions FROM permissions WHERE user = ?1 AND fileid IN ({})",
                marks.join(", ")
            );
            let mut values: Vec<rusqlite::types::Value> = vec![user.to_string().into()];
            values.extend(chunk.iter().map(|id| id.0.into()));

            let rows: Vec<(i64, u32)> = self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect()
            })?;
            result.extend(rows.into_iter().map(|(id, perms)| (FileId(id), perms)));
        }
        Ok(result)
    }

    /// Overlays of every direct child of folder `parent` for `user`
    pub fn get_directory_permissions(
        &self,
        parent: FileId,
        user: &str,
    ) -> Result<HashMap<FileId, u32>> {
        let rows: Vec<(i64, u32)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT p.fileid, p.permissions FROM permissions p
                 INNER JOIN filecache f ON f.fileid = p.fileid
                 WHERE f.parent = ?1 AND p.user = ?2",
            )?;
            let rows =
                stmt.query_map(params![parent.0, user], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        Ok(rows.into_iter().map(|(id, perms)| (FileId(id), perms)).collect())
    }

    /// Drop the overlay of one user, or of all users when `user` is `None`
    pub fn remove(&self, file_id: FileId, user: Option<&str>) -> Result<()> {
        self.db.with_conn(|conn| match user {
            Some(user) => conn.execute(
                "DELETE FROM permissions WHERE fileid = ?1 AND user = ?2",
                params![file_id.0, user],
            ),
            None => conn.execute("DELETE FROM permissions WHERE fileid = ?1", params![file_id.0]),
        })?;
        Ok(())
    }

    pub fn remove_multiple(&self, file_ids: &[FileId], user: &str) -> Result<()> {
        self.db.transaction(|| {
            for id in file_ids {
                self.remove(*id, Some(user))?;
            }
            Ok(())
        })
    }

    /// Users holding an overlay on `file_id`
    pub fn users(&self, file_id: FileId) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT user FROM permissions WHERE fileid = ?1 ORDER BY user")?;
            let rows = stmt.query_map(params![file_id.0], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// The overlay if `user` has one, otherwise the backend bits
    pub fn effective(&self, file_id: FileId, user: &str, backend: u32) -> Result<u32> {
        Ok(self.get(file_id, user)?.unwrap_or(backend))
    }
}
