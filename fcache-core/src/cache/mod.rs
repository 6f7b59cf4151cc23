mod entry;
mod home;
mod search;

pub use entry::{
    CacheEntry, CacheStatus, DIRECTORY_MIMETYPE, Entry, EntryData, FileId, PERMISSION_ALL,
    PERMISSION_CREATE, PERMISSION_DELETE, PERMISSION_READ, PERMISSION_SHARE, PERMISSION_UPDATE,
    SIZE_UNKNOWN,
};

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::db::Database;
use crate::error::is_unique_violation;
use crate::events::Emitter;
use crate::mimetype::{MimetypeRegistry, mimepart_of};
use crate::path;
use crate::storages::{self, StorageIdentity};
use crate::{CacheError, Result};

const SELECT_COLUMNS: &str = "fileid, storage, path, parent, name, mimetype, mimepart, size, mtime, \
     storage_mtime, encrypted, unencrypted_size, etag, permissions, extra";

/// Max bound parameters per `IN (...)` statement
const CHUNK_SIZE: usize = 500;

/// Shared pieces every cache on one index is built from
#[derive(Clone)]
pub struct CacheContext {
    db: Database,
    mimetypes: Arc<MimetypeRegistry>,
    config: CacheConfig,
}

impl CacheContext {
    pub fn new(db: Database, config: CacheConfig) -> Self {
        let mimetypes = Arc::new(MimetypeRegistry::new(db.clone()));
        Self {
            db,
            mimetypes,
            config,
        }
    }

    /// Context over a private in-memory database
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, CacheConfig::default()))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn mimetypes(&self) -> &Arc<MimetypeRegistry> {
        &self.mimetypes
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

/// Change notifications emitted by a cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Inserted {
        storage: i64,
        path: String,
        file_id: FileId,
    },
    Updated {
        storage: i64,
        path: String,
        file_id: FileId,
    },
    Removed {
        storage: i64,
        path: String,
        file_id: FileId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Standard,
    /// Personal storage whose visible size is the size of `files`
    Home,
}

/// Row as stored, before mimetype ids are resolved
struct RawRow {
    file_id: i64,
    storage: i64,
    path: String,
    parent: i64,
    name: String,
    mimetype: i64,
    mimepart: i64,
    size: i64,
    mtime: i64,
    storage_mtime: i64,
    encrypted: bool,
    unencrypted_size: i64,
    etag: String,
    permissions: u32,
    extra: Option<Vec<u8>>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        file_id: row.get(0)?,
        storage: row.get(1)?,
        path: row.get(2)?,
        parent: row.get(3)?,
        name: row.get(4)?,
        mimetype: row.get(5)?,
        mimepart: row.get(6)?,
        size: row.get(7)?,
        mtime: row.get(8)?,
        storage_mtime: row.get(9)?,
        encrypted: row.get(10)?,
        unencrypted_size: row.get(11)?,
        etag: row.get(12)?,
        permissions: row.get(13)?,
        extra: row.get(14)?,
    })
}

fn encode_extra(extra: &BTreeMap<String, String>) -> Result<Option<Vec<u8>>> {
    if extra.is_empty() {
        return Ok(None);
    }
    postcard::to_allocvec(extra)
        .map(Some)
        .map_err(|e| CacheError::Encoding(format!("Failed to serialize extra metadata: {}", e)))
}

fn decode_extra(bytes: Option<&[u8]>) -> Result<BTreeMap<String, String>> {
    match bytes {
        None | Some([]) => Ok(BTreeMap::new()),
        Some(bytes) => postcard::from_bytes(bytes).map_err(|e| {
            CacheError::Encoding(format!("Failed to deserialize extra metadata: {}", e))
        }),
    }
}

/// `?, ?, ?` for `n` parameters
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Metadata index of one storage.
///
/// Rows are keyed by `(storage, path_hash)` and by file id. Paths are
/// normalized on the way in; lookups that find nothing return `None`.
pub struct Cache {
    db: Database,
    mimetypes: Arc<MimetypeRegistry>,
    storage: StorageIdentity,
    layout: Layout,
    partial: Mutex<LruCache<String, EntryData>>,
    events: Emitter<CacheEvent>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("storage", &self.storage.storage_id())
            .field("numeric_id", &self.storage.numeric_id())
            .field("layout", &self.layout)
            .finish()
    }
}

impl Cache {
    /// Cache for `storage_id`, registering the storage if needed
    pub fn new(ctx: &CacheContext, storage_id: &str) -> Result<Self> {
        Self::with_layout(ctx, storage_id, Layout::Standard)
    }

    /// Cache for a personal storage laid out as `files`, `files_trashbin`, `files_versions`
    pub fn new_home(ctx: &CacheContext, storage_id: &str) -> Result<Self> {
        Self::with_layout(ctx, storage_id, Layout::Home)
    }

    fn with_layout(ctx: &CacheContext, storage_id: &str, layout: Layout) -> Result<Self> {
        let storage = StorageIdentity::new(&ctx.db, storage_id)?;
        let capacity =
            NonZeroUsize::new(ctx.config.partial_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            db: ctx.db.clone(),
            mimetypes: Arc::clone(&ctx.mimetypes),
            storage,
            layout,
            partial: Mutex::new(LruCache::new(capacity)),
            events: Emitter::new(),
        })
    }

    pub fn numeric_id(&self) -> i64 {
        self.storage.numeric_id()
    }

    pub fn storage_id(&self) -> &str {
        self.storage.storage_id()
    }

    pub fn storage_identity(&self) -> &StorageIdentity {
        &self.storage
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn mimetypes(&self) -> &MimetypeRegistry {
        &self.mimetypes
    }

    pub fn is_home(&self) -> bool {
        self.layout == Layout::Home
    }

    /// Receive `Inserted`, `Updated` and `Removed` notifications
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // ---- lookups ----

    /// Persisted entry for `path`, or the buffered partial data if only that exists
    pub fn get(&self, path: &str) -> Result<Option<Entry>> {
        let path = path::normalize(path);
        if let Some(entry) = self.get_entry(&path)? {
            return Ok(Some(Entry::Cached(entry)));
        }
        Ok(self.partial.lock().get(&path).cloned().map(Entry::Partial))
    }

    /// Persisted entry for `path`
    pub fn get_entry(&self, path: &str) -> Result<Option<CacheEntry>> {
        let path = path::normalize(path);
        let mut entry = self.fetch_by_path(&path)?;
        if let Some(entry) = entry.as_mut() {
            self.apply_home_root_size(entry)?;
        }
        Ok(entry)
    }

    /// Persisted entry with `id` in this storage
    pub fn get_by_id(&self, id: FileId) -> Result<Option<CacheEntry>> {
        let raw = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM filecache WHERE fileid = ?1 AND storage = ?2"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.query_row(params![id.0, self.numeric_id()], read_row).optional()
        })?;
        let mut entry = raw.map(|raw| self.to_entry(raw)).transpose()?;
        if let Some(entry) = entry.as_mut() {
            self.apply_home_root_size(entry)?;
        }
        Ok(entry)
    }

    /// Row for a normalized path, without any layout adjustments
    pub(crate) fn fetch_by_path(&self, path: &str) -> Result<Option<CacheEntry>> {
        let raw = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM filecache WHERE storage = ?1 AND path_hash = ?2 AND path = ?3"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.query_row(params![self.numeric_id(), path::hash(path), path], read_row)
                .optional()
        })?;
        raw.map(|raw| self.to_entry(raw)).transpose()
    }

    fn to_entry(&self, raw: RawRow) -> Result<CacheEntry> {
        let mimetype = self.mimetype_name(raw.mimetype)?;
        let mimepart = self.mimetype_name(raw.mimepart)?;
        Ok(CacheEntry {
            file_id: FileId(raw.file_id),
            storage: raw.storage,
            path: raw.path,
            parent: (raw.parent >= 0).then_some(FileId(raw.parent)),
            name: raw.name,
            mimetype,
            mimepart,
            size: raw.size,
            mtime: raw.mtime,
            storage_mtime: raw.storage_mtime,
            etag: raw.etag,
            permissions: raw.permissions,
            encrypted: raw.encrypted,
            unencrypted_size: raw.unencrypted_size,
            extra: decode_extra(raw.extra.as_deref())?,
        })
    }

    fn mimetype_name(&self, id: i64) -> Result<String> {
        self.mimetypes
            .mimetype(id)?
            .ok_or_else(|| CacheError::invalid_state(format!("unknown mimetype id {id}")))
    }

    fn query_entries(&self, sql: &str, values: Vec<Value>) -> Result<Vec<CacheEntry>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(|raw| self.to_entry(raw)).collect()
    }

    /// Direct children of the folder at `path`, ordered by name
    pub fn folder_contents(&self, path: &str) -> Result<Vec<CacheEntry>> {
        match self.id(path)? {
            Some(id) => self.folder_contents_by_id(id),
            None => Ok(Vec::new()),
        }
    }

    /// Direct children of folder `id`; unknown or negative ids yield nothing
    pub fn folder_contents_by_id(&self, id: FileId) -> Result<Vec<CacheEntry>> {
        if id.0 < 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM filecache WHERE parent = ?1 AND storage = ?2 ORDER BY name ASC"
        );
        self.query_entries(&sql, vec![Value::Integer(id.0), Value::Integer(self.numeric_id())])
    }

    pub fn id(&self, path: &str) -> Result<Option<FileId>> {
        let path = path::normalize(path);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT fileid FROM filecache WHERE storage = ?1 AND path_hash = ?2 AND path = ?3",
            )?;
            stmt.query_row(params![self.numeric_id(), path::hash(&path), path], |row| {
                row.get(0).map(FileId)
            })
            .optional()
        })
    }

    /// Id of the folder containing `path`; the root has no parent
    pub fn parent_id(&self, path: &str) -> Result<Option<FileId>> {
        let path = path::normalize(path);
        if path.is_empty() {
            return Ok(None);
        }
        self.id(path::parent(&path))
    }

    /// Whether the path is persisted or buffered
    pub fn in_cache(&self, path: &str) -> Result<bool> {
        Ok(self.status(path)? != CacheStatus::NotFound)
    }

    pub fn status(&self, path: &str) -> Result<CacheStatus> {
        let path = path::normalize(path);
        let size: Option<i64> = self.db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT size FROM filecache WHERE storage = ?1 AND path_hash = ?2 AND path = ?3",
            )?
            .query_row(params![self.numeric_id(), path::hash(&path), path], |row| row.get(0))
            .optional()
        })?;
        let size = match size {
            Some(size) => Some(self.home_root_size(&path)?.unwrap_or(size)),
            None => None,
        };

        Ok(match size {
            Some(size) if size < 0 => CacheStatus::Shallow,
            Some(_) => CacheStatus::Complete,
            None if self.partial.lock().contains(&path) => CacheStatus::Partial,
            None => CacheStatus::NotFound,
        })
    }

    pub fn path_by_id(&self, id: FileId) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.prepare_cached("SELECT path FROM filecache WHERE fileid = ?1 AND storage = ?2")?
                .query_row(params![id.0, self.numeric_id()], |row| row.get(0))
                .optional()
        })
    }

    /// Storage identifier and path of `id`, in whichever storage holds it
    pub fn global_path_and_storage(db: &Database, id: FileId) -> Result<Option<(String, String)>> {
        db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT s.id, f.path FROM filecache f
                 INNER JOIN storages s ON s.numeric_id = f.storage
                 WHERE f.fileid = ?1",
            )?
            .query_row(params![id.0], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
        })
    }

    /// All file ids of this storage
    pub fn all_ids(&self) -> Result<Vec<FileId>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT fileid FROM filecache WHERE storage = ?1")?;
            let ids = stmt.query_map(params![self.numeric_id()], |row| row.get(0).map(FileId))?;
            ids.collect()
        })
    }

    /// A folder still waiting for its size, newest id first
    pub fn incomplete(&self) -> Result<Option<String>> {
        let id: Option<i64> = self.db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT fileid FROM filecache WHERE storage = ?1 AND size < 0
                 ORDER BY fileid DESC LIMIT 1",
            )?
            .query_row(params![self.numeric_id()], |row| row.get(0))
            .optional()
        })?;
        match id {
            Some(id) => self.path_by_id(FileId(id)),
            None => Ok(None),
        }
    }

    /// Number of direct children of `id` whose size is unknown
    pub fn incomplete_children_count(&self, id: FileId) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT COUNT(*) FROM filecache WHERE parent = ?1 AND storage = ?2 AND size < 0",
            )?
            .query_row(params![id.0, self.numeric_id()], |row| row.get(0))
        })
    }

    // ---- writes ----

    /// Insert or update `path`.
    ///
    /// Returns `None` when the data is still incomplete and was buffered.
    pub fn put(&self, path: &str, data: EntryData) -> Result<Option<FileId>> {
        let path = path::normalize(path);
        match self.id(&path)? {
            Some(id) => {
                self.update(id, &data)?;
                Ok(Some(id))
            }
            None => self.insert(&path, data),
        }
    }

    /// Insert a new row, merging any partial data buffered for the path.
    ///
    /// Incomplete data is buffered and `None` returned. A row inserted
    /// concurrently for the same path is updated instead.
    pub fn insert(&self, path: &str, data: EntryData) -> Result<Option<FileId>> {
        let path = path::normalize(path);

        let data = {
            let mut partial = self.partial.lock();
            let mut merged = partial.pop(&path).unwrap_or_default();
            merged.merge(data);
            if !merged.is_complete() {
                trace!(path = %path, "buffering partial entry");
                partial.put(path, merged);
                return Ok(None);
            }
            merged
        };

        let parent = if path.is_empty() {
            -1
        } else {
            match self.id(path::parent(&path))? {
                Some(id) => id.0,
                None => {
                    return Err(CacheError::invalid_state(format!(
                        "parent folder not in cache for {path}"
                    )));
                }
            }
        };

        let (mimetype, mimepart) = match data.mimetype.as_deref() {
            Some(mimetype) => self.mimetype_ids(mimetype)?,
            None => return Err(CacheError::invalid_state(format!("no mimetype for {path}"))),
        };
        let mtime = data.mtime.unwrap_or_default();
        let extra = match &data.extra {
            Some(extra) => encode_extra(extra)?,
            None => None,
        };

        let inserted = self.db.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO filecache (storage, path, path_hash, parent, name, mimetype, mimepart,
                    size, mtime, storage_mtime, encrypted, unencrypted_size, etag, permissions, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?
            .execute(params![
                self.numeric_id(),
                path,
                path::hash(&path),
                parent,
                path::basename(&path),
                mimetype,
                mimepart,
                data.size.unwrap_or(SIZE_UNKNOWN),
                mtime,
                data.storage_mtime.unwrap_or(mtime),
                data.encrypted.unwrap_or(false),
                data.unencrypted_size.unwrap_or(0),
                data.etag.as_deref().unwrap_or(""),
                data.permissions.unwrap_or(0),
                extra,
            ])?;
            Ok(FileId(conn.last_insert_rowid()))
        });

        match inserted {
            Ok(file_id) => {
                trace!(path = %path, file_id = file_id.0, "inserted entry");
                self.events.emit(CacheEvent::Inserted {
                    storage: self.numeric_id(),
                    path,
                    file_id,
                });
                Ok(Some(file_id))
            }
            Err(CacheError::Database(e)) if is_unique_violation(&e) => {
                debug!(path = %path, "entry inserted concurrently, updating instead");
                match self.id(&path)? {
                    Some(id) => {
                        self.update(id, &data)?;
                        Ok(Some(id))
                    }
                    None => Err(CacheError::Database(e)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn mimetype_ids(&self, mimetype: &str) -> Result<(i64, i64)> {
        let id = self.mimetypes.get_id(mimetype)?;
        let part = self.mimetypes.get_id(mimepart_of(mimetype))?;
        Ok((id, part))
    }

    /// Apply the set fields of `data` to row `id`.
    ///
    /// Only columns whose value actually differs are written. Returns whether
    /// the row changed.
    pub fn update(&self, id: FileId, data: &EntryData) -> Result<bool> {
        let mut columns: Vec<(&'static str, Value)> = Vec::new();

        if let Some(new_path) = &data.path {
            let new_path = path::normalize(new_path);
            let parent = if new_path.is_empty() {
                -1
            } else {
                self.id(path::parent(&new_path))?
                    .ok_or_else(|| {
                        CacheError::invalid_state(format!(
                            "parent folder not in cache for {new_path}"
                        ))
                    })?
                    .0
            };
            columns.push(("path_hash", Value::Text(path::hash(&new_path))));
            columns.push(("name", Value::Text(path::basename(&new_path).to_string())));
            columns.push(("parent", Value::Integer(parent)));
            columns.push(("path", Value::Text(new_path)));
        }
        if let Some(size) = data.size {
            columns.push(("size", Value::Integer(size)));
        }
        if let Some(mtime) = data.mtime {
            columns.push(("mtime", Value::Integer(mtime)));
        }
        if let Some(storage_mtime) = data.storage_mtime {
            columns.push(("storage_mtime", Value::Integer(storage_mtime)));
            if data.mtime.is_none() && !data.preserve_mtime {
                columns.push(("mtime", Value::Integer(storage_mtime)));
            }
        }
        if let Some(mimetype) = &data.mimetype {
            let (mimetype, mimepart) = self.mimetype_ids(mimetype)?;
            columns.push(("mimetype", Value::Integer(mimetype)));
            columns.push(("mimepart", Value::Integer(mimepart)));
        }
        if let Some(etag) = &data.etag {
            columns.push(("etag", Value::Text(etag.clone())));
        }
        if let Some(permissions) = data.permissions {
            columns.push(("permissions", Value::Integer(i64::from(permissions))));
        }
        if let Some(encrypted) = data.encrypted {
            columns.push(("encrypted", Value::Integer(i64::from(encrypted))));
        }
        if let Some(unencrypted_size) = data.unencrypted_size {
            columns.push(("unencrypted_size", Value::Integer(unencrypted_size)));
        }
        if let Some(extra) = &data.extra {
            columns.push(("extra", encode_extra(extra)?.map_or(Value::Null, Value::Blob)));
        }

        if columns.is_empty() {
            return Ok(false);
        }

        let n = columns.len();
        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
            .collect();
        let differs: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{col} IS NOT ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE filecache SET {} WHERE ({}) AND fileid = ?{} AND storage = ?{}",
            sets.join(", "),
            differs.join(" OR "),
            n + 1,
            n + 2
        );

        let mut values: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Integer(id.0));
        values.push(Value::Integer(self.numeric_id()));

        let changed = self
            .db
            .with_conn(|conn| conn.prepare_cached(&sql)?.execute(params_from_iter(values.iter())))?;

        if changed == 0 {
            return Ok(false);
        }
        trace!(file_id = id.0, "updated entry");
        if self.events.has_subscribers()
            && let Some(path) = self.path_by_id(id)?
        {
            self.events.emit(CacheEvent::Updated {
                storage: self.numeric_id(),
                path,
                file_id: id,
            });
        }
        Ok(true)
    }

    /// Delete `path` and, for folders, everything below it
    pub fn remove(&self, path: &str) -> Result<()> {
        let path = path::normalize(path);
        self.partial.lock().pop(&path);

        let Some(entry) = self.fetch_by_path(&path)? else {
            return Ok(());
        };

        let removed = self.db.transaction(|| {
            let mut ids = vec![entry.file_id.0];
            if entry.is_dir() {
                ids.extend(self.descendant_ids(entry.file_id)?);
            }
            self.delete_ids(&ids)?;
            Ok(ids.len())
        })?;

        debug!(path = %path, removed, "removed entry");
        self.events.emit(CacheEvent::Removed {
            storage: self.numeric_id(),
            path,
            file_id: entry.file_id,
        });
        Ok(())
    }

    /// Ids below folder `id`, found by walking the parent chain
    fn descendant_ids(&self, id: FileId) -> Result<Vec<i64>> {
        let Some(folder_mimetype) = self.mimetypes.id_of(DIRECTORY_MIMETYPE)? else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        let mut stack = vec![id.0];
        while let Some(parent) = stack.pop() {
            let children: Vec<(i64, i64)> = self.db.with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT fileid, mimetype FROM filecache WHERE parent = ?1 AND storage = ?2",
                )?;
                let rows = stmt.query_map(params![parent, self.numeric_id()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect()
            })?;
            for (child, mimetype) in children {
                found.push(child);
                if mimetype == folder_mimetype {
                    stack.push(child);
                }
            }
        }
        Ok(found)
    }

    fn delete_ids(&self, ids: &[i64]) -> Result<()> {
        for chunk in ids.chunks(CHUNK_SIZE) {
            let marks = placeholders(chunk.len());
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!("DELETE FROM filecache WHERE fileid IN ({marks})"),
                    params_from_iter(chunk.iter()),
                )?;
                conn.execute(
                    &format!("DELETE FROM permissions WHERE fileid IN ({marks})"),
                    params_from_iter(chunk.iter()),
                )
            })?;
        }
        Ok(())
    }

    /// Move `source` to `target` within this cache, keeping every file id
    pub fn move_entry(&self, source: &str, target: &str) -> Result<()> {
        self.move_from_cache(self, source, target)
    }

    /// Move an entry (and its subtree) from `source_cache` into this cache.
    ///
    /// Both caches must live on the same database. File ids are preserved.
    pub fn move_from_cache(&self, source_cache: &Cache, source: &str, target: &str) -> Result<()> {
        let source_path = path::normalize(source);
        let target_path = path::normalize(target);
        let same_storage = source_cache.numeric_id() == self.numeric_id();

        if same_storage && source_path == target_path {
            return Ok(());
        }
        if same_storage
            && (source_path.is_empty() || target_path.starts_with(&format!("{source_path}/")))
        {
            return Err(CacheError::invalid_state(format!(
                "cannot move {source_path} into itself"
            )));
        }
        if target_path.is_empty() {
            return Err(CacheError::invalid_state("cannot move onto the storage root"));
        }

        let Some(entry) = source_cache.fetch_by_path(&source_path)? else {
            return Err(CacheError::invalid_state(format!(
                "source {source_path} not in cache"
            )));
        };
        let Some(new_parent) = self.id(path::parent(&target_path))? else {
            return Err(CacheError::invalid_state(format!(
                "target parent not in cache for {target_path}"
            )));
        };
        if self.id(&target_path)?.is_some() {
            return Err(CacheError::invalid_state(format!(
                "target {target_path} already in cache"
            )));
        }

        let target_storage = self.numeric_id();
        let moved = self.db.transaction(|| {
            let mut moved = 1;
            if entry.is_dir() {
                let children: Vec<(i64, String)> = self.db.with_conn(|conn| {
                    // every path starting with "source/": '0' sorts right after '/'
                    let mut stmt = conn.prepare_cached(
                        "SELECT fileid, path FROM filecache
                         WHERE storage = ?1 AND path >= ?2 AND path < ?3",
                    )?;
                    let rows = stmt.query_map(
                        params![
                            source_cache.numeric_id(),
                            format!("{source_path}/"),
                            format!("{source_path}0")
                        ],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    rows.collect()
                })?;

                for (child_id, child_path) in children {
                    let rest = &child_path[source_path.len() + 1..];
                    let new_path = path::join(&target_path, rest);
                    self.db.with_conn(|conn| {
                        conn.prepare_cached(
                            "UPDATE filecache SET path = ?1, path_hash = ?2, storage = ?3 WHERE fileid = ?4",
                        )?
                        .execute(params![new_path, path::hash(&new_path), target_storage, child_id])
                    })?;
                    moved += 1;
                }
            }

            self.db.with_conn(|conn| {
                conn.prepare_cached(
                    "UPDATE filecache SET path = ?1, path_hash = ?2, name = ?3, parent = ?4, storage = ?5
                     WHERE fileid = ?6",
                )?
                .execute(params![
                    target_path,
                    path::hash(&target_path),
                    path::basename(&target_path),
                    new_parent.0,
                    target_storage,
                    entry.file_id.0
                ])
            })?;
            Ok(moved)
        })?;

        source_cache.partial.lock().pop(&source_path);
        debug!(from = %source_path, to = %target_path, moved, "moved entry");

        if same_storage {
            self.events.emit(CacheEvent::Updated {
                storage: target_storage,
                path: target_path,
                file_id: entry.file_id,
            });
        } else {
            source_cache.events.emit(CacheEvent::Removed {
                storage: source_cache.numeric_id(),
                path: source_path,
                file_id: entry.file_id,
            });
            self.events.emit(CacheEvent::Inserted {
                storage: target_storage,
                path: target_path,
                file_id: entry.file_id,
            });
        }
        Ok(())
    }

    /// Copy `entry` and its subtree from `source_cache` to `target` with fresh ids
    pub fn copy_from_cache(
        &self,
        source_cache: &Cache,
        entry: &CacheEntry,
        target: &str,
    ) -> Result<FileId> {
        let target = path::normalize(target);
        let file_id = self.put(&target, EntryData::from(entry))?.ok_or_else(|| {
            CacheError::invalid_state(format!("failed to copy {} to {target}", entry.path))
        })?;

        if entry.is_dir() {
            for child in source_cache.folder_contents_by_id(entry.file_id)? {
                self.copy_from_cache(source_cache, &child, &path::join(&target, &child.name))?;
            }
        }
        Ok(file_id)
    }

    /// Drop every row of this storage along with the storage itself
    pub fn clear(&self) -> Result<()> {
        storages::remove(&self.db, self.storage_id())?;
        self.partial.lock().clear();
        Ok(())
    }

    /// Forget buffered partial entries
    pub fn discard_partial(&self) {
        let mut partial = self.partial.lock();
        if !partial.is_empty() {
            trace!(count = partial.len(), "discarding partial entries");
        }
        partial.clear();
    }

    // ---- folder sizes ----

    /// Recompute the size of the folder at `path` from its direct children.
    ///
    /// Writes the result when it changed and returns it; `-1` when a child
    /// size is unknown. Non-folders yield 0 and are not written.
    pub fn calculate_folder_size(&self, path: &str, entry: Option<&CacheEntry>) -> Result<i64> {
        let path = path::normalize(path);
        if self.is_home() {
            return self.home_folder_size(&path, entry);
        }
        self.folder_size_inner(&path, entry, false)
    }

    fn folder_size_inner(
        &self,
        path: &str,
        entry: Option<&CacheEntry>,
        ignore_unknown: bool,
    ) -> Result<i64> {
        let fetched;
        let entry = match entry {
            Some(entry) => entry,
            None => match self.fetch_by_path(path)? {
                Some(entry) => {
                    fetched = entry;
                    &fetched
                }
                None => return Ok(0),
            },
        };
        if !entry.is_dir() {
            return Ok(0);
        }

        let sql = if ignore_unknown {
            "SELECT size, unencrypted_size FROM filecache WHERE storage = ?1 AND parent = ?2 AND size >= 0"
        } else {
            "SELECT size, unencrypted_size FROM filecache WHERE storage = ?1 AND parent = ?2"
        };
        let rows: Vec<(i64, i64)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![self.numeric_id(), entry.file_id.0], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })?;

        let (total, mut unencrypted_total, unencrypted_max) = if rows.is_empty() {
            (0, 0, 0)
        } else {
            let min = rows.iter().map(|r| r.0).min().unwrap_or(0);
            let sum: i64 = rows.iter().map(|r| r.0).sum();
            let logical = rows.iter().map(|&(size, unenc)| entry::logical_size(size, unenc));
            let unencrypted_min = logical.clone().min().unwrap_or(0);
            let unencrypted_sum: i64 = logical.sum();
            let unencrypted_max = rows.iter().map(|r| r.1).max().unwrap_or(0);

            let total = if min < 0 { SIZE_UNKNOWN } else { sum };
            let unencrypted_total = if min < 0 || unencrypted_min < 0 {
                SIZE_UNKNOWN
            } else {
                unencrypted_sum
            };
            (total, unencrypted_total, unencrypted_max)
        };

        // only track an unencrypted size when some child has one, or the folder is empty
        let write_unencrypted = unencrypted_max > 0 || total == 0 || entry.unencrypted_size > 0;
        if entry.size != total || (write_unencrypted && entry.unencrypted_size != unencrypted_total)
        {
            let mut data = EntryData::new().size(total);
            if write_unencrypted {
                if unencrypted_max == 0 {
                    unencrypted_total = 0;
                }
                data = data.unencrypted_size(unencrypted_total);
            }
            self.update(entry.file_id, &data)?;
            trace!(path, size = total, "folder size changed");
        }
        Ok(total)
    }

    /// Recompute the size of `path` and of every folder above it
    pub fn correct_folder_size(&self, path: &str) -> Result<()> {
        let mut current = path::normalize(path);
        loop {
            self.calculate_folder_size(&current, None)?;
            if current.is_empty() {
                return Ok(());
            }
            current = path::parent(&current).to_string();
        }
    }

    /// Like [`Cache::correct_folder_size`], but stop below a parent that is
    /// still unknown or has unscanned children.
    pub fn correct_folder_size_after_background_scan(&self, path: &str) -> Result<()> {
        let mut current = path::normalize(path);
        loop {
            self.calculate_folder_size(&current, None)?;
            if current.is_empty() {
                return Ok(());
            }
            let parent = path::parent(&current).to_string();
            match self.fetch_by_path(&parent)? {
                Some(entry)
                    if entry.size != SIZE_UNKNOWN
                        && self.incomplete_children_count(entry.file_id)? == 0 =>
                {
                    current = parent;
                }
                _ => return Ok(()),
            }
        }
    }
}
