//! Storage backends the cache mirrors.
//!
//! A backend answers cheap questions about paths relative to its root. The
//! scanner, watcher and propagator are the only consumers.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::StorageResult;
use crate::cache::{DIRECTORY_MIMETYPE, EntryData, SIZE_UNKNOWN};

/// Result of a backend stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub size: i64,
    pub mtime: i64,
}

/// Everything the scanner needs to know about one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub mimetype: String,
    /// [`SIZE_UNKNOWN`] for directories
    pub size: i64,
    pub mtime: i64,
    pub storage_mtime: i64,
    pub etag: String,
    pub permissions: u32,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.mimetype == DIRECTORY_MIMETYPE
    }

    pub fn into_entry_data(self) -> EntryData {
        EntryData::new()
            .mimetype(self.mimetype)
            .size(self.size)
            .mtime(self.mtime)
            .storage_mtime(self.storage_mtime)
            .etag(self.etag)
            .permissions(self.permissions)
    }
}

/// Capabilities the cache consumes from a storage backend.
///
/// Paths are normalized and relative to the storage root (`""` is the root).
pub trait Storage: Send + Sync {
    /// Stable identifier, used as the cache's storage id
    fn id(&self) -> &str;

    fn is_readable(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    fn exists(&self, path: &str) -> bool;

    /// Names of the direct children of a directory
    fn list(&self, path: &str) -> StorageResult<Vec<String>>;

    /// `None` when the path does not exist
    fn stat(&self, path: &str) -> StorageResult<Option<Stat>>;

    fn mime_type(&self, path: &str) -> StorageResult<String>;

    fn etag(&self, path: &str) -> StorageResult<String>;

    fn permissions(&self, path: &str) -> StorageResult<u32>;

    /// Whether `path` changed since `time`; vanished paths count as changed
    fn has_updated(&self, path: &str, time: i64) -> bool {
        match self.stat(path) {
            Ok(Some(stat)) => stat.mtime > time,
            _ => true,
        }
    }

    /// Combined metadata, `None` when the path is unreadable or gone
    fn metadata(&self, path: &str) -> StorageResult<Option<Metadata>> {
        if !self.is_readable(path) {
            return Ok(None);
        }
        let Some(stat) = self.stat(path)? else {
            return Ok(None);
        };

        let (mimetype, size) = if stat.is_dir {
            (DIRECTORY_MIMETYPE.to_string(), SIZE_UNKNOWN)
        } else {
            (self.mime_type(path)?, stat.size)
        };
        Ok(Some(Metadata {
            mimetype,
            size,
            mtime: stat.mtime,
            storage_mtime: stat.mtime,
            etag: self.etag(path)?,
            permissions: self.permissions(path)?,
        }))
    }
}

/// Mimetype guessed from the file extension
pub(crate) fn guess_mimetype(path: &str) -> String {
    new_mime_guess::from_path(path)
        .iter_raw()
        .next()
        .unwrap_or("application/octet-stream")
        .to_string()
}
