use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Size of an entry whose size is not known yet
pub const SIZE_UNKNOWN: i64 = -1;

/// Mimetype of every folder entry
pub const DIRECTORY_MIMETYPE: &str = "httpd/unix-directory";

pub const PERMISSION_READ: u32 = 1;
pub const PERMISSION_UPDATE: u32 = 2;
pub const PERMISSION_CREATE: u32 = 4;
pub const PERMISSION_DELETE: u32 = 8;
pub const PERMISSION_SHARE: u32 = 16;
pub const PERMISSION_ALL: u32 = 31;

/// Identity of a filecache row, never reused once assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub i64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted filecache row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub file_id: FileId,
    /// Numeric id of the owning storage
    pub storage: i64,
    pub path: String,
    /// `None` for the storage root
    pub parent: Option<FileId>,
    pub name: String,
    pub mimetype: String,
    pub mimepart: String,
    /// Bytes, folder aggregate, or [`SIZE_UNKNOWN`]
    pub size: i64,
    pub mtime: i64,
    pub storage_mtime: i64,
    pub etag: String,
    pub permissions: u32,
    pub encrypted: bool,
    pub unencrypted_size: i64,
    pub extra: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn is_dir(&self) -> bool {
        self.mimetype == DIRECTORY_MIMETYPE
    }

    pub fn has_known_size(&self) -> bool {
        self.size >= 0
    }
}

/// Size a folder should count for a child: the unencrypted size when known
pub(crate) fn logical_size(size: i64, unencrypted_size: i64) -> i64 {
    if unencrypted_size > 0 {
        unencrypted_size
    } else {
        size
    }
}

/// A set of optional entry fields.
///
/// Used for inserts, partial updates and scanner results. Unset fields are
/// left untouched when the data is applied to an existing row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    pub path: Option<String>,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub storage_mtime: Option<i64>,
    pub mimetype: Option<String>,
    pub etag: Option<String>,
    pub permissions: Option<u32>,
    pub encrypted: Option<bool>,
    pub unencrypted_size: Option<i64>,
    pub extra: Option<BTreeMap<String, String>>,
    /// Keep the cached `mtime` when only `storage_mtime` is written
    #[serde(skip)]
    pub preserve_mtime: bool,
}

impl EntryData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn storage_mtime(mut self, storage_mtime: i64) -> Self {
        self.storage_mtime = Some(storage_mtime);
        self
    }

    /// See [`EntryData::preserve_mtime`]
    pub fn keep_mtime(mut self) -> Self {
        self.preserve_mtime = true;
        self
    }

    pub fn mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = Some(encrypted);
        self
    }

    pub fn unencrypted_size(mut self, size: i64) -> Self {
        self.unencrypted_size = Some(size);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Directory entry with unknown size
    pub fn folder() -> Self {
        Self::new().mimetype(DIRECTORY_MIMETYPE).size(SIZE_UNKNOWN)
    }

    /// Fields needed before a row can be inserted
    pub fn is_complete(&self) -> bool {
        self.size.is_some() && self.mtime.is_some() && self.mimetype.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.size.is_none()
            && self.mtime.is_none()
            && self.storage_mtime.is_none()
            && self.mimetype.is_none()
            && self.etag.is_none()
            && self.permissions.is_none()
            && self.encrypted.is_none()
            && self.unencrypted_size.is_none()
            && self.extra.is_none()
    }

    pub fn is_dir(&self) -> bool {
        self.mimetype.as_deref() == Some(DIRECTORY_MIMETYPE)
    }

    /// Overlay `other` onto `self`; fields set in `other` win.
    pub fn merge(&mut self, other: EntryData) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            path,
            size,
            mtime,
            storage_mtime,
            mimetype,
            etag,
            permissions,
            encrypted,
            unencrypted_size,
            extra
        );
        self.preserve_mtime |= other.preserve_mtime;
    }

    /// Only the fields that differ from `entry`
    pub fn diff(&self, entry: &CacheEntry) -> EntryData {
        fn changed<T: PartialEq + Clone>(new: &Option<T>, old: &T) -> Option<T> {
            new.as_ref().filter(|v| *v != old).cloned()
        }

        EntryData {
            path: changed(&self.path, &entry.path),
            size: changed(&self.size, &entry.size),
            mtime: changed(&self.mtime, &entry.mtime),
            storage_mtime: changed(&self.storage_mtime, &entry.storage_mtime),
            mimetype: changed(&self.mimetype, &entry.mimetype),
            etag: changed(&self.etag, &entry.etag),
            permissions: changed(&self.permissions, &entry.permissions),
            encrypted: changed(&self.encrypted, &entry.encrypted),
            unencrypted_size: changed(&self.unencrypted_size, &entry.unencrypted_size),
            extra: changed(&self.extra, &entry.extra),
            preserve_mtime: self.preserve_mtime,
        }
    }
}

impl From<&CacheEntry> for EntryData {
    fn from(entry: &CacheEntry) -> Self {
        EntryData {
            path: None,
            size: Some(entry.size),
            mtime: Some(entry.mtime),
            storage_mtime: Some(entry.storage_mtime),
            mimetype: Some(entry.mimetype.clone()),
            etag: Some(entry.etag.clone()),
            permissions: Some(entry.permissions),
            encrypted: Some(entry.encrypted),
            unencrypted_size: Some(entry.unencrypted_size),
            extra: (!entry.extra.is_empty()).then(|| entry.extra.clone()),
            preserve_mtime: false,
        }
    }
}

/// Result of a path lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Cached(CacheEntry),
    /// Fields buffered in memory for a path that is not persisted yet
    Partial(EntryData),
}

impl Entry {
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Entry::Cached(entry) => Some(entry.file_id),
            Entry::Partial(_) => None,
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self {
            Entry::Cached(entry) => Some(entry.size),
            Entry::Partial(data) => data.size,
        }
    }

    pub fn mimetype(&self) -> Option<&str> {
        match self {
            Entry::Cached(entry) => Some(&entry.mimetype),
            Entry::Partial(data) => data.mimetype.as_deref(),
        }
    }

    pub fn as_cached(&self) -> Option<&CacheEntry> {
        match self {
            Entry::Cached(entry) => Some(entry),
            Entry::Partial(_) => None,
        }
    }

    pub fn into_cached(self) -> Option<CacheEntry> {
        match self {
            Entry::Cached(entry) => Some(entry),
            Entry::Partial(_) => None,
        }
    }
}

/// How much the cache knows about a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotFound,
    /// Only buffered in memory
    Partial,
    /// Persisted, size unknown
    Shallow,
    Complete,
}
