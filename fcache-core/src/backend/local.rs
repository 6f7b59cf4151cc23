use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use tracing::trace;

use super::{Stat, Storage, guess_mimetype};
use crate::cache::{
    PERMISSION_CREATE, PERMISSION_DELETE, PERMISSION_READ, PERMISSION_SHARE, PERMISSION_UPDATE,
};
use crate::{StorageError, StorageResult};

/// A directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStorage {
    id: String,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        let id = format!("local::{}/", root.display());
        Self { id, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a storage path; `..` is rejected
    fn full_path(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn fs_metadata(&self, path: &str) -> StorageResult<Option<fs::Metadata>> {
        let full = self.full_path(path)?;
        match fs::metadata(&full) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn mtime_of(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fingerprint that changes whenever the file is replaced or rewritten
#[cfg(unix)]
fn fingerprint(meta: &fs::Metadata) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&meta.ino().to_le_bytes());
    hasher.update(&meta.dev().to_le_bytes());
    hasher.update(&meta.mtime().to_le_bytes());
    hasher.update(&meta.mtime_nsec().to_le_bytes());
    hasher.update(&meta.size().to_le_bytes());
    hasher.finalize()
}

#[cfg(not(unix))]
fn fingerprint(meta: &fs::Metadata) -> u32 {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&meta.len().to_le_bytes());
    hasher.finalize()
}

impl Storage for LocalStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_readable(&self, path: &str) -> bool {
        let Ok(full) = self.full_path(path) else {
            return false;
        };
        if full.is_dir() {
            fs::read_dir(&full).is_ok()
        } else {
            fs::File::open(&full).is_ok()
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        self.full_path(path).map(|p| p.is_dir()).unwrap_or(false)
    }

    fn exists(&self, path: &str) -> bool {
        matches!(self.fs_metadata(path), Ok(Some(_)))
    }

    fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let full = self.full_path(path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => trace!(?name, "skipping non UTF-8 file name"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn stat(&self, path: &str) -> StorageResult<Option<Stat>> {
        Ok(self.fs_metadata(path)?.map(|meta| Stat {
            is_dir: meta.is_dir(),
            size: meta.len() as i64,
            mtime: mtime_of(&meta),
        }))
    }

    fn mime_type(&self, path: &str) -> StorageResult<String> {
        if self.is_dir(path) {
            return Ok(crate::cache::DIRECTORY_MIMETYPE.to_string());
        }
        Ok(guess_mimetype(path))
    }

    fn etag(&self, path: &str) -> StorageResult<String> {
        let meta = self
            .fs_metadata(path)?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(format!("{:08x}", fingerprint(&meta)))
    }

    fn permissions(&self, path: &str) -> StorageResult<u32> {
        let meta = self
            .fs_metadata(path)?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        let mut permissions = 0;
        if self.is_readable(path) {
            permissions |= PERMISSION_READ | PERMISSION_SHARE;
        }
        if !meta.permissions().readonly() {
            permissions |= PERMISSION_UPDATE | PERMISSION_DELETE;
            if meta.is_dir() {
                permissions |= PERMISSION_CREATE;
            }
        }
        Ok(permissions)
    }
}
