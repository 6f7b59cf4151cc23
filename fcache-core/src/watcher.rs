use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::Result;
use crate::cache::CacheEntry;
use crate::config::{CacheConfig, WatchPolicy};
use crate::path;
use crate::scanner::{Reuse, ScanMode, Scanner};

/// Cheap staleness checks on read.
///
/// Asks the backend whether a cached path changed since its recorded
/// `storage_mtime` and rescans just that path when it did.
#[derive(Debug)]
pub struct Watcher {
    scanner: Arc<Scanner>,
    policy: Mutex<WatchPolicy>,
    checked: Mutex<HashSet<String>>,
}

impl Watcher {
    pub fn new(scanner: Arc<Scanner>, policy: WatchPolicy) -> Self {
        Self {
            scanner,
            policy: Mutex::new(policy),
            checked: Mutex::new(HashSet::new()),
        }
    }

    /// Watcher using the configured [`WatchPolicy`]
    pub fn from_config(scanner: Arc<Scanner>, config: &CacheConfig) -> Self {
        Self::new(scanner, config.watch_policy)
    }

    pub fn policy(&self) -> WatchPolicy {
        *self.policy.lock()
    }

    pub fn set_policy(&self, policy: WatchPolicy) {
        *self.policy.lock() = policy;
    }

    /// Rescan `path` if the backend reports a change.
    ///
    /// `cached` is looked up when not given. Returns whether a rescan ran.
    pub fn check_update(&self, path: &str, cached: Option<&CacheEntry>) -> Result<bool> {
        let path = path::normalize(path);
        let looked_up;
        let cached = match cached {
            Some(entry) => Some(entry),
            None => {
                looked_up = self.scanner.cache().get_entry(&path)?;
                looked_up.as_ref()
            }
        };

        if !self.needs_update(&path, cached) {
            return Ok(false);
        }
        self.update(&path, cached)?;
        Ok(true)
    }

    /// Whether the policy allows a check and the backend changed since `cached`
    pub fn needs_update(&self, path: &str, cached: Option<&CacheEntry>) -> bool {
        let path = path::normalize(path);
        match self.policy() {
            WatchPolicy::Never => return false,
            WatchPolicy::Once => {
                if !self.checked.lock().insert(path.clone()) {
                    return false;
                }
            }
            WatchPolicy::Always => {}
        }

        match cached {
            Some(entry) => self
                .scanner
                .storage()
                .has_updated(&path, entry.storage_mtime),
            None => true,
        }
    }

    /// Shallow rescan of `path`, then prune vanished children of a cached
    /// folder and fix the size chain above it
    pub fn update(&self, path: &str, cached: Option<&CacheEntry>) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, storage = self.scanner.storage().id(), "path changed on storage");

        if self.scanner.storage().is_dir(&path) {
            self.scanner.scan(&path, ScanMode::Shallow, None)?;
        } else {
            self.scanner.scan_file(&path, Reuse::ETAG)?;
        }

        if cached.is_some_and(|entry| entry.is_dir()) {
            self.clean_folder(&path)?;
        }
        self.scanner.cache().correct_folder_size(&path)
    }

    /// Remove cached children of `path` the backend no longer has
    pub fn clean_folder(&self, path: &str) -> Result<()> {
        let cache = self.scanner.cache();
        let storage = self.scanner.storage();
        for entry in cache.folder_contents(path)? {
            if !storage.exists(&entry.path) {
                cache.remove(&entry.path)?;
            }
        }
        Ok(())
    }
}
