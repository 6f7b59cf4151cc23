use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::Result;
use crate::cache::{EntryData, FileId};
use crate::events::Emitter;
use crate::path;
use crate::view::View;

/// An ancestor folder that received a new etag and mtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propagated {
    /// Absolute view path of the folder
    pub path: String,
    pub file_id: FileId,
    pub etag: String,
    pub mtime: i64,
}

/// Current unix time in seconds
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Batches changed paths and bubbles etag/mtime updates to their ancestors.
///
/// However many changes share an ancestor, each ancestor is written once
/// per [`ChangePropagator::propagate_changes`].
#[derive(Debug)]
pub struct ChangePropagator {
    view: Arc<View>,
    changed: Mutex<HashSet<String>>,
    events: Emitter<Propagated>,
}

impl ChangePropagator {
    pub fn new(view: Arc<View>) -> Self {
        Self {
            view,
            changed: Mutex::new(HashSet::new()),
            events: Emitter::new(),
        }
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn subscribe(&self) -> Receiver<Propagated> {
        self.events.subscribe()
    }

    /// Record a changed view path
    pub fn add_change(&self, view_path: &str) {
        let view_path = format!("/{}", path::normalize(view_path));
        self.changed.lock().insert(view_path);
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.lock().is_empty()
    }

    /// Every folder above any recorded change, each listed once
    pub fn all_parents(&self) -> Vec<String> {
        let parents: BTreeSet<String> = self
            .changed
            .lock()
            .iter()
            .flat_map(|changed| path::ancestors(changed))
            .collect();
        parents.into_iter().collect()
    }

    /// Write a fresh etag and `max(mtime, time)` to every ancestor of the
    /// recorded changes, then forget the changes.
    ///
    /// `time` defaults to now. Ancestors outside any mount, missing from
    /// their cache, or whose backend fails to produce an etag are skipped.
    /// Returns the number of folders updated.
    pub fn propagate_changes(&self, time: Option<i64>) -> Result<usize> {
        let time = time.unwrap_or_else(now);
        let parents = self.all_parents();
        self.changed.lock().clear();

        let mut updated = 0;
        for parent in parents {
            let Some((mount, internal)) = self.view.resolve(&parent) else {
                trace!(path = %parent, "no mount for ancestor");
                continue;
            };
            let cache = mount.cache();
            let Some(entry) = cache.get_entry(&internal)? else {
                continue;
            };
            let etag = match mount.storage().etag(&internal) {
                Ok(etag) => etag,
                Err(e) => {
                    debug!(path = %parent, error = %e, "no etag for ancestor, skipping");
                    continue;
                }
            };

            let mtime = entry.mtime.max(time);
            cache.update(entry.file_id, &EntryData::new().mtime(mtime).etag(etag.clone()))?;
            updated += 1;
            self.events.emit(Propagated {
                path: parent,
                file_id: entry.file_id,
                etag,
                mtime,
            });
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryStorage, Storage};
    use crate::cache::{Cache, CacheContext};
    use crate::scanner::{ScanConfig, ScanMode, Scanner};

    fn setup() -> (Arc<MemoryStorage>, Arc<Scanner>, ChangePropagator) {
        let storage = Arc::new(
            MemoryStorage::new("memory::prop")
                .with_file("a/b/c", 1, 100)
                .with_file("a/b/d", 2, 100)
                .with_file("x/y", 3, 100),
        );
        let ctx = CacheContext::in_memory().unwrap();
        let cache = Arc::new(Cache::new(&ctx, storage.id()).unwrap());
        let scanner = Arc::new(Scanner::new(storage.clone(), cache, ScanConfig::default()));
        scanner.scan("", ScanMode::Recursive, None).unwrap();

        let view = Arc::new(View::new());
        view.mount("/", Arc::clone(&scanner));
        (storage, scanner, ChangePropagator::new(view))
    }

    #[test]
    fn test_all_parents_deduplicated() {
        let (_, _, propagator) = setup();
        propagator.add_change("/a/b/c");
        propagator.add_change("a/b/d");
        assert_eq!(propagator.all_parents(), vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn test_each_ancestor_updated_once() {
        let (storage, scanner, propagator) = setup();
        let rx = propagator.subscribe();
        storage.reset_calls();

        propagator.add_change("/a/b/c");
        propagator.add_change("/a/b/d");
        assert_eq!(propagator.propagate_changes(Some(500)).unwrap(), 3);

        for folder in ["", "a", "a/b"] {
            assert_eq!(storage.call_count("etag", folder), 1, "{folder}");
            let entry = scanner.cache().get_entry(folder).unwrap().unwrap();
            assert!(entry.mtime >= 500);
        }
        assert_eq!(storage.call_count("etag", "x"), 0);
        assert_eq!(rx.try_iter().count(), 3);
        assert!(!propagator.has_changes());
    }

    #[test]
    fn test_mtime_never_goes_backwards() {
        let (_, scanner, propagator) = setup();
        propagator.add_change("/x/y");
        propagator.propagate_changes(Some(1)).unwrap();
        assert_eq!(scanner.cache().get_entry("x").unwrap().unwrap().mtime, 100);
    }

    #[test]
    fn test_new_etag_is_written() {
        let (storage, scanner, propagator) = setup();
        let before = scanner.cache().get_entry("x").unwrap().unwrap().etag;

        storage.write("x/z", 4, 200);
        propagator.add_change("/x/z");
        propagator.propagate_changes(None).unwrap();

        let after = scanner.cache().get_entry("x").unwrap().unwrap();
        assert_ne!(after.etag, before);
        assert_eq!(after.etag, storage.etag("x").unwrap());
    }

    #[test]
    fn test_nothing_recorded() {
        let (_, _, propagator) = setup();
        assert_eq!(propagator.propagate_changes(None).unwrap(), 0);
    }
}
