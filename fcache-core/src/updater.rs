use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};

use crate::{CacheError, Result};
use crate::cache::EntryData;
use crate::path;
use crate::propagator::ChangePropagator;
use crate::scanner::{ScanMode, is_partial_file};
use crate::view::{Mount, View};

/// Keeps the cache in step with writes made through the view.
///
/// Every operation rescans only what it touched, fixes folder sizes and the
/// parent's `storage_mtime`, then propagates etag/mtime changes upward.
/// Changes still pending when the updater is dropped are propagated then.
#[derive(Debug)]
pub struct Updater {
    view: Arc<View>,
    propagator: ChangePropagator,
    enabled: AtomicBool,
}

impl Updater {
    pub fn new(view: Arc<View>) -> Self {
        Self {
            propagator: ChangePropagator::new(Arc::clone(&view)),
            view,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn propagator(&self) -> &ChangePropagator {
        &self.propagator
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Stop reacting to changes until [`Updater::enable`]
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn skips(&self, mount: &Mount, internal: &str) -> bool {
        !self.is_enabled()
            || is_partial_file(internal, &mount.scanner().config().partial_file_suffix)
    }

    /// A file or folder at `view_path` was written.
    ///
    /// `time` is the mtime propagated to the ancestors, now when `None`.
    pub fn update(&self, view_path: &str, time: Option<i64>) -> Result<()> {
        let Some((mount, internal)) = self.view.resolve(view_path) else {
            trace!(path = view_path, "update outside any mount");
            return Ok(());
        };
        if self.skips(&mount, &internal) {
            return Ok(());
        }

        self.propagator.add_change(view_path);
        mount.scanner().scan(&internal, ScanMode::Shallow, None)?;
        self.correct_parent_storage_mtime(&mount, &internal)?;
        mount.cache().correct_folder_size(&internal)?;
        self.propagator.propagate_changes(time)?;
        Ok(())
    }

    /// `view_path` was deleted
    pub fn remove(&self, view_path: &str) -> Result<()> {
        let Some((mount, internal)) = self.view.resolve(view_path) else {
            trace!(path = view_path, "remove outside any mount");
            return Ok(());
        };
        if self.skips(&mount, &internal) {
            return Ok(());
        }

        self.propagator.add_change(view_path);
        let cache = mount.cache();
        cache.remove(&internal)?;
        cache.correct_folder_size(path::parent(&internal))?;
        self.correct_parent_storage_mtime(&mount, &internal)?;
        self.propagator.propagate_changes(None)?;
        Ok(())
    }

    /// `source` was renamed to `target`.
    ///
    /// Within one storage the cached subtree is moved and keeps its file ids.
    /// Across storages this is a remove followed by an update.
    pub fn rename(&self, source: &str, target: &str) -> Result<()> {
        let (Some((source_mount, source_internal)), Some((target_mount, target_internal))) =
            (self.view.resolve(source), self.view.resolve(target))
        else {
            trace!(source, target, "rename outside any mount");
            return Ok(());
        };
        if self.skips(&source_mount, &source_internal)
            || self.skips(&target_mount, &target_internal)
        {
            return Ok(());
        }

        if !Arc::ptr_eq(&source_mount, &target_mount) {
            debug!(source, target, "rename across storages");
            self.remove(source)?;
            return self.update(target, None);
        }

        let cache = source_mount.cache();
        if cache.id(&source_internal)?.is_some() {
            if target_internal.starts_with(&format!("{source_internal}/"))
                || source_internal.starts_with(&format!("{target_internal}/"))
            {
                return Err(CacheError::invalid_state(format!(
                    "cannot rename {source_internal} to {target_internal}"
                )));
            }
            // an overwritten target only goes away if the move succeeds
            cache.db().transaction(|| {
                if target_internal != source_internal && cache.id(&target_internal)?.is_some() {
                    cache.remove(&target_internal)?;
                }
                cache.move_entry(&source_internal, &target_internal)
            })?;
        } else {
            debug!(source, target, "rename source not cached, scanning target");
            source_mount
                .scanner()
                .scan(&target_internal, ScanMode::Shallow, None)?;
        }
        self.propagator.add_change(source);
        self.propagator.add_change(target);

        if path::extension(&source_internal) != path::extension(&target_internal) {
            match source_mount.storage().mime_type(&target_internal) {
                Ok(mimetype) => {
                    if let Some(id) = cache.id(&target_internal)? {
                        cache.update(id, &EntryData::new().mimetype(mimetype))?;
                    }
                }
                Err(e) => debug!(path = %target_internal, error = %e, "no mimetype after rename"),
            }
        }

        cache.correct_folder_size(path::parent(&source_internal))?;
        cache.correct_folder_size(&target_internal)?;
        self.correct_parent_storage_mtime(&source_mount, &source_internal)?;
        self.correct_parent_storage_mtime(&target_mount, &target_internal)?;
        self.propagator.propagate_changes(None)?;
        Ok(())
    }

    /// Record the backend's current mtime for the folder containing `internal`
    fn correct_parent_storage_mtime(&self, mount: &Mount, internal: &str) -> Result<()> {
        if internal.is_empty() {
            return Ok(());
        }
        let parent = path::parent(internal);
        let cache = mount.cache();
        let Some(parent_id) = cache.id(parent)? else {
            return Ok(());
        };
        match mount.storage().stat(parent) {
            Ok(Some(stat)) => {
                let data = EntryData::new().storage_mtime(stat.mtime).keep_mtime();
                cache.update(parent_id, &data)?;
            }
            Ok(None) => {}
            Err(e) => debug!(path = parent, error = %e, "cannot stat parent"),
        }
        Ok(())
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        if self.propagator.has_changes()
            && let Err(e) = self.propagator.propagate_changes(None)
        {
            warn!(error = %e, "failed to propagate pending changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryStorage, Storage};
    use crate::cache::{Cache, CacheContext};
    use crate::scanner::{ScanConfig, Scanner};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        cache: Arc<Cache>,
        updater: Updater,
    }

    fn setup() -> Fixture {
        let storage = Arc::new(
            MemoryStorage::new("memory::updater")
                .with_file("docs/a.txt", 10, 100)
                .with_file("docs/b.txt", 20, 100)
                .with_dir("other", 100),
        );
        let ctx = CacheContext::in_memory().unwrap();
        let cache = Arc::new(Cache::new(&ctx, storage.id()).unwrap());
        let scanner = Arc::new(Scanner::new(
            storage.clone(),
            Arc::clone(&cache),
            ScanConfig::default(),
        ));
        scanner.scan("", ScanMode::Recursive, None).unwrap();

        let view = Arc::new(View::new());
        view.mount("/alice/files", scanner);
        Fixture {
            storage,
            cache,
            updater: Updater::new(view),
        }
    }

    #[test]
    fn test_update_new_file() {
        let f = setup();
        f.storage.write("docs/c.txt", 5, 200);
        f.updater.update("/alice/files/docs/c.txt", Some(200)).unwrap();

        assert!(f.cache.in_cache("docs/c.txt").unwrap());
        let docs = f.cache.get_entry("docs").unwrap().unwrap();
        assert_eq!(docs.size, 35);
        assert_eq!(docs.storage_mtime, 200);
        assert_eq!(docs.etag, f.storage.etag("docs").unwrap());
        assert_eq!(f.cache.get_entry("").unwrap().unwrap().size, 35);
        assert!(f.cache.get_entry("").unwrap().unwrap().mtime >= 200);
    }

    #[test]
    fn test_remove() {
        let f = setup();
        f.storage.delete("docs/b.txt", 300);
        f.updater.remove("/alice/files/docs/b.txt").unwrap();

        assert!(!f.cache.in_cache("docs/b.txt").unwrap());
        let docs = f.cache.get_entry("docs").unwrap().unwrap();
        assert_eq!(docs.size, 10);
        assert_eq!(docs.storage_mtime, 300);
    }

    #[test]
    fn test_rename_keeps_file_id_and_fixes_mimetype() {
        let f = setup();
        let id = f.cache.id("docs/a.txt").unwrap().unwrap();
        f.storage.rename("docs/a.txt", "other/a.png", 400);
        f.updater
            .rename("/alice/files/docs/a.txt", "/alice/files/other/a.png")
            .unwrap();

        let moved = f.cache.get_entry("other/a.png").unwrap().unwrap();
        assert_eq!(moved.file_id, id);
        assert_eq!(moved.mimetype, "image/png");
        assert_eq!(f.cache.get_entry("docs").unwrap().unwrap().size, 20);
        assert_eq!(f.cache.get_entry("other").unwrap().unwrap().size, 10);
        assert_eq!(f.cache.get_entry("").unwrap().unwrap().size, 30);
    }

    #[test]
    fn test_parent_storage_mtime_keeps_mtime() {
        let f = setup();
        let before = f.cache.get_entry("docs").unwrap().unwrap();
        f.storage.touch("docs", 900);

        let (mount, internal) = f.updater.view.resolve("/alice/files/docs/a.txt").unwrap();
        f.updater.correct_parent_storage_mtime(&mount, &internal).unwrap();

        let docs = f.cache.get_entry("docs").unwrap().unwrap();
        assert_eq!(docs.storage_mtime, 900);
        assert_eq!(docs.mtime, before.mtime);
    }

    #[test]
    fn test_rename_of_uncached_source_scans_target() {
        let f = setup();
        f.storage.write("docs/new.txt", 7, 700);
        f.storage.rename("docs/new.txt", "docs/renamed.txt", 710);
        f.updater
            .rename("/alice/files/docs/new.txt", "/alice/files/docs/renamed.txt")
            .unwrap();

        assert!(f.cache.id("docs/renamed.txt").unwrap().is_some());
        assert!(f.cache.id("docs/new.txt").unwrap().is_none());
        let docs = f.cache.get_entry("docs").unwrap().unwrap();
        assert_eq!(docs.size, 37);
        assert_eq!(docs.etag, f.storage.etag("docs").unwrap());
        assert!(!f.updater.propagator().has_changes());
    }

    #[test]
    fn test_rename_into_own_subtree_changes_nothing() {
        let f = setup();
        let result = f.updater.rename("/alice/files/docs", "/alice/files/docs/inner");
        assert!(result.is_err());
        assert!(f.cache.id("docs").unwrap().is_some());
        assert!(f.cache.id("docs/a.txt").unwrap().is_some());
        assert_eq!(f.cache.get_entry("").unwrap().unwrap().size, 30);
        assert!(!f.updater.propagator().has_changes());
    }

    #[test]
    fn test_rename_onto_ancestor_changes_nothing() {
        let f = setup();
        let result = f.updater.rename("/alice/files/docs/a.txt", "/alice/files/docs");
        assert!(result.is_err());
        assert!(f.cache.id("docs").unwrap().is_some());
        assert!(f.cache.id("docs/a.txt").unwrap().is_some());
        assert!(f.cache.id("docs/b.txt").unwrap().is_some());
    }

    #[test]
    fn test_rename_across_storages() {
        let f = setup();
        let shared = Arc::new(MemoryStorage::new("memory::shared"));
        let ctx = CacheContext::in_memory().unwrap();
        let ctx_cache = Arc::new(Cache::new(&ctx, shared.id()).unwrap());
        let scanner = Arc::new(Scanner::new(
            shared.clone(),
            Arc::clone(&ctx_cache),
            ScanConfig::default(),
        ));
        scanner.scan("", ScanMode::Shallow, None).unwrap();
        f.updater.view.mount("/alice/files/shared", scanner);

        f.storage.delete("docs/a.txt", 500);
        shared.write("a.txt", 10, 500);
        f.updater
            .rename("/alice/files/docs/a.txt", "/alice/files/shared/a.txt")
            .unwrap();

        assert!(!f.cache.in_cache("docs/a.txt").unwrap());
        assert!(ctx_cache.in_cache("a.txt").unwrap());
        assert_eq!(ctx_cache.get_entry("").unwrap().unwrap().size, 10);
    }

    #[test]
    fn test_disabled_and_partial_files_are_ignored() {
        let f = setup();
        f.storage.write("docs/upload.part", 3, 200);
        f.updater.update("/alice/files/docs/upload.part", None).unwrap();
        assert!(!f.cache.in_cache("docs/upload.part").unwrap());

        f.updater.disable();
        f.storage.write("docs/c.txt", 5, 200);
        f.updater.update("/alice/files/docs/c.txt", None).unwrap();
        assert!(!f.cache.in_cache("docs/c.txt").unwrap());

        f.updater.enable();
        f.updater.update("/alice/files/docs/c.txt", None).unwrap();
        assert!(f.cache.in_cache("docs/c.txt").unwrap());
    }

    #[test]
    fn test_pending_changes_flushed_on_drop() {
        let f = setup();
        f.storage.write("docs/a.txt", 11, 600);
        f.updater.propagator().add_change("/alice/files/docs/a.txt");
        let cache = Arc::clone(&f.cache);
        let storage = Arc::clone(&f.storage);
        drop(f);

        let docs = cache.get_entry("docs").unwrap().unwrap();
        assert_eq!(docs.etag, storage.etag("docs").unwrap());
    }
}
