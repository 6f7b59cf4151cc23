//! Size rules of personal storages.
//!
//! A home storage holds `files`, `files_trashbin` and `files_versions` at its
//! root. Only `files` counts towards the visible size of the storage, and the
//! top-level folders never become unknown because of a pending child.

use super::{Cache, CacheEntry, Layout};
use crate::Result;

const TOP_LEVEL_FOLDERS: [&str; 3] = ["files", "files_trashbin", "files_versions"];

impl Cache {
    pub(super) fn home_folder_size(&self, path: &str, entry: Option<&CacheEntry>) -> Result<i64> {
        let ignore_unknown = path.is_empty() || TOP_LEVEL_FOLDERS.contains(&path);
        self.folder_size_inner(path, entry, ignore_unknown)
    }

    /// The root of a home storage reports the size of `files`
    pub(super) fn apply_home_root_size(&self, entry: &mut CacheEntry) -> Result<()> {
        if let Some(size) = self.home_root_size(&entry.path)? {
            entry.size = size;
        }
        Ok(())
    }

    /// Size of `files` when `path` is the root of a home storage
    pub(super) fn home_root_size(&self, path: &str) -> Result<Option<i64>> {
        if self.layout != Layout::Home || !path.is_empty() {
            return Ok(None);
        }
        Ok(self.fetch_by_path("files")?.map(|files| files.size))
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheContext, CacheStatus, EntryData, SIZE_UNKNOWN};

    fn home() -> Cache {
        let ctx = CacheContext::in_memory().unwrap();
        let cache = Cache::new_home(&ctx, "home::alice").unwrap();
        cache.put("", EntryData::folder().mtime(1)).unwrap();
        for folder in ["files", "files_trashbin", "files_versions"] {
            cache.put(folder, EntryData::folder().mtime(1)).unwrap();
        }
        cache
    }

    fn file(size: i64) -> EntryData {
        EntryData::new().size(size).mtime(1).mimetype("text/plain")
    }

    fn root_size(cache: &Cache) -> i64 {
        cache.get_entry("").unwrap().unwrap().size
    }

    #[test]
    fn test_root_reports_files_size() {
        let cache = home();
        cache.put("files/a.txt", file(10)).unwrap();
        cache.correct_folder_size("files").unwrap();
        assert_eq!(root_size(&cache), 10);

        cache.put("files/b.txt", file(5)).unwrap();
        cache.correct_folder_size("files").unwrap();
        assert_eq!(root_size(&cache), 15);
    }

    #[test]
    fn test_trashbin_does_not_change_root() {
        let cache = home();
        cache.put("files/a.txt", file(10)).unwrap();
        cache.correct_folder_size("files").unwrap();
        let before = root_size(&cache);

        cache.put("files_trashbin/old.txt", file(500)).unwrap();
        cache.correct_folder_size("files_trashbin").unwrap();
        assert_eq!(root_size(&cache), before);

        cache.remove("files_trashbin/old.txt").unwrap();
        cache.correct_folder_size("files_trashbin").unwrap();
        assert_eq!(root_size(&cache), before);
    }

    #[test]
    fn test_root_status_follows_files() {
        let cache = home();
        cache.put("files_trashbin/old.txt", file(500)).unwrap();
        cache.correct_folder_size("files_trashbin").unwrap();
        assert_eq!(cache.status("").unwrap(), CacheStatus::Shallow);

        cache.put("files/a.txt", file(10)).unwrap();
        cache.correct_folder_size("files").unwrap();
        assert_eq!(cache.status("").unwrap(), CacheStatus::Complete);
    }

    #[test]
    fn test_top_level_ignores_unknown_children() {
        let cache = home();
        cache.put("files/a.txt", file(10)).unwrap();
        cache.put("files/pending", EntryData::folder().mtime(1)).unwrap();

        assert_eq!(cache.calculate_folder_size("files", None).unwrap(), 10);

        // deeper folders follow the normal rule
        cache.put("files/pending/inner", EntryData::folder().mtime(1)).unwrap();
        assert_eq!(
            cache.calculate_folder_size("files/pending", None).unwrap(),
            SIZE_UNKNOWN
        );
    }

    #[test]
    fn test_plain_cache_root_is_not_overlaid() {
        let ctx = CacheContext::in_memory().unwrap();
        let cache = Cache::new(&ctx, "local::x").unwrap();
        cache.put("", EntryData::folder().mtime(1)).unwrap();
        cache.put("files", EntryData::folder().mtime(1)).unwrap();
        cache.put("other.txt", file(3)).unwrap();
        cache.put("files/a.txt", file(2)).unwrap();
        cache.correct_folder_size("files").unwrap();

        assert_eq!(cache.get_entry("").unwrap().unwrap().size, 5);
    }
}
