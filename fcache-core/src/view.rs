//! Mount table mapping absolute view paths onto storages.
//!
//! A view path such as `/alice/files/docs` is resolved to the mount with the
//! longest matching mount point and the path inside that storage.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Storage;
use crate::cache::Cache;
use crate::path;
use crate::scanner::Scanner;

/// A storage attached at a view path
#[derive(Debug)]
pub struct Mount {
    /// Normalized mount point, `""` for the view root
    mount_point: String,
    scanner: Arc<Scanner>,
}

impl Mount {
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn cache(&self) -> &Arc<Cache> {
        self.scanner.cache()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.scanner.storage()
    }

    /// Absolute view path of a path inside this mount
    pub fn view_path(&self, internal: &str) -> String {
        let internal = path::normalize(internal);
        match (self.mount_point.is_empty(), internal.is_empty()) {
            (true, _) => format!("/{internal}"),
            (false, true) => format!("/{}", self.mount_point),
            (false, false) => format!("/{}/{internal}", self.mount_point),
        }
    }

    /// Path inside this mount, `None` when `path` lies outside it
    fn internal_path(&self, path: &str) -> Option<String> {
        if self.mount_point.is_empty() {
            return Some(path.to_string());
        }
        if path == self.mount_point {
            return Some(String::new());
        }
        path.strip_prefix(&self.mount_point)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }
}

/// The set of mounts one request sees
#[derive(Debug, Default)]
pub struct View {
    mounts: RwLock<Vec<Arc<Mount>>>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a storage, replacing any mount at the same point
    pub fn mount(&self, mount_point: &str, scanner: Arc<Scanner>) -> Arc<Mount> {
        let mount = Arc::new(Mount {
            mount_point: path::normalize(mount_point),
            scanner,
        });
        let mut mounts = self.mounts.write();
        mounts.retain(|m| m.mount_point != mount.mount_point);
        mounts.push(Arc::clone(&mount));
        mount
    }

    pub fn unmount(&self, mount_point: &str) -> bool {
        let mount_point = path::normalize(mount_point);
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|m| m.mount_point != mount_point);
        mounts.len() != before
    }

    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().clone()
    }

    /// Mount owning `view_path` and the path inside it
    pub fn resolve(&self, view_path: &str) -> Option<(Arc<Mount>, String)> {
        let normalized = path::normalize(view_path);
        self.mounts
            .read()
            .iter()
            .filter_map(|mount| {
                mount
                    .internal_path(&normalized)
                    .map(|internal| (Arc::clone(mount), internal))
            })
            .max_by_key(|(mount, _)| mount.mount_point.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStorage;
    use crate::cache::CacheContext;
    use crate::scanner::ScanConfig;

    fn scanner(ctx: &CacheContext, id: &str) -> Arc<Scanner> {
        let storage = Arc::new(MemoryStorage::new(id));
        let cache = Arc::new(Cache::new(ctx, id).unwrap());
        Arc::new(Scanner::new(storage, cache, ScanConfig::default()))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let ctx = CacheContext::in_memory().unwrap();
        let view = View::new();
        view.mount("/", scanner(&ctx, "memory::root"));
        view.mount("/alice", scanner(&ctx, "memory::alice"));
        view.mount("/alice/files/shared", scanner(&ctx, "memory::shared"));

        let (mount, internal) = view.resolve("/alice/files/docs/a.txt").unwrap();
        assert_eq!(mount.storage().id(), "memory::alice");
        assert_eq!(internal, "files/docs/a.txt");

        let (mount, internal) = view.resolve("/alice/files/shared/x").unwrap();
        assert_eq!(mount.storage().id(), "memory::shared");
        assert_eq!(internal, "x");

        let (mount, internal) = view.resolve("/alice").unwrap();
        assert_eq!(mount.storage().id(), "memory::alice");
        assert_eq!(internal, "");

        let (mount, internal) = view.resolve("/alicexyz").unwrap();
        assert_eq!(mount.storage().id(), "memory::root");
        assert_eq!(internal, "alicexyz");
    }

    #[test]
    fn test_unmounted_path() {
        let ctx = CacheContext::in_memory().unwrap();
        let view = View::new();
        view.mount("/alice", scanner(&ctx, "memory::alice"));
        assert!(view.resolve("/bob/files").is_none());

        assert!(view.unmount("/alice/"));
        assert!(view.resolve("/alice").is_none());
        assert!(!view.unmount("/alice"));
    }

    #[test]
    fn test_view_path() {
        let ctx = CacheContext::in_memory().unwrap();
        let view = View::new();
        let mount = view.mount("/alice/", scanner(&ctx, "memory::alice"));
        assert_eq!(mount.view_path("files/a.txt"), "/alice/files/a.txt");
        assert_eq!(mount.view_path(""), "/alice");

        let root = view.mount("", scanner(&ctx, "memory::root"));
        assert_eq!(root.view_path("x"), "/x");
        assert_eq!(root.view_path(""), "/");
    }
}
