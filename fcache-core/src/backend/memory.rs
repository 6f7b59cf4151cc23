use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use super::{Stat, Storage, guess_mimetype};
use crate::cache::{DIRECTORY_MIMETYPE, PERMISSION_ALL};
use crate::path;
use crate::{StorageError, StorageResult};

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    size: i64,
    mtime: i64,
    mimetype: Option<String>,
    permissions: u32,
    /// Bumped on every write, feeds the etag
    version: u64,
}

impl Node {
    fn dir(mtime: i64) -> Self {
        Self {
            is_dir: true,
            size: 0,
            mtime,
            mimetype: None,
            permissions: PERMISSION_ALL,
            version: 0,
        }
    }

    fn file(size: i64, mtime: i64) -> Self {
        Self {
            is_dir: false,
            size,
            mtime,
            mimetype: None,
            permissions: PERMISSION_ALL,
            version: 0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    unreadable: HashSet<String>,
    failing: HashSet<String>,
    calls: HashMap<(&'static str, String), usize>,
    next_version: u64,
}

impl State {
    fn record(&mut self, op: &'static str, path: &str) {
        *self.calls.entry((op, path.to_string())).or_default() += 1;
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Create missing parent folders of `path`, touching each folder that
    /// gained a child
    fn ensure_parents(&mut self, path: &str, mtime: i64) {
        let mut current = path.to_string();
        while !current.is_empty() {
            let parent = path::parent(&current).to_string();
            let existed = self.nodes.contains_key(&parent);
            let node = self
                .nodes
                .entry(parent.clone())
                .or_insert_with(|| Node::dir(mtime));
            node.mtime = node.mtime.max(mtime);
            if existed {
                break;
            }
            current = parent;
        }
    }

    fn children<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .keys()
            .filter(move |key| !key.is_empty() && path::parent(key) == path)
            .map(|key| path::basename(key))
    }
}

/// In-process storage tree.
///
/// Records how often each operation was called per path, and can simulate
/// unreadable paths and failing listings.
#[derive(Debug)]
pub struct MemoryStorage {
    id: String,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(id: impl Into<String>) -> Self {
        let mut state = State::default();
        state.nodes.insert(String::new(), Node::dir(0));
        Self {
            id: id.into(),
            state: Mutex::new(state),
        }
    }

    pub fn with_dir(self, path: &str, mtime: i64) -> Self {
        self.mkdir(path, mtime);
        self
    }

    pub fn with_file(self, path: &str, size: i64, mtime: i64) -> Self {
        self.write(path, size, mtime);
        self
    }

    /// Create a folder and any missing parents
    pub fn mkdir(&self, path: &str, mtime: i64) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.ensure_parents(&path, mtime);
        let version = state.bump();
        let node = state.nodes.entry(path).or_insert_with(|| Node::dir(mtime));
        node.mtime = mtime;
        node.version = version;
    }

    /// Create or overwrite a file
    pub fn write(&self, path: &str, size: i64, mtime: i64) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.ensure_parents(&path, mtime);
        let version = state.bump();
        let mut node = Node::file(size, mtime);
        node.version = version;
        if let Some(old) = state.nodes.get(&path) {
            node.mimetype = old.mimetype.clone();
            node.permissions = old.permissions;
        }
        state.nodes.insert(path, node);
    }

    /// Change the mtime without touching the content
    pub fn touch(&self, path: &str, mtime: i64) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        let version = state.bump();
        if let Some(node) = state.nodes.get_mut(&path) {
            node.mtime = mtime;
            node.version = version;
        }
    }

    /// Delete a path and everything below it
    pub fn delete(&self, path: &str, mtime: i64) {
        let path = path::normalize(path);
        let prefix = format!("{path}/");
        let mut state = self.state.lock();
        state
            .nodes
            .retain(|key, _| key != &path && !key.starts_with(&prefix));
        if let Some(parent) = state.nodes.get_mut(path::parent(&path)) {
            parent.mtime = parent.mtime.max(mtime);
        }
    }

    /// Move a path and everything below it
    pub fn rename(&self, source: &str, target: &str, mtime: i64) {
        let source = path::normalize(source);
        let target = path::normalize(target);
        let prefix = format!("{source}/");
        let mut state = self.state.lock();

        let moved: Vec<(String, Node)> = state
            .nodes
            .iter()
            .filter(|(key, _)| **key == source || key.starts_with(&prefix))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect();
        for (key, _) in &moved {
            state.nodes.remove(key);
        }
        if let Some(parent) = state.nodes.get_mut(path::parent(&source)) {
            parent.mtime = parent.mtime.max(mtime);
        }
        state.ensure_parents(&target, mtime);
        for (key, node) in moved {
            let new_key = format!("{target}{}", &key[source.len()..]);
            state.nodes.insert(new_key, node);
        }
    }

    pub fn set_mimetype(&self, path: &str, mimetype: &str) {
        if let Some(node) = self.state.lock().nodes.get_mut(&path::normalize(path)) {
            node.mimetype = Some(mimetype.to_string());
        }
    }

    pub fn set_permissions(&self, path: &str, permissions: u32) {
        if let Some(node) = self.state.lock().nodes.get_mut(&path::normalize(path)) {
            node.permissions = permissions;
        }
    }

    /// Make `path` report as unreadable
    pub fn set_unreadable(&self, path: &str, unreadable: bool) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        if unreadable {
            state.unreadable.insert(path);
        } else {
            state.unreadable.remove(&path);
        }
    }

    /// Make listing `path` fail with an unavailable error
    pub fn fail_listing(&self, path: &str, fail: bool) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        if fail {
            state.failing.insert(path);
        } else {
            state.failing.remove(&path);
        }
    }

    /// How often `op` was called for `path`
    pub fn call_count(&self, op: &str, path: &str) -> usize {
        let path = path::normalize(path);
        self.state
            .lock()
            .calls
            .iter()
            .filter(|((name, p), _)| *name == op && *p == path)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn with_node<T>(
        &self,
        op: &'static str,
        path: &str,
        f: impl FnOnce(&Node) -> T,
    ) -> StorageResult<T> {
        let mut state = self.state.lock();
        state.record(op, path);
        state
            .nodes
            .get(path)
            .map(f)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

impl Storage for MemoryStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_readable(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        state.record("is_readable", path);
        state.nodes.contains_key(path) && !state.unreadable.contains(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        let state = self.state.lock();
        state.nodes.get(path).is_some_and(|n| n.is_dir)
    }

    fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let mut state = self.state.lock();
        state.record("list", path);
        if state.failing.contains(path) {
            return Err(StorageError::Unavailable(path.to_string()));
        }
        if state.unreadable.contains(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        match state.nodes.get(path) {
            Some(node) if node.is_dir => Ok(state.children(path).map(str::to_string).collect()),
            _ => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn stat(&self, path: &str) -> StorageResult<Option<Stat>> {
        let mut state = self.state.lock();
        state.record("stat", path);
        Ok(state.nodes.get(path).map(|node| Stat {
            is_dir: node.is_dir,
            size: node.size,
            mtime: node.mtime,
        }))
    }

    fn mime_type(&self, path: &str) -> StorageResult<String> {
        self.with_node("mime_type", path, |node| {
            if node.is_dir {
                DIRECTORY_MIMETYPE.to_string()
            } else {
                node.mimetype.clone().unwrap_or_else(|| guess_mimetype(path))
            }
        })
    }

    fn etag(&self, path: &str) -> StorageResult<String> {
        self.with_node("etag", path, |node| {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(path.as_bytes());
            hasher.update(&node.version.to_le_bytes());
            hasher.update(&node.mtime.to_le_bytes());
            hasher.update(&node.size.to_le_bytes());
            format!("{:08x}", hasher.finalize())
        })
    }

    fn permissions(&self, path: &str) -> StorageResult<u32> {
        self.with_node("permissions", path, |node| node.permissions)
    }

    fn has_updated(&self, path: &str, time: i64) -> bool {
        let mut state = self.state.lock();
        state.record("has_updated", path);
        state.nodes.get(path).is_none_or(|node| node.mtime > time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MemoryStorage {
        MemoryStorage::new("memory::test")
            .with_file("docs/a.txt", 10, 100)
            .with_file("docs/b.txt", 20, 100)
            .with_dir("empty", 50)
    }

    #[test]
    fn test_builder_creates_parents() {
        let storage = storage();
        assert!(storage.is_dir("docs"));
        assert_eq!(storage.list("").unwrap(), vec!["docs", "empty"]);
        assert_eq!(storage.list("docs").unwrap(), vec!["a.txt", "b.txt"]);
        assert!(storage.list("empty").unwrap().is_empty());
        assert!(matches!(storage.list("nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_metadata() {
        let storage = storage();
        let meta = storage.metadata("docs/a.txt").unwrap().unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.mtime, 100);
        assert_eq!(meta.mimetype, "text/plain");
        assert!(storage.metadata("docs").unwrap().unwrap().is_dir());

        storage.set_unreadable("docs/a.txt", true);
        assert!(storage.metadata("docs/a.txt").unwrap().is_none());
    }

    #[test]
    fn test_write_changes_etag_and_parent_mtime() {
        let storage = storage();
        let before = storage.etag("docs/a.txt").unwrap();
        storage.write("docs/a.txt", 11, 200);
        assert_ne!(storage.etag("docs/a.txt").unwrap(), before);
        assert_eq!(storage.stat("docs").unwrap().unwrap().mtime, 200);
        assert!(storage.has_updated("docs", 100));
        assert!(!storage.has_updated("docs", 200));
        assert!(storage.has_updated("gone", 0));
    }

    #[test]
    fn test_delete_and_rename() {
        let storage = storage();
        storage.rename("docs", "papers", 300);
        assert!(!storage.exists("docs/a.txt"));
        assert!(storage.exists("papers/a.txt"));

        storage.delete("papers", 400);
        assert!(!storage.exists("papers"));
        assert!(!storage.exists("papers/b.txt"));
        assert_eq!(storage.stat("").unwrap().unwrap().mtime, 400);
    }

    #[test]
    fn test_call_counts() {
        let storage = storage();
        storage.etag("docs").unwrap();
        storage.etag("docs").unwrap();
        assert_eq!(storage.call_count("etag", "docs"), 2);
        assert_eq!(storage.call_count("etag", "/docs/"), 2);
        storage.reset_calls();
        assert_eq!(storage.call_count("etag", "docs"), 0);
    }

    #[test]
    fn test_failing_listing() {
        let storage = storage();
        storage.fail_listing("docs", true);
        assert!(matches!(storage.list("docs"), Err(StorageError::Unavailable(_))));
        storage.fail_listing("docs", false);
        assert!(storage.list("docs").is_ok());
    }
}
