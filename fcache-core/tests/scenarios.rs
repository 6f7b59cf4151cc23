use std::collections::HashMap;
use std::sync::Arc;

use fcache_core::{
    Cache, CacheContext, CacheEvent, CacheStatus, Database, EntryData, LocalStorage,
    MemoryStorage, Reuse, SIZE_UNKNOWN, ScanConfig, ScanMode, Scanner, Storage, Updater, View,
};
use tempfile::TempDir;

fn memory_scanner(storage: MemoryStorage) -> (Arc<MemoryStorage>, Arc<Scanner>) {
    let storage = Arc::new(storage);
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Arc::new(Cache::new(&ctx, storage.id()).unwrap());
    let scanner = Arc::new(Scanner::new(storage.clone(), cache, ScanConfig::default()));
    (storage, scanner)
}

fn file(size: i64) -> EntryData {
    EntryData::new()
        .size(size)
        .mtime(100)
        .storage_mtime(100)
        .mimetype("text/plain")
        .etag("etag")
        .permissions(31)
}

#[test]
fn put_then_get_returns_every_field() {
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Cache::new(&ctx, "local::roundtrip").unwrap();
    cache.put("", EntryData::folder().mtime(1)).unwrap();
    cache.put("docs", EntryData::folder().mtime(1)).unwrap();

    let data = file(42)
        .encrypted(true)
        .unencrypted_size(40)
        .extra("checksum", "md5:abc");
    let id = cache.put("docs/a.txt", data).unwrap().unwrap();

    let entry = cache.get_entry("docs/a.txt").unwrap().unwrap();
    assert_eq!(entry.file_id, id);
    assert_eq!(entry.size, 42);
    assert_eq!(entry.mtime, 100);
    assert_eq!(entry.storage_mtime, 100);
    assert_eq!(entry.mimetype, "text/plain");
    assert_eq!(entry.mimepart, "text");
    assert_eq!(entry.etag, "etag");
    assert_eq!(entry.permissions, 31);
    assert!(entry.encrypted);
    assert_eq!(entry.unencrypted_size, 40);
    assert_eq!(entry.extra.get("checksum").map(String::as_str), Some("md5:abc"));
    assert_eq!(entry.parent, cache.id("docs").unwrap());
}

#[test]
fn folder_size_is_sum_of_children_or_unknown() {
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Cache::new(&ctx, "local::aggregate").unwrap();
    cache.put("", EntryData::folder().mtime(1)).unwrap();
    cache.put("f", EntryData::folder().mtime(1)).unwrap();
    cache.put("f/a", file(3)).unwrap();
    cache.put("f/b", file(4)).unwrap();

    assert_eq!(cache.calculate_folder_size("f", None).unwrap(), 7);
    assert_eq!(cache.get_entry("f").unwrap().unwrap().size, 7);

    cache.put("f/sub", EntryData::folder().mtime(1)).unwrap();
    assert_eq!(cache.calculate_folder_size("f", None).unwrap(), SIZE_UNKNOWN);
    assert_eq!(cache.get_entry("f").unwrap().unwrap().size, SIZE_UNKNOWN);
}

#[test]
fn removing_a_folder_removes_every_descendant() {
    let (_, scanner) = memory_scanner(
        MemoryStorage::new("memory::cascade")
            .with_file("a/b/c/d.txt", 1, 10)
            .with_file("a/b/e.txt", 1, 10)
            .with_file("keep.txt", 1, 10),
    );
    scanner.scan("", ScanMode::Recursive, None).unwrap();
    let cache = scanner.cache();

    cache.remove("a").unwrap();
    assert!(cache.folder_contents("a").unwrap().is_empty());
    for path in ["a", "a/b", "a/b/c", "a/b/c/d.txt", "a/b/e.txt"] {
        assert!(cache.id(path).unwrap().is_none(), "{path}");
    }
    assert!(cache.in_cache("keep.txt").unwrap());
}

#[test]
fn move_keeps_every_file_id() {
    let (_, scanner) = memory_scanner(
        MemoryStorage::new("memory::move")
            .with_file("src/x/1.txt", 1, 10)
            .with_file("src/2.txt", 1, 10)
            .with_dir("dst", 10),
    );
    scanner.scan("", ScanMode::Recursive, None).unwrap();
    let cache = scanner.cache();

    let before: HashMap<&str, _> = ["src", "src/x", "src/x/1.txt", "src/2.txt"]
        .into_iter()
        .map(|p| (p, cache.id(p).unwrap().unwrap()))
        .collect();

    cache.move_entry("src", "dst/moved").unwrap();

    assert_eq!(cache.id("dst/moved").unwrap(), Some(before["src"]));
    assert_eq!(cache.id("dst/moved/x").unwrap(), Some(before["src/x"]));
    assert_eq!(cache.id("dst/moved/x/1.txt").unwrap(), Some(before["src/x/1.txt"]));
    assert_eq!(cache.id("dst/moved/2.txt").unwrap(), Some(before["src/2.txt"]));
    assert!(cache.id("src").unwrap().is_none());
    assert_eq!(
        cache.get_entry("dst/moved").unwrap().unwrap().parent,
        cache.id("dst").unwrap()
    );
}

#[test]
fn partial_puts_accumulate_into_one_row() {
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Cache::new(&ctx, "local::partial").unwrap();
    cache.put("", EntryData::folder().mtime(1)).unwrap();

    assert_eq!(cache.put("a.txt", EntryData::new().size(5)).unwrap(), None);
    assert_eq!(cache.status("a.txt").unwrap(), CacheStatus::Partial);

    let id = cache
        .put("a.txt", EntryData::new().mtime(10).mimetype("text/plain"))
        .unwrap()
        .unwrap();
    let entry = cache.get_entry("a.txt").unwrap().unwrap();
    assert_eq!(entry.file_id, id);
    assert_eq!(entry.size, 5);
    assert_eq!(entry.mtime, 10);
    assert_eq!(entry.mimetype, "text/plain");
    assert_eq!(cache.folder_contents("").unwrap().len(), 1);
}

#[test]
fn propagation_touches_each_ancestor_once() {
    let (storage, scanner) = memory_scanner(
        MemoryStorage::new("memory::propagate")
            .with_file("a/b/c", 1, 10)
            .with_file("a/b/d", 1, 10),
    );
    scanner.scan("", ScanMode::Recursive, None).unwrap();
    let cache = Arc::clone(scanner.cache());
    let events = cache.subscribe();

    let view = Arc::new(View::new());
    view.mount("/", scanner);
    let updater = Updater::new(view);
    storage.reset_calls();

    let propagator = updater.propagator();
    propagator.add_change("/a/b/c");
    propagator.add_change("/a/b/d");
    propagator.propagate_changes(Some(1_000)).unwrap();

    for folder in ["", "a", "a/b"] {
        assert_eq!(storage.call_count("etag", folder), 1, "{folder}");
        assert!(cache.get_entry(folder).unwrap().unwrap().mtime >= 1_000);
    }

    let mut writes: HashMap<String, usize> = HashMap::new();
    for event in events.try_iter() {
        if let CacheEvent::Updated { path, .. } = event {
            *writes.entry(path).or_default() += 1;
        }
    }
    assert_eq!(writes.len(), 3);
    assert!(writes.values().all(|&n| n == 1));
}

#[test]
fn home_root_ignores_trashbin() {
    let storage = Arc::new(
        MemoryStorage::new("home::alice")
            .with_file("files/a.txt", 10, 10)
            .with_dir("files_trashbin", 10)
            .with_dir("files_versions", 10),
    );
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Arc::new(Cache::new_home(&ctx, storage.id()).unwrap());
    let scanner = Arc::new(Scanner::new(
        storage.clone(),
        Arc::clone(&cache),
        ScanConfig::default(),
    ));
    scanner.scan("", ScanMode::Recursive, None).unwrap();
    assert_eq!(cache.get_entry("").unwrap().unwrap().size, 10);

    let view = Arc::new(View::new());
    view.mount("/alice", scanner);
    let updater = Updater::new(view);

    storage.write("files_trashbin/old.txt", 999, 20);
    updater.update("/alice/files_trashbin/old.txt", None).unwrap();
    assert_eq!(cache.get_entry("").unwrap().unwrap().size, 10);

    storage.delete("files_trashbin/old.txt", 30);
    updater.remove("/alice/files_trashbin/old.txt").unwrap();
    assert_eq!(cache.get_entry("").unwrap().unwrap().size, 10);

    storage.write("files/b.txt", 5, 40);
    updater.update("/alice/files/b.txt", None).unwrap();
    assert_eq!(cache.get_entry("").unwrap().unwrap().size, 15);
}

#[test]
fn fresh_scan_of_docs() {
    let (_, scanner) = memory_scanner(
        MemoryStorage::new("memory::fresh")
            .with_file("docs/a.txt", 10, 10)
            .with_file("docs/b.txt", 20, 10),
    );
    scanner.scan("/docs", ScanMode::Recursive, None).unwrap();
    let cache = scanner.cache();

    assert_eq!(cache.get_entry("/docs").unwrap().unwrap().size, 30);
    assert_eq!(cache.get_entry("/docs/a.txt").unwrap().unwrap().size, 10);
    assert_eq!(cache.status("/docs").unwrap(), CacheStatus::Complete);
}

#[test]
fn deleted_file_is_reconciled() {
    let (storage, scanner) = memory_scanner(
        MemoryStorage::new("memory::reconcile")
            .with_file("docs/a.txt", 10, 10)
            .with_file("docs/b.txt", 20, 10),
    );
    scanner.scan("", ScanMode::Recursive, None).unwrap();

    storage.delete("docs/b.txt", 20);
    scanner
        .scan_children("/docs", ScanMode::Shallow, Reuse::ETAG | Reuse::SIZE)
        .unwrap();

    let cache = scanner.cache();
    assert!(!cache.in_cache("/docs/b.txt").unwrap());
    assert_eq!(cache.get_entry("/docs").unwrap().unwrap().size, 10);
}

#[test]
fn unknown_size_moves_up_one_level_per_call() {
    let ctx = CacheContext::in_memory().unwrap();
    let cache = Cache::new(&ctx, "local::unknown").unwrap();
    cache.put("", EntryData::folder().mtime(1)).unwrap();
    cache.put("x", EntryData::folder().mtime(1)).unwrap();
    cache.put("x/y", EntryData::folder().mtime(1)).unwrap();
    cache.put("x/y/f", file(4)).unwrap();
    cache.correct_folder_size("x/y").unwrap();
    assert_eq!(cache.get_entry("x").unwrap().unwrap().size, 4);

    cache.put("x/y/pending", EntryData::folder().mtime(1)).unwrap();
    assert_eq!(cache.calculate_folder_size("x/y", None).unwrap(), SIZE_UNKNOWN);
    assert_eq!(cache.get_entry("x/y").unwrap().unwrap().size, SIZE_UNKNOWN);
    assert_eq!(cache.get_entry("x").unwrap().unwrap().size, 4);

    assert_eq!(cache.calculate_folder_size("x", None).unwrap(), SIZE_UNKNOWN);
    assert_eq!(cache.get_entry("x").unwrap().unwrap().size, SIZE_UNKNOWN);
}

#[test]
fn local_directory_index_survives_reopen() {
    let data = TempDir::new().unwrap();
    std::fs::create_dir(data.path().join("docs")).unwrap();
    std::fs::write(data.path().join("docs/a.txt"), "0123456789").unwrap();
    std::fs::write(data.path().join("docs/b.txt"), "01234567890123456789").unwrap();

    let index = TempDir::new().unwrap();
    let db_path = index.path().join("index.db");
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(data.path()));

    {
        let ctx = CacheContext::new(Database::open(&db_path).unwrap(), Default::default());
        let cache = Arc::new(Cache::new(&ctx, storage.id()).unwrap());
        let scanner = Scanner::new(Arc::clone(&storage), cache, ScanConfig::default());
        scanner.scan("", ScanMode::Recursive, None).unwrap();
    }

    let ctx = CacheContext::new(Database::open(&db_path).unwrap(), Default::default());
    let cache = Cache::new(&ctx, storage.id()).unwrap();
    assert_eq!(cache.get_entry("docs").unwrap().unwrap().size, 30);
    assert_eq!(
        cache.get_entry("docs/a.txt").unwrap().unwrap().mimetype,
        "text/plain"
    );
    assert_eq!(cache.search("*.txt").unwrap().len(), 2);
}
