pub mod backend;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod mimetype;
pub mod path;
pub mod permissions;
pub mod propagator;
pub mod scanner;
pub mod size;
pub mod storages;
pub mod updater;
pub mod view;
pub mod watcher;

pub use backend::{LocalStorage, MemoryStorage, Metadata, Stat, Storage};
pub use cache::{
    Cache, CacheContext, CacheEntry, CacheEvent, CacheStatus, DIRECTORY_MIMETYPE, Entry,
    EntryData, FileId, SIZE_UNKNOWN,
};
pub use config::{CacheConfig, WatchPolicy};
pub use db::Database;
pub use error::{CacheError, Result, StorageError, StorageResult};
pub use mimetype::MimetypeRegistry;
pub use permissions::Permissions;
pub use propagator::{ChangePropagator, Propagated};
pub use scanner::{
    CancellationToken, Reuse, ScanConfig, ScanEvent, ScanMode, ScanProgress, ScannedFile, Scanner,
};
pub use size::{format_count, format_entry, format_size};
pub use storages::StorageIdentity;
pub use updater::Updater;
pub use view::{Mount, View};
pub use watcher::Watcher;
