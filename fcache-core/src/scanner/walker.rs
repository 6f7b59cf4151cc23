use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use super::progress::{ScanEvent, ScanProgress, SharedProgress};
use crate::backend::Storage;
use crate::cache::{Cache, CacheEntry, EntryData, FileId, SIZE_UNKNOWN};
use crate::config::CacheConfig;
use crate::events::Emitter;
use crate::path;
use crate::{CacheError, Result};

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File names that are never indexed
    pub blacklisted_files: Vec<String>,
    /// Suffix of in-progress uploads
    pub partial_file_suffix: String,
    /// Reconcile each folder's children inside one transaction
    pub use_transactions: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for ScanConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            blacklisted_files: config.blacklisted_files.clone(),
            partial_file_suffix: config.partial_file_suffix.clone(),
            use_transactions: true,
        }
    }
}

/// How far a scan descends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// The path and its direct children
    Shallow,
    /// Everything below the path
    Recursive,
    /// Only into child folders whose size is still unknown
    RecursiveIncomplete,
}

/// Which cached fields a rescan may keep when the backend mtime is unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reuse(u8);

impl Reuse {
    pub const NONE: Reuse = Reuse(0);
    pub const ETAG: Reuse = Reuse(1);
    pub const SIZE: Reuse = Reuse(2);

    pub fn contains(self, other: Reuse) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Reuse used when the caller does not choose
    pub fn default_for(mode: ScanMode) -> Reuse {
        match mode {
            ScanMode::Shallow => Reuse::ETAG | Reuse::SIZE,
            _ => Reuse::ETAG,
        }
    }
}

impl BitOr for Reuse {
    type Output = Reuse;

    fn bitor(self, rhs: Reuse) -> Reuse {
        Reuse(self.0 | rhs.0)
    }
}

/// Cancellation token for stopping scans
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What a scan learned about one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub file_id: FileId,
    /// Metadata as written, after reusing cached fields
    pub data: EntryData,
    /// Size before this scan, 0 when the path was new
    pub old_size: i64,
    /// The stored etag changed
    pub etag_changed: bool,
}

impl ScannedFile {
    pub fn size(&self) -> i64 {
        self.data.size.unwrap_or(SIZE_UNKNOWN)
    }

    pub fn is_dir(&self) -> bool {
        self.data.is_dir()
    }
}

/// Whether `path` is an upload still in progress
pub fn is_partial_file(path: &str, suffix: &str) -> bool {
    path.ends_with(suffix) || path.contains(&format!("{suffix}/"))
}

/// Reconciles a cache with its storage backend
pub struct Scanner {
    storage: Arc<dyn Storage>,
    cache: Arc<Cache>,
    config: ScanConfig,
    cancel_token: CancellationToken,
    progress: Arc<SharedProgress>,
    events: Arc<Emitter<ScanEvent>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("storage", &self.storage.id())
            .field("config", &self.config)
            .finish()
    }
}

impl Scanner {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<Cache>, config: ScanConfig) -> Self {
        Self {
            storage,
            cache,
            config,
            cancel_token: CancellationToken::new(),
            progress: Arc::new(SharedProgress::default()),
            events: Arc::new(Emitter::new()),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn progress(&self) -> ScanProgress {
        self.progress.to_scan_progress()
    }

    fn is_excluded(&self, path: &str) -> bool {
        if is_partial_file(path, &self.config.partial_file_suffix) {
            return true;
        }
        let name = path::basename(path);
        self.config
            .blacklisted_files
            .iter()
            .any(|b| b.eq_ignore_ascii_case(name))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(())
    }

    /// Scan `path` and, for folders, its children.
    ///
    /// `reuse` defaults to [`Reuse::default_for`] the mode. Partial entries
    /// buffered during the scan are discarded when it ends.
    pub fn scan(
        &self,
        path: &str,
        mode: ScanMode,
        reuse: Option<Reuse>,
    ) -> Result<Option<ScannedFile>> {
        let path = path::normalize(path);
        let reuse = reuse.unwrap_or_else(|| Reuse::default_for(mode));

        let result = self.scan_file(&path, reuse).and_then(|scanned| match scanned {
            Some(mut scanned) if scanned.is_dir() => {
                let size = self.scan_children_of(&path, scanned.file_id, mode, reuse)?;
                scanned.data.size = Some(size);
                Ok(Some(scanned))
            }
            other => Ok(other),
        });

        self.cache.discard_partial();
        self.events.emit(ScanEvent::Progress(self.progress()));
        result
    }

    /// Stat one path and bring its cache row up to date.
    ///
    /// Returns `None` for excluded paths and for paths the backend cannot
    /// produce, which are removed from the cache.
    pub fn scan_file(&self, path: &str, reuse: Reuse) -> Result<Option<ScannedFile>> {
        let path = path::normalize(path);
        self.scan_file_with(&path, reuse, None, None)
    }

    fn scan_file_with(
        &self,
        path: &str,
        reuse: Reuse,
        parent_known: Option<FileId>,
        cached: Option<CacheEntry>,
    ) -> Result<Option<ScannedFile>> {
        if self.is_excluded(path) {
            trace!(path, "skipping excluded path");
            return Ok(None);
        }

        self.events.emit(ScanEvent::ScanFile(path.to_string()));
        self.progress.set_current(path);

        let meta = match self.storage.metadata(path) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                debug!(path, storage = self.storage.id(), "backend returned no metadata");
                self.remove_from_cache(path)?;
                return Ok(None);
            }
            Err(e) => {
                debug!(path, storage = self.storage.id(), error = %e, "backend unavailable");
                self.remove_from_cache(path)?;
                return Ok(None);
            }
        };

        if !path.is_empty() && parent_known.is_none() {
            let parent = path::parent(path);
            if self.cache.id(parent)?.is_none()
                && self.scan_file_with(parent, reuse, None, None)?.is_none()
            {
                return Ok(None);
            }
        }

        let mut cached = match cached {
            Some(entry) => Some(entry),
            None => self.cache.fetch_by_path(path)?,
        };

        // a folder replaced by a file loses its children
        if cached.as_ref().is_some_and(|c| c.is_dir()) && !meta.is_dir() {
            self.remove_from_cache(path)?;
            cached = None;
        }

        let mut data = meta.into_entry_data();
        let scanned = match cached {
            Some(cached) => {
                if !reuse.is_none() {
                    let mtime_unchanged = data.storage_mtime == Some(cached.storage_mtime);
                    // folders still waiting for their size never keep stale fields
                    if mtime_unchanged && cached.has_known_size() {
                        data.mtime = Some(cached.mtime);
                        if reuse.contains(Reuse::SIZE) && data.size == Some(SIZE_UNKNOWN) {
                            data.size = Some(cached.size);
                        }
                        if reuse.contains(Reuse::ETAG) && !cached.etag.is_empty() {
                            data.etag = Some(cached.etag.clone());
                        }
                    }
                }

                let diff = data.diff(&cached);
                let etag_changed = diff.etag.is_some();
                if !diff.is_empty() {
                    self.cache.update(cached.file_id, &diff)?;
                    self.events.emit(ScanEvent::UpdateCache {
                        path: path.to_string(),
                        file_id: cached.file_id,
                    });
                }
                ScannedFile {
                    file_id: cached.file_id,
                    data,
                    old_size: cached.size,
                    etag_changed,
                }
            }
            None => {
                let file_id = self.cache.put(path, data.clone())?.ok_or_else(|| {
                    CacheError::invalid_state(format!("incomplete scan data for {path}"))
                })?;
                self.events.emit(ScanEvent::AddToCache {
                    path: path.to_string(),
                    file_id,
                });
                ScannedFile {
                    file_id,
                    data,
                    old_size: 0,
                    etag_changed: true,
                }
            }
        };

        if scanned.is_dir() {
            self.progress.record_dir();
        } else {
            self.progress.record_file(scanned.size());
            self.events.emit(ScanEvent::PostScanFile(path.to_string()));
        }
        Ok(Some(scanned))
    }

    fn remove_from_cache(&self, path: &str) -> Result<()> {
        if self.cache.id(path)?.is_none() {
            return Ok(());
        }
        self.events.emit(ScanEvent::RemoveFromCache(path.to_string()));
        self.cache.remove(path)?;
        self.progress.record_removed();
        Ok(())
    }

    /// Reconcile the cached children of folder `path` with the backend.
    ///
    /// Returns the folder size, `-1` when any part of it is unknown. The
    /// folder's cached size is set to that value.
    pub fn scan_children(&self, path: &str, mode: ScanMode, reuse: Reuse) -> Result<i64> {
        let path = path::normalize(path);
        let folder_id = match self.cache.id(&path)? {
            Some(id) => id,
            None => match self.scan_file(&path, reuse)? {
                Some(scanned) => scanned.file_id,
                None => return Ok(SIZE_UNKNOWN),
            },
        };
        self.scan_children_of(&path, folder_id, mode, reuse)
    }

    fn scan_children_of(
        &self,
        path: &str,
        folder_id: FileId,
        mode: ScanMode,
        reuse: Reuse,
    ) -> Result<i64> {
        self.check_cancelled()?;
        self.events.emit(ScanEvent::ScanFolder(path.to_string()));

        let (mut size, queue) = if self.config.use_transactions {
            self.cache
                .db()
                .transaction(|| self.reconcile_children(path, folder_id, mode, reuse))?
        } else {
            self.reconcile_children(path, folder_id, mode, reuse)?
        };

        for (child_path, child_id) in queue {
            let child_size = self.scan_children_of(&child_path, child_id, mode, reuse)?;
            if child_size == SIZE_UNKNOWN {
                size = SIZE_UNKNOWN;
            } else if size != SIZE_UNKNOWN {
                size += child_size;
            }
        }

        self.cache.update(folder_id, &EntryData::new().size(size))?;
        self.events.emit(ScanEvent::PostScanFolder(path.to_string()));
        self.events.emit(ScanEvent::Progress(self.progress()));
        Ok(size)
    }

    /// One folder level: scan listed children, drop vanished ones, and
    /// return the known size plus the child folders still to descend into
    fn reconcile_children(
        &self,
        path: &str,
        folder_id: FileId,
        mode: ScanMode,
        reuse: Reuse,
    ) -> Result<(i64, Vec<(String, FileId)>)> {
        let mut existing: HashMap<String, CacheEntry> = self
            .cache
            .folder_contents_by_id(folder_id)?
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

        let listed = match self.storage.list(path) {
            Ok(names) => names,
            Err(e) => {
                debug!(path, error = %e, "listing failed, treating folder as empty");
                Vec::new()
            }
        };

        let mut size = 0i64;
        let mut queue = Vec::new();
        for name in listed {
            self.check_cancelled()?;

            let child_path = path::join(path, &path::normalize(&name));
            let cached = existing.remove(path::basename(&child_path));
            let scanned = match self.scan_file_with(&child_path, reuse, Some(folder_id), cached) {
                Ok(Some(scanned)) => scanned,
                Ok(None) => continue,
                Err(e) if e.is_conflict() => {
                    warn!(path = %child_path, error = %e, "skipping child after write conflict");
                    self.progress.record_error();
                    continue;
                }
                Err(e) => return Err(e),
            };

            let descend = scanned.is_dir()
                && match mode {
                    ScanMode::Recursive => true,
                    ScanMode::RecursiveIncomplete => scanned.size() == SIZE_UNKNOWN,
                    ScanMode::Shallow => false,
                };
            if descend {
                queue.push((child_path, scanned.file_id));
            } else if scanned.size() == SIZE_UNKNOWN {
                size = SIZE_UNKNOWN;
            } else if size != SIZE_UNKNOWN {
                size += scanned.size();
            }
        }

        for name in existing.into_keys() {
            self.remove_from_cache(&path::join(path, &name))?;
        }
        Ok((size, queue))
    }

    /// Complete every folder whose size is unknown.
    ///
    /// Stops when none remain, or when the same folder comes back twice in a
    /// row because it cannot be completed.
    pub fn background_scan(&self) -> Result<()> {
        let mut last: Option<String> = None;
        while let Some(path) = self.cache.incomplete()? {
            self.check_cancelled()?;
            if last.as_deref() == Some(path.as_str()) {
                warn!(
                    path = %path,
                    storage = self.storage.id(),
                    "background scan made no progress, stopping"
                );
                break;
            }

            let reuse = Some(Reuse::ETAG | Reuse::SIZE);
            match self.scan(&path, ScanMode::RecursiveIncomplete, reuse) {
                Ok(_) => {}
                Err(e @ (CacheError::InvalidState(_) | CacheError::Cancelled)) => return Err(e),
                Err(e) => warn!(path = %path, error = %e, "background scan job failed"),
            }
            self.cache.correct_folder_size_after_background_scan(&path)?;
            last = Some(path);
        }
        info!(storage = self.storage.id(), "background scan finished");
        Ok(())
    }

    /// Run [`Scanner::scan`] on a worker thread.
    ///
    /// Progress is sent every 100ms until the scan ends; all scan events are
    /// forwarded on the same channel.
    pub fn spawn_scan(
        self: Arc<Self>,
        path: String,
        mode: ScanMode,
    ) -> (Receiver<ScanEvent>, JoinHandle<Result<Option<ScannedFile>>>) {
        let rx = self.subscribe();

        let handle = std::thread::spawn(move || {
            let done = Arc::new(AtomicBool::new(false));
            let done_for_heartbeat = Arc::clone(&done);
            let progress_for_heartbeat = Arc::clone(&self.progress);
            let events_for_heartbeat = Arc::clone(&self.events);
            let cancel_for_heartbeat = self.cancel_token.clone();

            let heartbeat = std::thread::spawn(move || {
                while !done_for_heartbeat.load(Ordering::Relaxed)
                    && !cancel_for_heartbeat.is_cancelled()
                {
                    std::thread::sleep(Duration::from_millis(100));
                    events_for_heartbeat
                        .emit(ScanEvent::Progress(progress_for_heartbeat.to_scan_progress()));
                }
            });

            let result = self.scan(&path, mode, None);
            done.store(true, Ordering::Relaxed);
            let _ = heartbeat.join();
            result
        });

        (rx, handle)
    }
}
