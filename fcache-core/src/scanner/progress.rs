use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cache::FileId;

/// Notifications emitted while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// About to stat a path
    ScanFile(String),
    /// A file (not a folder) was scanned
    PostScanFile(String),
    /// About to reconcile the children of a folder
    ScanFolder(String),
    PostScanFolder(String),
    AddToCache { path: String, file_id: FileId },
    UpdateCache { path: String, file_id: FileId },
    RemoveFromCache(String),
    /// Periodic counters
    Progress(ScanProgress),
}

/// Scanning progress statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanProgress {
    /// Number of files scanned
    pub files_scanned: u64,
    /// Number of directories scanned
    pub dirs_scanned: u64,
    /// Total bytes of scanned files
    pub bytes_scanned: u64,
    /// Children skipped because of write conflicts
    pub errors: u64,
    /// Entries removed because the backend no longer has them
    pub removed: u64,
    /// Path being scanned
    pub current_path: Option<String>,
}

impl ScanProgress {
    pub fn total_entries(&self) -> u64 {
        self.files_scanned + self.dirs_scanned
    }
}

/// Counters shared between a running scan and its heartbeat
#[derive(Debug, Default)]
pub(crate) struct SharedProgress {
    pub files_scanned: AtomicU64,
    pub dirs_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub errors: AtomicU64,
    pub removed: AtomicU64,
    pub current_path: Mutex<Option<String>>,
}

impl SharedProgress {
    pub fn to_scan_progress(&self) -> ScanProgress {
        ScanProgress {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            current_path: self.current_path.lock().clone(),
        }
    }

    pub fn record_file(&self, size: i64) {
        self.files_scanned.fetch_add(1, Ordering::Relaxed);
        if size > 0 {
            self.bytes_scanned.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_dir(&self) {
        self.dirs_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current(&self, path: &str) {
        *self.current_path.lock() = Some(path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_progress_snapshot() {
        let shared = SharedProgress::default();
        shared.record_file(10);
        shared.record_file(-1);
        shared.record_dir();
        shared.record_error();
        shared.set_current("docs");

        let progress = shared.to_scan_progress();
        assert_eq!(progress.files_scanned, 2);
        assert_eq!(progress.bytes_scanned, 10);
        assert_eq!(progress.total_entries(), 3);
        assert_eq!(progress.errors, 1);
        assert_eq!(progress.current_path.as_deref(), Some("docs"));
    }
}
