mod progress;
mod walker;

pub use progress::{ScanEvent, ScanProgress};
pub use walker::{
    CancellationToken, Reuse, ScanConfig, ScanMode, ScannedFile, Scanner, is_partial_file,
};
