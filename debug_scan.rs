// Run with: cargo run --example debug_scan -- /path/to/scan
// Scans into a throwaway in-memory index and prints every scanner event.

use std::sync::Arc;
use std::time::Instant;

use fcache_core::{
    Cache, CacheContext, LocalStorage, ScanConfig, ScanEvent, ScanMode, Scanner, Storage,
    format_size,
};

fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());
    println!("Scanning: {path}");

    let ctx = CacheContext::in_memory().expect("in-memory index");
    let storage = Arc::new(LocalStorage::new(&path));
    let cache = Arc::new(Cache::new(&ctx, storage.id()).expect("cache"));
    let scanner = Scanner::new(storage, Arc::clone(&cache), ScanConfig::from(ctx.config()));
    let rx = scanner.subscribe();

    let start = Instant::now();
    let result = scanner.scan("", ScanMode::Recursive, None);

    for event in rx.try_iter() {
        let elapsed = start.elapsed().as_secs_f64();
        match event {
            ScanEvent::ScanFolder(p) => println!("[{elapsed:>6.2}s] folder  {p}"),
            ScanEvent::AddToCache { path, file_id } => {
                println!("[{elapsed:>6.2}s] add     {path} (#{file_id})")
            }
            ScanEvent::UpdateCache { path, file_id } => {
                println!("[{elapsed:>6.2}s] update  {path} (#{file_id})")
            }
            ScanEvent::RemoveFromCache(p) => println!("[{elapsed:>6.2}s] remove  {p}"),
            ScanEvent::Progress(p) => println!(
                "[{elapsed:>6.2}s] files={} dirs={} bytes={} errors={}",
                p.files_scanned, p.dirs_scanned, p.bytes_scanned, p.errors
            ),
            _ => {}
        }
    }

    match result {
        Ok(Some(root)) => println!("\nFinal: {} total size", format_size(root.size())),
        Ok(None) => println!("\nNothing scanned"),
        Err(e) => println!("\nERROR: {e}"),
    }
}
