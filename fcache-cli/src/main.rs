use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use crossbeam_channel::RecvTimeoutError;
use fcache_core::{
    Cache, CacheConfig, CacheContext, CacheStatus, Database, LocalStorage, ScanConfig, ScanEvent,
    ScanMode, Scanner, Storage, WatchPolicy, Watcher, format_count, format_entry, format_size,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// fcache - metadata index for a local directory
#[derive(Parser, Debug)]
#[command(name = "fcache")]
#[command(about = "Scan a directory into a persistent metadata index and query it")]
#[command(version)]
struct Cli {
    /// Index database (defaults to the user cache directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a directory into the index
    Scan {
        dir: PathBuf,
        /// Only the top level; subfolders keep an unknown size
        #[arg(long)]
        shallow: bool,
    },
    /// Complete every folder whose size is still unknown
    Background { dir: PathBuf },
    /// List the cached children of a folder
    Ls {
        dir: PathBuf,
        #[arg(default_value = "")]
        path: String,
    },
    /// Show how complete the index is for a path
    Status {
        dir: PathBuf,
        #[arg(default_value = "")]
        path: String,
    },
    /// Find entries by name pattern (`*` and `?` wildcards) or mimetype
    Search {
        dir: PathBuf,
        pattern: String,
        /// Match the pattern against the mimetype (`image` or `image/png`)
        #[arg(long)]
        mime: bool,
    },
    /// Rescan a path if it changed since it was indexed
    Check {
        dir: PathBuf,
        #[arg(default_value = "")]
        path: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };

    match cli.command {
        Command::Scan { dir, shallow } => {
            let mode = if shallow {
                ScanMode::Shallow
            } else {
                ScanMode::Recursive
            };
            run_scan(&db_path, &dir, mode)
        }
        Command::Background { dir } => {
            let index = Index::open(&db_path, &dir)?;
            index.scanner.background_scan()?;
            print_summary(&index.cache)
        }
        Command::Ls { dir, path } => {
            let index = Index::open(&db_path, &dir)?;
            for entry in index.cache.folder_contents(&path)? {
                println!("{}", format_entry(&entry));
            }
            Ok(())
        }
        Command::Status { dir, path } => {
            let index = Index::open(&db_path, &dir)?;
            let status = match index.cache.status(&path)? {
                CacheStatus::NotFound => "not indexed",
                CacheStatus::Partial => "partial",
                CacheStatus::Shallow => "shallow (size unknown)",
                CacheStatus::Complete => "complete",
            };
            println!("{status}");
            if let Some(entry) = index.cache.get_entry(&path)? {
                println!("size:  {}", format_size(entry.size));
                println!("etag:  {}", entry.etag);
                println!("mtime: {}", entry.mtime);
            }
            Ok(())
        }
        Command::Search { dir, pattern, mime } => {
            let index = Index::open(&db_path, &dir)?;
            let results = if mime {
                index.cache.search_by_mime(&pattern)?
            } else {
                index.cache.search(&pattern)?
            };
            for entry in &results {
                println!("{:>10}  {}", format_size(entry.size), entry.path);
            }
            println!("{} matches", format_count(results.len() as u64));
            Ok(())
        }
        Command::Check { dir, path } => {
            let index = Index::open(&db_path, &dir)?;
            let watcher = Watcher::from_config(Arc::clone(&index.scanner), &index.config);
            if watcher.check_update(&path, None)? {
                println!("updated");
            } else {
                println!("unchanged");
            }
            Ok(())
        }
    }
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| eyre!("no user cache directory, pass --db"))?
        .join("fcache");
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    Ok(dir.join("index.db"))
}

/// One local directory and its cache
struct Index {
    config: CacheConfig,
    cache: Arc<Cache>,
    scanner: Arc<Scanner>,
}

impl Index {
    fn open(db_path: &Path, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(eyre!("not a directory: {}", dir.display()));
        }
        let db = Database::open(db_path)
            .wrap_err_with(|| format!("failed to open index {}", db_path.display()))?;
        // a one-shot process has nothing to gain from checking a path only once
        let config = CacheConfig {
            watch_policy: WatchPolicy::Always,
            ..Default::default()
        };
        let scan_config = ScanConfig::from(&config);
        let ctx = CacheContext::new(db, config.clone());

        let storage = Arc::new(LocalStorage::new(dir));
        debug!(storage = storage.id(), db = %db_path.display(), "opening index");
        let cache = Arc::new(Cache::new(&ctx, storage.id())?);
        let scanner = Arc::new(Scanner::new(storage, Arc::clone(&cache), scan_config));
        Ok(Self {
            config,
            cache,
            scanner,
        })
    }
}

fn run_scan(db_path: &Path, dir: &Path, mode: ScanMode) -> Result<()> {
    let index = Index::open(db_path, dir)?;
    info!(dir = %dir.display(), ?mode, "scanning");

    let (rx, handle) = Arc::clone(&index.scanner).spawn_scan(String::new(), mode);
    let start = Instant::now();
    let mut last_print = Instant::now();

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(ScanEvent::Progress(p)) => {
                if last_print.elapsed() > Duration::from_secs(1) {
                    eprintln!(
                        "[{:>6.1}s] files={:<8} dirs={:<8} size={:<10} path={}",
                        start.elapsed().as_secs_f64(),
                        format_count(p.files_scanned),
                        format_count(p.dirs_scanned),
                        format_size(p.bytes_scanned as i64),
                        p.current_path.unwrap_or_default()
                    );
                    last_print = Instant::now();
                }
            }
            Ok(ScanEvent::RemoveFromCache(path)) => debug!(path = %path, "removed from index"),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) if handle.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    handle
        .join()
        .map_err(|_| eyre!("scan thread panicked"))??;

    let progress = index.scanner.progress();
    eprintln!(
        "[{:>6.1}s] done: {} entries ({} files, {} folders), {} removed, {} skipped",
        start.elapsed().as_secs_f64(),
        format_count(progress.total_entries()),
        format_count(progress.files_scanned),
        format_count(progress.dirs_scanned),
        format_count(progress.removed),
        format_count(progress.errors)
    );
    print_summary(&index.cache)
}

fn print_summary(cache: &Cache) -> Result<()> {
    match cache.get_entry("")? {
        Some(root) => println!("{}: {}", cache.storage_id(), format_size(root.size)),
        None => println!("{}: not indexed", cache.storage_id()),
    }
    if let Some(path) = cache.incomplete()? {
        println!("incomplete folders remain, e.g. {path}");
    }
    Ok(())
}
