use serde::{Deserialize, Serialize};

/// How often the watcher asks the backend whether a path changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchPolicy {
    /// Trust the cache, never check
    Never,
    /// Check each path at most once per watcher
    #[default]
    Once,
    /// Check on every access
    Always,
}

/// Settings shared by every cache built from one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound of not-yet-persisted partial entries kept per cache
    pub partial_capacity: usize,
    /// File names the scanner never indexes
    pub blacklisted_files: Vec<String>,
    /// Suffix of in-progress uploads
    pub partial_file_suffix: String,
    pub watch_policy: WatchPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partial_capacity: 1024,
            blacklisted_files: vec![".htaccess".to_string()],
            partial_file_suffix: ".part".to_string(),
            watch_policy: WatchPolicy::Once,
        }
    }
}
