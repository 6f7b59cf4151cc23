//! Helpers for storage-relative paths.
//!
//! Cache paths are NFC-normalized, slash separated and carry no leading or
//! trailing slash. The storage root is the empty string.

use unicode_normalization::{IsNormalized, UnicodeNormalization, is_nfc_quick};

/// Normalize a path the way it is stored in the filecache
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    match is_nfc_quick(trimmed.chars()) {
        IsNormalized::Yes => trimmed.to_string(),
        _ => trimmed.nfc().collect(),
    }
}

/// Parent of a normalized path, `""` for top-level entries
pub fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

/// Last path component
pub fn basename(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, name)) => name,
        None => path,
    }
}

/// Extension of the last path component, without the dot
pub fn extension(path: &str) -> Option<&str> {
    let name = basename(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => Some(ext),
        _ => None,
    }
}

/// Join a folder path and a child name
pub fn join(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// Lowercase hex MD5 of a normalized path, the `path_hash` column
pub fn hash(path: &str) -> String {
    format!("{:x}", md5::compute(path.as_bytes()))
}

/// All folders containing `path` in absolute view form, root first.
///
/// `/a/b/c` yields `/`, `/a`, `/a/b`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    parts.pop();

    let mut result = Vec::with_capacity(parts.len() + 1);
    result.push("/".to_string());
    let mut current = String::new();
    for part in parts {
        current.push('/');
        current.push_str(part);
        result.push(current.clone());
    }
    result
}
