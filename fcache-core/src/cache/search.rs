use rusqlite::types::Value;

use super::{Cache, CacheEntry, SELECT_COLUMNS};
use crate::Result;

/// Translate a name pattern into a `LIKE` pattern.
///
/// `*` and `?` are wildcards; a pattern without either matches anywhere in
/// the name. `%`, `_` and `\` match literally.
fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    let mut wildcard = false;
    for c in pattern.chars() {
        match c {
            '*' => {
                out.push('%');
                wildcard = true;
            }
            '?' => {
                out.push('_');
                wildcard = true;
            }
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    if wildcard {
        out
    } else {
        format!("%{out}%")
    }
}

fn prefixed_columns(alias: &str) -> String {
    SELECT_COLUMNS
        .split(',')
        .map(|col| format!("{alias}.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Cache {
    /// Entries whose name matches `pattern`, ignoring case
    pub fn search(&self, pattern: &str) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM filecache
             WHERE storage = ?1 AND unicode_lower(name) LIKE ?2 ESCAPE '\\' ORDER BY name ASC"
        );
        let pattern = like_pattern(&pattern.to_lowercase());
        self.query_entries(&sql, vec![Value::Integer(self.numeric_id()), Value::Text(pattern)])
    }

    /// Entries of a full mimetype (`image/png`) or of a mimepart (`image`)
    pub fn search_by_mime(&self, mimetype: &str) -> Result<Vec<CacheEntry>> {
        let column = if mimetype.contains('/') {
            "mimetype"
        } else {
            "mimepart"
        };
        let Some(id) = self.mimetypes.id_of(mimetype)? else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM filecache WHERE storage = ?1 AND {column} = ?2 ORDER BY name ASC"
        );
        self.query_entries(&sql, vec![Value::Integer(self.numeric_id()), Value::Integer(id)])
    }

    /// Entries `user` tagged with `tag`
    pub fn search_by_tag(&self, tag: &str, user: &str) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT {} FROM filecache f
             INNER JOIN vcategory_to_object o ON o.objid = f.fileid AND o.type = 'files'
             INNER JOIN vcategory c ON c.id = o.categoryid
             WHERE f.storage = ?1 AND c.type = 'files' AND c.uid = ?2 AND c.category = ?3
             ORDER BY f.name ASC",
            prefixed_columns("f")
        );
        self.query_entries(
            &sql,
            vec![
                Value::Integer(self.numeric_id()),
                Value::Text(user.to_string()),
                Value::Text(tag.to_string()),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheContext, EntryData, FileId};
    use rusqlite::params;

    fn cache() -> Cache {
        let ctx = CacheContext::in_memory().unwrap();
        let cache = Cache::new(&ctx, "local::search").unwrap();
        cache.put("", EntryData::folder().mtime(1)).unwrap();
        cache.put("photos", EntryData::folder().mtime(1)).unwrap();
        for (name, mime) in [
            ("photos/Beach.PNG", "image/png"),
            ("photos/city.jpg", "image/jpeg"),
            ("notes.txt", "text/plain"),
            ("100%_done.txt", "text/plain"),
            ("Été.txt", "text/plain"),
        ] {
            cache
                .put(name, EntryData::new().size(1).mtime(1).mimetype(mime))
                .unwrap();
        }
        cache
    }

    fn names(entries: Vec<CacheEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn test_like_pattern() {
        assert_eq!(like_pattern("foo"), "%foo%");
        assert_eq!(like_pattern("*.txt"), "%.txt");
        assert_eq!(like_pattern("a?c"), "a_c");
        assert_eq!(like_pattern("100%"), "%100\\%%");
    }

    #[test]
    fn test_search_by_name() {
        let cache = cache();
        assert_eq!(names(cache.search("beach").unwrap()), vec!["Beach.PNG"]);
        assert_eq!(
            names(cache.search("*.txt").unwrap()),
            vec!["100%_done.txt", "notes.txt", "Été.txt"]
        );
        assert_eq!(names(cache.search("100%").unwrap()), vec!["100%_done.txt"]);
        assert!(cache.search("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_search_folds_non_ascii_case() {
        let cache = cache();
        assert_eq!(names(cache.search("été").unwrap()), vec!["Été.txt"]);
        assert_eq!(names(cache.search("ÉTÉ*").unwrap()), vec!["Été.txt"]);
    }

    #[test]
    fn test_search_by_mime() {
        let cache = cache();
        assert_eq!(
            names(cache.search_by_mime("image").unwrap()),
            vec!["Beach.PNG", "city.jpg"]
        );
        assert_eq!(names(cache.search_by_mime("image/jpeg").unwrap()), vec!["city.jpg"]);
        assert!(cache.search_by_mime("video/mp4").unwrap().is_empty());
    }

    #[test]
    fn test_search_by_tag() {
        let cache = cache();
        let city: FileId = cache.id("photos/city.jpg").unwrap().unwrap();
        let notes: FileId = cache.id("notes.txt").unwrap().unwrap();

        cache
            .db()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO vcategory (id, uid, type, category) VALUES
                        (1, 'alice', 'files', 'travel'), (2, 'bob', 'files', 'travel')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO vcategory_to_object (objid, categoryid, type) VALUES
                        (?1, 1, 'files'), (?2, 2, 'files')",
                    params![city.0, notes.0],
                )
            })
            .unwrap();

        assert_eq!(names(cache.search_by_tag("travel", "alice").unwrap()), vec!["city.jpg"]);
        assert_eq!(names(cache.search_by_tag("travel", "bob").unwrap()), vec!["notes.txt"]);
        assert!(cache.search_by_tag("work", "alice").unwrap().is_empty());
    }
}
