//! SQL helper functions for `SQLite` backends.

use chrono::{DateTime, Utc};

/// Escapes SQL LIKE wildcards so they match literally.
///
/// Use with `LIKE ? ESCAPE '\'`.
///
/// # Examples
///
/// ```
/// use notegraph::storage::sqlite::escape_like_wildcards;
///
/// assert_eq!(escape_like_wildcards("100%"), "100\\%");
/// assert_eq!(escape_like_wildcards("user_name"), "user\\_name");
/// ```
#[must_use]
pub fn escape_like_wildcards(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

/// Converts a glob pattern (`*`, `?`) to a LIKE pattern, escaping literal
/// LIKE wildcards first.
///
/// # Examples
///
/// ```
/// use notegraph::storage::sqlite::glob_to_like_pattern;
///
/// assert_eq!(glob_to_like_pattern("specs/*"), "specs/%");
/// assert_eq!(glob_to_like_pattern("draft_?"), "draft\\__");
/// ```
#[must_use]
pub fn glob_to_like_pattern(pattern: &str) -> String {
    let mut result = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            '*' => result.push('%'),
            '?' => result.push('_'),
            _ => result.push(c),
        }
    }
    result
}

/// Encodes ids as a JSON array for `IN (SELECT value FROM json_each(?))`.
///
/// One bound parameter regardless of list length, so large id sets never
/// hit the host parameter limit.
#[must_use]
pub fn id_list_json(ids: &[i64]) -> String {
    let mut out = String::with_capacity(ids.len() * 4 + 2);
    out.push('[');
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&id.to_string());
    }
    out.push(']');
    out
}

/// Converts a timestamp to stored milliseconds.
#[must_use]
pub const fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts stored milliseconds to a timestamp.
#[must_use]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like_wildcards() {
        assert_eq!(escape_like_wildcards("normal"), "normal");
        assert_eq!(escape_like_wildcards("100%"), "100\\%");
        assert_eq!(escape_like_wildcards("user_name"), "user\\_name");
        assert_eq!(escape_like_wildcards("path\\file"), "path\\\\file");
        assert_eq!(escape_like_wildcards(""), "");
    }

    #[test]
    fn test_glob_to_like_pattern() {
        assert_eq!(glob_to_like_pattern("*"), "%");
        assert_eq!(glob_to_like_pattern("?"), "_");
        assert_eq!(glob_to_like_pattern("specs/*"), "specs/%");
        assert_eq!(glob_to_like_pattern("100%*"), "100\\%%");
        assert_eq!(glob_to_like_pattern("notes/**/a_*"), "notes/%%/a\\_%");
        assert_eq!(glob_to_like_pattern("normal"), "normal");
    }

    #[test]
    fn test_id_list_json() {
        assert_eq!(id_list_json(&[3, 1, 2]), "[3,1,2]");
        assert_eq!(id_list_json(&[]), "[]");
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = crate::now_millis();
        assert_eq!(from_millis(to_millis(now)), now);
    }
}
