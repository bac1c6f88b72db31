//! Path filtering for scans and watch events.
//!
//! A path is ignored when any component is hidden, when its file name looks
//! like a transient editor or download artifact, or when it matches a user
//! pattern. Ignored paths never reach the diff.

use crate::{Error, Result};
use glob::Pattern;
use std::path::Path;

/// File-name suffixes of transient files.
const TRANSIENT_SUFFIXES: &[&str] = &[".tmp", "~", ".swp", ".swx", ".part", ".crdownload"];

/// File-name prefixes of transient files.
const TRANSIENT_PREFIXES: &[&str] = &[".#", "~$"];

/// Exact file names of transient or system files.
const TRANSIENT_NAMES: &[&str] = &["4913", ".DS_Store", "Thumbs.db"];

/// Returns true if `name` is a transient file name.
///
/// ```
/// use notegraph::services::is_transient_file_name;
///
/// assert!(is_transient_file_name("note.md.tmp"));
/// assert!(is_transient_file_name(".#note.md"));
/// assert!(!is_transient_file_name("note.md"));
/// ```
#[must_use]
pub fn is_transient_file_name(name: &str) -> bool {
    TRANSIENT_NAMES.contains(&name)
        || TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s))
        || TRANSIENT_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Compiled ignore rules for one project.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Compiles user glob patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed pattern.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    Error::InvalidInput(format!("bad ignore pattern '{}': {e}", p.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if a project-relative, `/`-separated path is ignored.
    #[must_use]
    pub fn is_ignored(&self, relative: &str) -> bool {
        let components: Vec<&str> = relative.split('/').filter(|c| !c.is_empty()).collect();
        let Some(name) = components.last() else {
            return true;
        };
        if components.iter().any(|c| c.starts_with('.')) || is_transient_file_name(name) {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.matches(relative) || components.iter().any(|c| p.matches(c)))
    }

    /// Returns true if a directory (project-relative) should not be entered.
    #[must_use]
    pub fn is_ignored_dir(&self, relative: &str) -> bool {
        !relative.is_empty() && self.is_ignored(relative)
    }
}

/// Converts a path under `root` to a project-relative `/`-separated string.
///
/// Returns `None` for paths outside the root or not valid UTF-8.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect();
    let joined = parts?.join("/");
    if joined.is_empty() { None } else { Some(joined) }
}
