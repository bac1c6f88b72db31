//! # Notegraph
//!
//! A local-first knowledge graph over a directory of plain-text notes.
//!
//! Notegraph keeps a directory of markdown files synchronized with a
//! `SQLite` graph of entities, observations, and relations, and answers
//! graph-traversal queries over it.
//!
//! ## Features
//!
//! - Incremental, idempotent directory sync (scan, diff, apply, resolve, index)
//! - Move detection by checksum so renamed notes keep their identity
//! - Checksum-guarded atomic writes that never clobber external edits
//! - Forward references that resolve once their target note appears
//! - Bounded, timeframe-aware context traversal
//! - FTS5 full-text index kept in lockstep with the graph
//!
//! ## Example
//!
//! ```rust,ignore
//! use notegraph::{KnowledgeBase, NoteGraphConfig};
//!
//! let kb = KnowledgeBase::open(&NoteGraphConfig::default())?;
//! kb.ensure_project("notes", "/home/me/notes")?;
//! let report = kb.sync("notes").await?;
//! println!("{} changes", report.total());
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::NoteGraphConfig;
pub use models::{
    ChangeReport, ContextRequest, ContextSeed, Entity, EntityId, GraphContext, Observation,
    ParsedDocument, Relation,
};
pub use services::{KnowledgeBase, generate_permalink};
pub use storage::{GraphStore, SearchIndex};

/// Error type for notegraph operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty titles, paths outside the project, malformed seeds |
/// | `NotFound` | Unknown project, entity, or file |
/// | `OperationFailed` | I/O errors, `SQLite` failures, task join failures |
/// | `DirtyFile` | A write's expected checksum no longer matches the file on disk |
/// | `Migration` | A schema migration fails at startup |
/// | `PermalinkExhausted` | No free disambiguated permalink within the configured bound |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` statements fail
    /// - Filesystem reads, writes, or renames fail
    /// - A blocking task panics or is cancelled
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The file changed on disk since it was last read.
    ///
    /// The write did not happen. Callers may re-read the file and retry.
    #[error("file '{path}' was modified externally (expected checksum {expected}, found {actual})")]
    DirtyFile {
        /// Project-relative path of the file.
        path: String,
        /// Checksum the caller expected.
        expected: String,
        /// Checksum currently on disk.
        actual: String,
    },

    /// A schema migration failed.
    ///
    /// Fatal at startup: no sync pass may run against an unmigrated store.
    #[error("migration v{version} failed: {cause}")]
    Migration {
        /// The migration version that failed.
        version: i32,
        /// The underlying cause.
        cause: String,
    },

    /// Permalink disambiguation ran past its bound.
    #[error("no free permalink for '{permalink}' after {attempts} attempts")]
    PermalinkExhausted {
        /// The permalink that collided.
        permalink: String,
        /// Number of suffixes tried.
        attempts: u32,
    },
}

impl Error {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Only checksum conflicts are retryable: the caller re-reads the file
    /// and submits the write again with the fresh checksum.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DirtyFile { .. })
    }

    /// Builds an `OperationFailed` error from any displayable cause.
    pub fn operation(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for notegraph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current UTC time truncated to millisecond precision.
///
/// All stored timestamps use millisecond resolution, so values produced here
/// compare equal after a round-trip through the store.
#[must_use]
pub fn now_millis() -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    chrono::DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::NotFound("entity 'a'".to_string());
        assert_eq!(err.to_string(), "not found: entity 'a'");
    }

    #[test]
    fn test_dirty_file_is_distinct_and_retryable() {
        let dirty = Error::DirtyFile {
            path: "a.md".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(dirty.is_retryable());
        assert!(!Error::NotFound("a".to_string()).is_retryable());
        assert!(!Error::InvalidInput("a".to_string()).is_retryable());
        assert!(dirty.to_string().contains("modified externally"));
    }

    #[test]
    fn test_now_millis_has_no_sub_millisecond_part() {
        let now = now_millis();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
