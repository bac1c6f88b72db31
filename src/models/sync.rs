//! Sync pass results and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Differences between a project directory and the graph store.
///
/// Paths are project-relative and `/`-separated. A moved file appears only
/// in `moves`, never as a delete and create pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    /// Files with no entity.
    pub new: BTreeSet<String>,
    /// Files whose checksum differs from the stored one.
    pub modified: BTreeSet<String>,
    /// Entities whose file is gone.
    pub deleted: BTreeSet<String>,
    /// Old path to new path for files moved with unchanged content.
    pub moves: BTreeMap<String, String>,
    /// Checksums of every scanned file.
    pub checksums: BTreeMap<String, String>,
    /// Per-file failures; never abort the pass.
    pub errors: BTreeMap<String, String>,
}

impl ChangeReport {
    /// Number of changes of any kind.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted.len() + self.moves.len()
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Records a per-file failure.
    pub fn record_error(&mut self, path: impl Into<String>, error: impl std::fmt::Display) {
        self.errors.insert(path.into(), error.to_string());
    }
}

/// Lifecycle state of a project's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Nothing running.
    #[default]
    Idle,
    /// Enumerating files and diffing.
    Scanning,
    /// Applying changes.
    Syncing,
    /// Last pass finished.
    Completed,
    /// Last pass failed.
    Failed,
    /// A watcher is attached.
    Watching,
}

impl SyncState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Watching => "watching",
        }
    }

    /// Returns true while a pass is in progress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Scanning | Self::Syncing)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Project name.
    pub project: String,
    /// Current state.
    pub state: SyncState,
    /// Optional detail (error text on failure).
    pub message: Option<String>,
    /// Files to process in the current pass.
    pub files_total: usize,
    /// Files processed so far.
    pub files_done: usize,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl SyncStatus {
    /// Creates an idle status.
    #[must_use]
    pub fn idle(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: SyncState::Idle,
            message: None,
            files_total: 0,
            files_done: 0,
            updated_at: crate::now_millis(),
        }
    }
}

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A file appeared.
    Added,
    /// A file's content changed.
    Modified,
    /// A file disappeared.
    Deleted,
}

impl ChangeKind {
    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

/// One inbound change event with an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileChange {
    /// What happened.
    pub kind: ChangeKind,
    /// Absolute path of the file.
    pub path: PathBuf,
}

impl FileChange {
    /// Creates an event.
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_report_total_excludes_errors() {
        let mut report = ChangeReport::default();
        assert!(report.is_empty());
        report.record_error("bad.md", "permission denied");
        assert!(report.is_empty());
        report.new.insert("a.md".to_string());
        report
            .moves
            .insert("old.md".to_string(), "new.md".to_string());
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn test_change_kind_names() {
        assert_eq!(ChangeKind::Added.as_str(), "added");
        assert_eq!(ChangeKind::Deleted.as_str(), "deleted");
    }

    #[test]
    fn test_sync_state_names() {
        assert_eq!(SyncState::Watching.to_string(), "watching");
        assert!(SyncState::Syncing.is_active());
        assert!(!SyncState::Completed.is_active());
    }
}
