//! Per-project sync status.

use crate::models::{SyncState, SyncStatus};
use std::collections::HashMap;
use std::sync::RwLock;

/// Tracks the sync state of each project.
///
/// Instances are injected into the services that report progress, so tests
/// can observe an isolated tracker.
#[derive(Debug, Default)]
pub struct SyncStatusTracker {
    statuses: RwLock<HashMap<String, SyncStatus>>,
}

impl SyncStatusTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a project's status; unknown projects are idle.
    #[must_use]
    pub fn get(&self, project: &str) -> SyncStatus {
        self.statuses
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(project)
            .cloned()
            .unwrap_or_else(|| SyncStatus::idle(project))
    }

    /// Returns every tracked status, sorted by project.
    #[must_use]
    pub fn all(&self) -> Vec<SyncStatus> {
        let mut statuses: Vec<SyncStatus> = self
            .statuses
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        statuses.sort_by(|a, b| a.project.cmp(&b.project));
        statuses
    }

    fn update(&self, project: &str, f: impl FnOnce(&mut SyncStatus)) {
        let mut statuses = self
            .statuses
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let status = statuses
            .entry(project.to_string())
            .or_insert_with(|| SyncStatus::idle(project));
        f(status);
        status.updated_at = crate::now_millis();
    }

    /// Enters a state, clearing progress and message.
    pub fn set_state(&self, project: &str, state: SyncState) {
        self.update(project, |s| {
            s.state = state;
            s.message = None;
            if state.is_active() {
                s.files_done = 0;
                s.files_total = 0;
            }
        });
    }

    /// Records progress of the current pass.
    pub fn progress(&self, project: &str, files_done: usize, files_total: usize) {
        self.update(project, |s| {
            s.files_done = files_done;
            s.files_total = files_total;
        });
    }

    /// Marks the pass completed with a summary.
    pub fn complete(&self, project: &str, message: impl Into<String>) {
        let message = message.into();
        self.update(project, |s| {
            s.state = SyncState::Completed;
            s.files_done = s.files_total;
            s.message = Some(message);
        });
    }

    /// Marks the pass failed.
    pub fn fail(&self, project: &str, error: impl std::fmt::Display) {
        let message = error.to_string();
        self.update(project, |s| {
            s.state = SyncState::Failed;
            s.message = Some(message);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_project_is_idle() {
        let tracker = SyncStatusTracker::new();
        assert_eq!(tracker.get("notes").state, SyncState::Idle);
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_pass_lifecycle() {
        let tracker = SyncStatusTracker::new();
        tracker.set_state("notes", SyncState::Scanning);
        tracker.set_state("notes", SyncState::Syncing);
        tracker.progress("notes", 1, 4);
        let status = tracker.get("notes");
        assert!(status.state.is_active());
        assert_eq!((status.files_done, status.files_total), (1, 4));

        tracker.complete("notes", "4 changes");
        let status = tracker.get("notes");
        assert_eq!(status.state, SyncState::Completed);
        assert_eq!(status.files_done, 4);
        assert_eq!(status.message.as_deref(), Some("4 changes"));
    }

    #[test]
    fn test_failure_and_isolation() {
        let tracker = SyncStatusTracker::new();
        tracker.fail("a", "disk full");
        assert_eq!(tracker.get("a").state, SyncState::Failed);
        assert_eq!(tracker.get("b").state, SyncState::Idle);
        assert_eq!(tracker.all().len(), 1);
    }
}
