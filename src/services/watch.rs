//! File watch adapter.
//!
//! Filesystem notifications are turned into [`FileChange`] events on a
//! channel. The consumer coalesces bursts: after the first event it keeps
//! collecting until the channel has been quiet for the debounce window, or
//! until the batch window since the first event runs out, then runs one
//! incremental pass over the distinct paths. Editor save sequences (temp
//! file, rename) therefore reach the sync engine as one batch, and the temp
//! file itself is dropped by the ignore rules. A steady stream of events
//! still flushes once per batch window.

use crate::models::{ChangeKind, FileChange, Project, SyncState};
use crate::services::sync::SyncService;
use crate::{Error, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default quiet period before a batch is synced.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Default bound on how long a batch keeps collecting.
pub const DEFAULT_MAX_BATCH_WINDOW: Duration = Duration::from_secs(10);

/// When a batch of watched changes is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    /// Quiet period that ends a batch.
    pub quiet: Duration,
    /// Longest a batch collects after its first event.
    pub max: Duration,
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self {
            quiet: DEFAULT_DEBOUNCE,
            max: DEFAULT_MAX_BATCH_WINDOW,
        }
    }
}

/// Maps a notify event to change events. Access events are dropped.
#[must_use]
pub fn changes_from_event(event: &Event) -> Vec<FileChange> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => return Vec::new(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modified,
    };
    event
        .paths
        .iter()
        .map(|path| FileChange::new(kind, path.clone()))
        .collect()
}

/// A running watcher. Dropping the handle also stops it, without waiting.
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl WatchHandle {
    /// Stops the watcher, flushing any pending batch first.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::operation("join_watcher", e))?
    }

    /// Returns true once the watch task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Watches project directories and feeds the sync engine.
pub struct WatchService {
    sync: Arc<SyncService>,
    window: BatchWindow,
    poll_interval: Duration,
}

impl WatchService {
    /// Creates a watch service.
    pub const fn new(sync: Arc<SyncService>) -> Self {
        Self {
            sync,
            window: BatchWindow {
                quiet: DEFAULT_DEBOUNCE,
                max: DEFAULT_MAX_BATCH_WINDOW,
            },
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Sets the debounce window.
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.window.quiet = debounce;
        self
    }

    /// Sets how long a batch may keep collecting under a steady stream.
    #[must_use]
    pub const fn with_max_batch_window(mut self, max: Duration) -> Self {
        self.window.max = max;
        self
    }

    /// Sets the poll interval used by polling backends.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Starts watching a project directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the OS watcher cannot be created
    /// or attached to the directory.
    pub fn start(&self, project: Project) -> Result<WatchHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<FileChange>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in changes_from_event(&event) {
                        let _ = event_tx.send(change);
                    }
                },
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            Config::default().with_poll_interval(self.poll_interval),
        )
        .map_err(|e| Error::operation("create_watcher", e))?;
        watcher
            .watch(Path::new(&project.path), RecursiveMode::Recursive)
            .map_err(|e| Error::operation("watch_directory", format!("{}: {e}", project.path)))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let sync = Arc::clone(&self.sync);
        let window = self.window;
        sync.status().set_state(&project.name, SyncState::Watching);
        tracing::info!(project = %project.name, path = %project.path, "watching project");

        let task = tokio::spawn(async move {
            // The OS watcher lives as long as the task.
            let _watcher = watcher;
            let result = run_events(&sync, &project, event_rx, stop_rx, window).await;
            sync.status().set_state(&project.name, SyncState::Idle);
            tracing::info!(project = %project.name, "watcher stopped");
            result
        });

        Ok(WatchHandle { stop_tx, task })
    }
}

/// Consumes change events until stopped or the channel closes.
///
/// Each batch is synced with [`SyncService::sync_paths`]; a failed batch is
/// logged and the loop continues.
pub async fn run_events(
    sync: &SyncService,
    project: &Project,
    mut events: mpsc::UnboundedReceiver<FileChange>,
    mut stop: mpsc::Receiver<()>,
    window: BatchWindow,
) -> Result<()> {
    loop {
        let first = tokio::select! {
            _ = stop.recv() => return Ok(()),
            event = events.recv() => event,
        };
        let Some(first) = first else {
            return Ok(());
        };
        record_event(&first);

        let deadline = tokio::time::sleep_until(tokio::time::Instant::now() + window.max);
        tokio::pin!(deadline);
        let mut batch: BTreeSet<PathBuf> = BTreeSet::from([first.path]);
        let mut closed = false;
        let mut stopping = false;
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    stopping = true;
                    break;
                }
                () = &mut deadline => {
                    tracing::debug!(project = %project.name, paths = batch.len(), "batch window elapsed");
                    break;
                }
                next = tokio::time::timeout(window.quiet, events.recv()) => match next {
                    Ok(Some(change)) => {
                        record_event(&change);
                        batch.insert(change.path);
                    },
                    Ok(None) => {
                        closed = true;
                        break;
                    },
                    Err(_) => break,
                },
            }
        }

        flush(sync, project, batch).await;
        if closed || stopping {
            return Ok(());
        }
    }
}

fn record_event(change: &FileChange) {
    metrics::counter!("notegraph_watch_events_total", "kind" => change.kind.as_str()).increment(1);
}

async fn flush(sync: &SyncService, project: &Project, batch: BTreeSet<PathBuf>) {
    let paths: Vec<PathBuf> = batch.into_iter().collect();
    tracing::debug!(project = %project.name, paths = paths.len(), "syncing changed paths");
    match sync.sync_paths(project, &paths).await {
        Ok(report) if !report.is_empty() || !report.errors.is_empty() => {
            tracing::info!(
                project = %project.name,
                changes = report.total(),
                errors = report.errors.len(),
                "applied watched changes"
            );
        },
        Ok(_) => {},
        Err(e) => {
            tracing::warn!(project = %project.name, error = %e, "incremental sync failed");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ignore::IgnoreRules;
    use crate::services::indexer::Indexer;
    use crate::services::sync_status::SyncStatusTracker;
    use crate::storage::{GraphStore, SqliteGraphStore, SqliteSearchIndex};
    use notify::event::{CreateKind, MetadataKind, RemoveKind};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        store: Arc<dyn GraphStore>,
        sync: Arc<SyncService>,
        project: Project,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::in_memory().unwrap());
        let index = Arc::new(SqliteSearchIndex::in_memory().unwrap());
        let project = store
            .ensure_project("watched", &dir.path().to_string_lossy())
            .unwrap();
        let sync = Arc::new(SyncService::new(
            Arc::clone(&store),
            Indexer::new(Arc::clone(&store), index),
            Arc::new(SyncStatusTracker::new()),
            IgnoreRules::default(),
        ));
        Harness {
            dir,
            store,
            sync,
            project,
        }
    }

    fn spawn_events(
        h: &Harness,
        window: BatchWindow,
    ) -> (
        mpsc::UnboundedSender<FileChange>,
        mpsc::Sender<()>,
        JoinHandle<Result<()>>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let sync = Arc::clone(&h.sync);
        let project = h.project.clone();
        let task = tokio::spawn(async move {
            run_events(&sync, &project, event_rx, stop_rx, window).await
        });
        (event_tx, stop_tx, task)
    }

    #[tokio::test]
    async fn test_quiet_period_flushes_batch() {
        let h = harness();
        std::fs::write(h.dir.path().join("a.md"), "# A\n").unwrap();
        let window = BatchWindow {
            quiet: Duration::from_millis(100),
            max: Duration::from_secs(30),
        };
        let (events, stop, task) = spawn_events(&h, window);

        events
            .send(FileChange::new(ChangeKind::Added, h.dir.path().join("a.md")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(h.store.find_by_file_path(h.project.id, "a.md").unwrap().is_some());

        stop.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_steady_stream_flushes_at_batch_window() {
        let h = harness();
        std::fs::write(h.dir.path().join("a.md"), "# A\n").unwrap();
        let window = BatchWindow {
            quiet: Duration::from_millis(200),
            max: Duration::from_millis(300),
        };
        let (events, stop, task) = spawn_events(&h, window);

        events
            .send(FileChange::new(ChangeKind::Added, h.dir.path().join("a.md")))
            .unwrap();
        // Events arrive faster than the quiet period for well past the window.
        let noise = h.dir.path().join("ghost.md");
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            events
                .send(FileChange::new(ChangeKind::Modified, noise.clone()))
                .unwrap();
        }
        assert!(h.store.find_by_file_path(h.project.id, "a.md").unwrap().is_some());

        stop.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_flushes_and_exits() {
        let h = harness();
        std::fs::write(h.dir.path().join("b.md"), "# B\n").unwrap();
        let (events, _stop, task) = spawn_events(&h, BatchWindow::default());

        events
            .send(FileChange::new(ChangeKind::Added, h.dir.path().join("b.md")))
            .unwrap();
        drop(events);
        task.await.unwrap().unwrap();
        assert!(h.store.find_by_file_path(h.project.id, "b.md").unwrap().is_some());
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_changes_from_event() {
        let created = changes_from_event(&event(EventKind::Create(CreateKind::File), "/p/a.md"));
        assert_eq!(created, vec![FileChange::new(ChangeKind::Added, "/p/a.md")]);

        let removed = changes_from_event(&event(EventKind::Remove(RemoveKind::File), "/p/a.md"));
        assert_eq!(removed[0].kind, ChangeKind::Deleted);

        let touched = changes_from_event(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)),
            "/p/a.md",
        ));
        assert!(touched.is_empty());
    }
}
