//! Directory synchronization.
//!
//! A pass runs as a sequence of phases, each on the blocking pool:
//!
//! | Phase | Work | Mutates |
//! |-------|------|---------|
//! | Scan | walk the project, checksum files | nothing |
//! | Diff | classify new, modified, deleted, moved | nothing |
//! | Apply | move, delete, then parse and upsert | graph |
//! | Resolve | bind unresolved relations by name | graph |
//! | Index | rewrite index rows of touched entities | index |
//!
//! Passes over one project are serialized by a per-project lock. Running a
//! pass twice with no filesystem change leaves the second report empty.

use crate::models::{
    ChangeReport, EntityId, NewEntity, NewRelation, Project, SyncState, UpsertOutcome,
};
use crate::services::ignore::{IgnoreRules, relative_path};
use crate::services::indexer::Indexer;
use crate::services::link_resolver::LinkResolver;
use crate::services::parser::{
    entity_for_binary, entity_from_document, is_markdown_path, parse_document,
};
use crate::services::run_blocking;
use crate::services::sync_status::SyncStatusTracker;
use crate::services::writer::compute_checksum;
use crate::storage::GraphStore;
use crate::storage::traits::graph::FileState;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::instrument;
use walkdir::WalkDir;

/// Classifies scanned files against stored file states.
///
/// A deleted path and a new path with the same checksum form a move. When
/// several paths share a checksum they are paired in sorted order; unrelated
/// files with identical content can therefore be reported as a move.
#[must_use]
pub fn diff_states(
    files: BTreeMap<String, String>,
    states: &BTreeMap<String, FileState>,
) -> ChangeReport {
    let mut report = ChangeReport::default();
    for (path, checksum) in &files {
        match states.get(path) {
            None => {
                report.new.insert(path.clone());
            },
            Some(state) if state.checksum.as_deref() != Some(checksum.as_str()) => {
                report.modified.insert(path.clone());
            },
            Some(_) => {},
        }
    }
    for path in states.keys() {
        if !files.contains_key(path) {
            report.deleted.insert(path.clone());
        }
    }

    let mut deleted_by_checksum: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for path in &report.deleted {
        if let Some(checksum) = states.get(path).and_then(|s| s.checksum.as_deref()) {
            deleted_by_checksum.entry(checksum).or_default().push(path);
        }
    }
    let mut new_by_checksum: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for path in &report.new {
        if let Some(checksum) = files.get(path) {
            new_by_checksum.entry(checksum).or_default().push(path);
        }
    }

    let mut moves = BTreeMap::new();
    for (checksum, old_paths) in &deleted_by_checksum {
        if let Some(new_paths) = new_by_checksum.get(checksum) {
            for (old, new) in old_paths.iter().zip(new_paths.iter()) {
                moves.insert((*old).clone(), (*new).clone());
            }
        }
    }
    for (old, new) in &moves {
        report.deleted.remove(old);
        report.new.remove(new);
    }
    report.moves = moves;
    report.checksums = files;
    report
}

/// The synchronous phases of a pass.
#[derive(Clone)]
pub(crate) struct Pipeline {
    store: Arc<dyn GraphStore>,
    indexer: Indexer,
    resolver: LinkResolver,
    status: Arc<SyncStatusTracker>,
    ignore: IgnoreRules,
    excluded_dirs: Vec<PathBuf>,
}

impl Pipeline {
    fn root(project: &Project) -> &Path {
        Path::new(&project.path)
    }

    fn ensure_root(project: &Project) -> Result<&Path> {
        let root = Self::root(project);
        if root.is_dir() {
            Ok(root)
        } else {
            Err(Error::NotFound(format!(
                "project directory '{}'",
                root.display()
            )))
        }
    }

    /// Lists the non-ignored files of a project with their checksums.
    fn scan_files(&self, project: &Project) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
        let root = Self::ensure_root(project)?;
        let mut files = BTreeMap::new();
        let mut errors = BTreeMap::new();
        self.walk_files(root, root, &mut files, &mut errors);
        Ok((files, errors))
    }

    /// Walks `start` (the root or a directory under it), adding every
    /// non-ignored file with its checksum.
    fn walk_files(
        &self,
        root: &Path,
        start: &Path,
        files: &mut BTreeMap<String, String>,
        errors: &mut BTreeMap<String, String>,
    ) {
        let walker = WalkDir::new(start).follow_links(false).into_iter().filter_entry(|e| {
            if self.excluded_dirs.iter().any(|d| e.path().starts_with(d)) {
                return false;
            }
            relative_path(root, e.path()).is_none_or(|rel| {
                if e.file_type().is_dir() {
                    !self.ignore.is_ignored_dir(&rel)
                } else {
                    !self.ignore.is_ignored(&rel)
                }
            })
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| relative_path(root, p))
                        .unwrap_or_else(|| start.display().to_string());
                    tracing::warn!(path = %path, error = %e, "skipping unreadable entry");
                    errors.insert(path, e.to_string());
                    continue;
                },
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };
            match std::fs::read(entry.path()) {
                Ok(bytes) => {
                    files.insert(rel, compute_checksum(&bytes));
                },
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "failed to read file");
                    errors.insert(rel, e.to_string());
                },
            }
        }
    }

    /// Scan and Diff over the whole project.
    pub(crate) fn scan(&self, project: &Project) -> Result<ChangeReport> {
        let (files, errors) = self.scan_files(project)?;
        let mut states = self.store.file_states(project.id)?;
        // An unreadable file is not a deletion.
        states.retain(|path, _| !errors.contains_key(path));
        let mut report = diff_states(files, &states);
        report.errors = errors;
        Ok(report)
    }

    /// Scan and Diff restricted to a batch of project-relative paths.
    ///
    /// A directory in the batch is walked like a full scan. Entities stored
    /// under a batch path whose files are gone are deleted, so a renamed
    /// directory pairs up as moves by checksum.
    pub(crate) fn scan_paths(&self, project: &Project, paths: &BTreeSet<String>) -> Result<ChangeReport> {
        let root = Self::ensure_root(project)?;
        let mut files = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for rel in paths {
            if self.ignore.is_ignored(rel) {
                continue;
            }
            let abs = root.join(rel);
            if abs.is_dir() {
                self.walk_files(root, &abs, &mut files, &mut errors);
                continue;
            }
            match std::fs::read(&abs) {
                Ok(bytes) => {
                    files.insert(rel.clone(), compute_checksum(&bytes));
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    errors.insert(rel.clone(), e.to_string());
                },
            }
        }

        let new_checksums: HashSet<&String> = files.values().collect();
        let all_states = self.store.file_states(project.id)?;
        let states: BTreeMap<String, FileState> = all_states
            .into_iter()
            .filter(|(path, state)| {
                if errors.contains_key(path) || self.ignore.is_ignored(path) {
                    return false;
                }
                let in_batch = paths.contains(path) || files.contains_key(path);
                let gone = !root.join(path).exists();
                let under_batch_dir = gone
                    && paths.iter().any(|p| {
                        path.starts_with(p.as_str()) && path[p.len()..].starts_with('/')
                    });
                let moved_away = gone
                    && state.checksum.as_ref().is_some_and(|c| new_checksums.contains(c));
                in_batch || under_batch_dir || moved_away
            })
            .collect();

        let mut report = diff_states(files, &states);
        report.errors = errors;
        Ok(report)
    }

    /// Apply: moves, then deletions, then new and modified files.
    ///
    /// Per-file failures are recorded in the report. Returns the ids of
    /// entities whose index rows must be rewritten.
    pub(crate) fn apply(&self, project: &Project, report: &mut ChangeReport) -> Result<BTreeSet<EntityId>> {
        let mut touched = BTreeSet::new();
        let total = report.total();
        let mut done = 0;

        for (old, new) in report.moves.clone() {
            match self.apply_move(project, &old, &new) {
                Ok(id) => {
                    touched.insert(id);
                    metrics::counter!("notegraph_sync_files_total", "kind" => "moved").increment(1);
                },
                Err(e) => {
                    tracing::warn!(from = %old, to = %new, error = %e, "failed to apply move");
                    report.record_error(new, e);
                },
            }
            done += 1;
            self.status.progress(&project.name, done, total);
        }

        for path in report.deleted.clone() {
            match self.apply_delete(project, &path) {
                Ok(Some((id, demoted_sources))) => {
                    touched.remove(&id);
                    touched.extend(demoted_sources);
                    metrics::counter!("notegraph_sync_files_total", "kind" => "deleted").increment(1);
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to delete entity");
                    report.record_error(path, e);
                },
            }
            done += 1;
            self.status.progress(&project.name, done, total);
        }

        let changed: Vec<(String, &'static str)> = report
            .new
            .iter()
            .map(|p| (p.clone(), "new"))
            .chain(report.modified.iter().map(|p| (p.clone(), "modified")))
            .collect();
        for (path, kind) in changed {
            match self.apply_file(project, &path) {
                Ok(outcome) => {
                    touched.insert(outcome.entity.id);
                    metrics::counter!("notegraph_sync_files_total", "kind" => kind).increment(1);
                },
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to sync file");
                    report.record_error(path, e);
                },
            }
            done += 1;
            self.status.progress(&project.name, done, total);
        }
        Ok(touched)
    }

    /// Parses one file from disk and upserts its entity.
    pub(crate) fn apply_file(&self, project: &Project, path: &str) -> Result<UpsertOutcome> {
        let bytes = std::fs::read(Self::root(project).join(path))
            .map_err(|e| Error::operation("read_file", format!("{path}: {e}")))?;
        let checksum = compute_checksum(&bytes);

        if !is_markdown_path(path) {
            let entity = entity_for_binary(path, Some(checksum));
            return self.store.upsert_entity(project.id, &entity, &[], &[]);
        }

        let text = String::from_utf8_lossy(&bytes);
        let document = parse_document(&text);
        if document.has_warnings() {
            tracing::warn!(path, warnings = ?document.warnings, "parsed with warnings");
        }
        let entity = entity_from_document(&document, path, Some(checksum));
        let relations = document
            .relations
            .iter()
            .map(|spec| {
                let mut relation = NewRelation::unresolved(spec);
                relation.to_id = self.resolver.resolve(project.id, &spec.target)?.map(|e| e.id);
                Ok(relation)
            })
            .collect::<Result<Vec<_>>>()?;

        let outcome =
            self.store
                .upsert_entity(project.id, &entity, &document.observations, &relations)?;
        if outcome.permalink_disambiguated {
            tracing::info!(
                path,
                permalink = outcome.entity.permalink.as_deref().unwrap_or_default(),
                "permalink was taken; stored a disambiguated one"
            );
        }
        Ok(outcome)
    }

    fn apply_move(&self, project: &Project, old: &str, new: &str) -> Result<EntityId> {
        let existing = self
            .store
            .find_by_file_path(project.id, old)?
            .ok_or_else(|| Error::NotFound(format!("entity for '{old}'")))?;

        let target: NewEntity = if is_markdown_path(new) {
            let text = std::fs::read_to_string(Self::root(project).join(new))
                .map_err(|e| Error::operation("read_file", format!("{new}: {e}")))?;
            entity_from_document(&parse_document(&text), new, existing.checksum.clone())
        } else {
            entity_for_binary(new, existing.checksum.clone())
        };
        let moved = self.store.move_entity(
            existing.id,
            new,
            &target.title,
            target.permalink.as_deref(),
        )?;
        tracing::debug!(from = old, to = new, entity = %moved.id, "moved entity");
        Ok(moved.id)
    }

    /// Deletes the entity of a removed file. Returns its id and the sources
    /// of relations demoted by the deletion.
    fn apply_delete(
        &self,
        project: &Project,
        path: &str,
    ) -> Result<Option<(EntityId, BTreeSet<EntityId>)>> {
        let Some(entity) = self.store.find_by_file_path(project.id, path)? else {
            return Ok(None);
        };
        let outcome = self.store.delete_entity(entity.id)?;
        self.indexer.remove(entity.id)?;
        Ok(Some((entity.id, outcome.demoted_sources)))
    }

    /// Resolve: binds every unresolved relation whose target now exists.
    ///
    /// Returns the source entities of resolved relations.
    pub(crate) fn resolve(&self, project: &Project) -> Result<BTreeSet<EntityId>> {
        let pending = self.store.unresolved_relations(project.id)?;
        let mut targets: HashMap<String, Option<EntityId>> = HashMap::new();
        let mut sources = BTreeSet::new();
        let mut resolved = 0usize;

        for relation in &pending {
            let target = if let Some(target) = targets.get(&relation.to_name) {
                *target
            } else {
                let target = self
                    .resolver
                    .resolve(project.id, &relation.to_name)?
                    .map(|e| e.id);
                targets.insert(relation.to_name.clone(), target);
                target
            };
            let Some(to_id) = target else {
                continue;
            };
            if self.store.resolve_relation(relation.id, to_id)? {
                resolved += 1;
            }
            sources.insert(relation.from_id);
        }

        if !pending.is_empty() {
            tracing::debug!(
                project = %project.name,
                pending = pending.len(),
                resolved,
                "resolved forward references"
            );
        }
        Ok(sources)
    }

    /// Index: rewrites the index rows of touched entities.
    pub(crate) fn index(&self, project: &Project, touched: &BTreeSet<EntityId>) -> Result<usize> {
        self.indexer.index_entities(project, touched)
    }

    /// Parses every markdown file without writing.
    fn validate(&self, project: &Project) -> Result<BTreeMap<String, String>> {
        let (files, mut problems) = self.scan_files(project)?;
        let root = Self::root(project);
        for path in files.keys().filter(|p| is_markdown_path(p)) {
            match std::fs::read(root.join(path)) {
                Ok(bytes) => {
                    let Ok(text) = String::from_utf8(bytes) else {
                        problems.insert(path.clone(), "file is not valid UTF-8".to_string());
                        continue;
                    };
                    let document = parse_document(&text);
                    if document.has_warnings() {
                        problems.insert(path.clone(), document.warnings.join("; "));
                    }
                },
                Err(e) => {
                    problems.insert(path.clone(), e.to_string());
                },
            }
        }
        Ok(problems)
    }
}

/// Lazily created per-project async locks.
#[derive(Debug, Default)]
struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    fn lock_for(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(project.to_string()).or_default())
    }
}

/// Service for synchronizing project directories with the graph.
pub struct SyncService {
    pipeline: Pipeline,
    status: Arc<SyncStatusTracker>,
    locks: ProjectLocks,
}

impl SyncService {
    /// Creates a sync service.
    pub fn new(
        store: Arc<dyn GraphStore>,
        indexer: Indexer,
        status: Arc<SyncStatusTracker>,
        ignore: IgnoreRules,
    ) -> Self {
        let resolver = LinkResolver::new(Arc::clone(&store));
        Self {
            pipeline: Pipeline {
                store,
                indexer,
                resolver,
                status: Arc::clone(&status),
                ignore,
                excluded_dirs: Vec::new(),
            },
            status,
            locks: ProjectLocks::default(),
        }
    }

    /// Never descends into `dir` while scanning (e.g. the data directory).
    #[must_use]
    pub fn with_excluded_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline.excluded_dirs.push(dir.into());
        self
    }

    pub(crate) const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the status tracker.
    #[must_use]
    pub const fn status(&self) -> &Arc<SyncStatusTracker> {
        &self.status
    }

    /// Returns the lock that serializes mutations of a project.
    #[must_use]
    pub fn project_lock(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock_for(project)
    }

    /// Returns the changes a sync would apply, without mutating anything.
    #[instrument(skip(self, project), fields(operation = "scan", project = %project.name))]
    pub async fn scan(&self, project: &Project) -> Result<ChangeReport> {
        let pipeline = self.pipeline.clone();
        let project = project.clone();
        run_blocking("scan", move || pipeline.scan(&project)).await
    }

    /// Runs a full pass over the project directory.
    #[instrument(skip(self, project), fields(operation = "sync", project = %project.name))]
    pub async fn sync(&self, project: &Project) -> Result<ChangeReport> {
        let lock = self.project_lock(&project.name);
        let _guard = lock.lock().await;
        let start = Instant::now();

        self.status.set_state(&project.name, SyncState::Scanning);
        let result = self.run_pass(project, None).await;
        match &result {
            Ok(report) => {
                self.status
                    .complete(&project.name, format!("{} changes", report.total()));
                tracing::info!(
                    project = %project.name,
                    new = report.new.len(),
                    modified = report.modified.len(),
                    deleted = report.deleted.len(),
                    moved = report.moves.len(),
                    errors = report.errors.len(),
                    "sync pass completed"
                );
            },
            Err(e) => {
                self.status.fail(&project.name, e);
                tracing::error!(project = %project.name, error = %e, "sync pass failed");
            },
        }
        metrics::histogram!("notegraph_sync_duration_ms", "mode" => "full")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Runs an incremental pass over a batch of absolute paths.
    ///
    /// Paths outside the project or matching the ignore rules are dropped.
    #[instrument(skip(self, project, paths), fields(operation = "sync_paths", project = %project.name, count = paths.len()))]
    pub async fn sync_paths(&self, project: &Project, paths: &[PathBuf]) -> Result<ChangeReport> {
        let root = Path::new(&project.path);
        let relative: BTreeSet<String> = paths
            .iter()
            .filter_map(|p| relative_path(root, p))
            .filter(|rel| !self.pipeline.ignore.is_ignored(rel))
            .collect();
        if relative.is_empty() {
            return Ok(ChangeReport::default());
        }

        let lock = self.project_lock(&project.name);
        let _guard = lock.lock().await;
        let start = Instant::now();
        let result = self.run_pass(project, Some(relative)).await;
        if let Err(e) = &result {
            self.status.fail(&project.name, e);
        }
        metrics::histogram!("notegraph_sync_duration_ms", "mode" => "incremental")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn run_pass(&self, project: &Project, paths: Option<BTreeSet<String>>) -> Result<ChangeReport> {
        let incremental = paths.is_some();
        let pipeline = self.pipeline.clone();
        let scanned = project.clone();
        let mut report = run_blocking("scan", move || match paths {
            Some(paths) => pipeline.scan_paths(&scanned, &paths),
            None => pipeline.scan(&scanned),
        })
        .await?;

        if !incremental {
            self.status.set_state(&project.name, SyncState::Syncing);
        }

        let pipeline = self.pipeline.clone();
        let applied = project.clone();
        let (report, mut touched) = run_blocking("apply", move || {
            let touched = pipeline.apply(&applied, &mut report)?;
            Ok((report, touched))
        })
        .await?;

        let pipeline = self.pipeline.clone();
        let resolved = project.clone();
        touched.extend(run_blocking("resolve", move || pipeline.resolve(&resolved)).await?);

        let pipeline = self.pipeline.clone();
        let indexed = project.clone();
        run_blocking("index", move || pipeline.index(&indexed, &touched)).await?;
        Ok(report)
    }

    /// Resolves forward references of a project without scanning.
    pub async fn resolve_relations(&self, project: &Project) -> Result<usize> {
        let lock = self.project_lock(&project.name);
        let _guard = lock.lock().await;
        let pipeline = self.pipeline.clone();
        let project = project.clone();
        run_blocking("resolve", move || {
            let sources = pipeline.resolve(&project)?;
            pipeline.index(&project, &sources)
        })
        .await
    }

    /// Parses every file without writing; returns problems by path.
    #[instrument(skip(self, project), fields(operation = "validate", project = %project.name))]
    pub async fn validate(&self, project: &Project) -> Result<BTreeMap<String, String>> {
        let pipeline = self.pipeline.clone();
        let project = project.clone();
        run_blocking("validate", move || pipeline.validate(&project)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: i64, checksum: &str) -> FileState {
        FileState {
            id: EntityId::new(id),
            checksum: Some(checksum.to_string()),
        }
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect()
    }

    #[test]
    fn test_diff_classifies_changes() {
        let states = BTreeMap::from([
            ("same.md".to_string(), state(1, "s")),
            ("changed.md".to_string(), state(2, "old")),
            ("gone.md".to_string(), state(3, "g")),
        ]);
        let report = diff_states(
            files(&[("same.md", "s"), ("changed.md", "new"), ("added.md", "a")]),
            &states,
        );
        assert_eq!(report.new, BTreeSet::from(["added.md".to_string()]));
        assert_eq!(report.modified, BTreeSet::from(["changed.md".to_string()]));
        assert_eq!(report.deleted, BTreeSet::from(["gone.md".to_string()]));
        assert!(report.moves.is_empty());
        assert_eq!(report.checksums.len(), 3);
    }

    #[test]
    fn test_diff_detects_move() {
        let states = BTreeMap::from([("notes/Draft.md".to_string(), state(1, "c"))]);
        let report = diff_states(files(&[("notes/Final.md", "c")]), &states);
        assert!(report.new.is_empty());
        assert!(report.deleted.is_empty());
        assert_eq!(report.moves["notes/Draft.md"], "notes/Final.md");
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn test_diff_pairs_identical_content_in_sorted_order() {
        let states = BTreeMap::from([
            ("a.md".to_string(), state(1, "same")),
            ("b.md".to_string(), state(2, "same")),
        ]);
        let report = diff_states(files(&[("y.md", "same"), ("x.md", "same"), ("z.md", "same")]), &states);
        assert_eq!(report.moves["a.md"], "x.md");
        assert_eq!(report.moves["b.md"], "y.md");
        assert_eq!(report.new, BTreeSet::from(["z.md".to_string()]));
    }

    #[test]
    fn test_diff_missing_checksum_is_modified() {
        let states = BTreeMap::from([(
            "a.md".to_string(),
            FileState {
                id: EntityId::new(1),
                checksum: None,
            },
        )]);
        let report = diff_states(files(&[("a.md", "c")]), &states);
        assert_eq!(report.modified.len(), 1);
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let states = BTreeMap::from([("a.md".to_string(), state(1, "c"))]);
        assert!(diff_states(files(&[("a.md", "c")]), &states).is_empty());
    }
}
