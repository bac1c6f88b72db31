//! Business logic services.
//!
//! Services orchestrate the graph store and the search index and provide
//! high-level operations. [`KnowledgeBase`] wires them together and is the
//! entry point used by the CLI and by embedding applications.

pub mod context;
pub mod entity;
pub mod ignore;
pub mod indexer;
pub mod link_resolver;
pub mod parser;
pub mod permalink;
pub mod sync;
pub mod sync_status;
pub mod watch;
pub mod writer;

pub use context::ContextService;
pub use entity::{EntityService, WrittenDocument};
pub use ignore::{IgnoreRules, is_transient_file_name};
pub use indexer::Indexer;
pub use link_resolver::LinkResolver;
pub use parser::parse_document;
pub use permalink::generate_permalink;
pub use sync::SyncService;
pub use sync_status::SyncStatusTracker;
pub use watch::{BatchWindow, WatchHandle, WatchService};
pub use writer::{DocumentWriter, compute_checksum};

use crate::config::NoteGraphConfig;
use crate::models::{
    ChangeReport, ContextRequest, ContextSeed, Entity, EntityDocument, GraphContext, Project,
    SearchHit, SyncStatus,
};
use crate::storage::{GraphStore, SearchIndex, SqliteGraphStore, SqliteSearchIndex};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

/// Runs blocking store or filesystem work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::operation(operation, e))?
}

/// A knowledge base: the graph store, the search index and the services
/// over them, for any number of projects.
///
/// Every operation names its project; unknown names are
/// [`Error::NotFound`]. Mutations of one project are serialized.
pub struct KnowledgeBase {
    config: NoteGraphConfig,
    store: Arc<dyn GraphStore>,
    index: Arc<dyn SearchIndex>,
    indexer: Indexer,
    sync: Arc<SyncService>,
    entities: EntityService,
    context: ContextService,
}

impl KnowledgeBase {
    /// Opens the database under the configured data directory, runs
    /// migrations and registers the configured projects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] if the schema cannot be brought up to
    /// date, or an I/O error if the data directory cannot be created.
    pub fn open(config: NoteGraphConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::operation("create_data_dir", format!("{}: {e}", config.data_dir.display()))
        })?;
        let db_path = config.database_path();
        let store = SqliteGraphStore::new(&db_path)?
            .with_max_permalink_suffix(config.sync.max_permalink_suffix);
        let index = SqliteSearchIndex::new(&db_path)?;
        tracing::info!(db = %db_path.display(), "opened knowledge base");
        Self::from_parts(config, Arc::new(store), Arc::new(index))
    }

    /// Opens an in-memory knowledge base. Nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory databases cannot be created.
    pub fn in_memory(config: NoteGraphConfig) -> Result<Self> {
        let store = SqliteGraphStore::in_memory()?
            .with_max_permalink_suffix(config.sync.max_permalink_suffix);
        let index = SqliteSearchIndex::in_memory()?;
        Self::from_parts(config, Arc::new(store), Arc::new(index))
    }

    /// Builds a knowledge base over existing backends.
    ///
    /// # Errors
    ///
    /// Returns an error if an ignore pattern is malformed or a configured
    /// project cannot be registered.
    pub fn from_parts(
        config: NoteGraphConfig,
        store: Arc<dyn GraphStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let indexer = Indexer::new(Arc::clone(&store), Arc::clone(&index));
        let ignore = IgnoreRules::new(&config.sync.ignore_patterns)?;
        let status = Arc::new(SyncStatusTracker::new());
        let sync = SyncService::new(
            Arc::clone(&store),
            indexer.clone(),
            status,
            ignore,
        )
        .with_excluded_dir(config.data_dir.clone());
        let entities = EntityService::new(Arc::clone(&store), indexer.clone());
        let context = ContextService::new(Arc::clone(&store)).with_recent_window(
            chrono::Duration::days(config.context.recent_window_days),
        );

        let kb = Self {
            config,
            store,
            index,
            indexer,
            sync: Arc::new(sync),
            entities,
            context,
        };
        let configured: Vec<(String, std::path::PathBuf)> = kb
            .config
            .projects
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        for (name, path) in configured {
            kb.ensure_project(&name, &path)?;
        }
        Ok(kb)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &NoteGraphConfig {
        &self.config
    }

    /// Returns the graph store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Returns the sync service.
    #[must_use]
    pub const fn sync_service(&self) -> &Arc<SyncService> {
        &self.sync
    }

    /// Registers a project, or updates its directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty name.
    pub fn ensure_project(&self, name: &str, path: &Path) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("project name must not be empty".to_string()));
        }
        let absolute = std::path::absolute(path)
            .map_err(|e| Error::operation("resolve_project_path", format!("{}: {e}", path.display())))?;
        self.store
            .ensure_project(name, &absolute.to_string_lossy())
    }

    /// Looks up a registered project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn project(&self, name: &str) -> Result<Project> {
        self.store
            .get_project(name)?
            .ok_or_else(|| Error::NotFound(format!("project '{name}'")))
    }

    /// Lists registered projects.
    pub fn projects(&self) -> Result<Vec<Project>> {
        self.store.list_projects()
    }

    /// Reports what a sync would change, without changing anything.
    pub async fn scan(&self, project: &str) -> Result<ChangeReport> {
        let project = self.project(project)?;
        self.sync.scan(&project).await
    }

    /// Synchronizes a project directory with the graph.
    pub async fn sync(&self, project: &str) -> Result<ChangeReport> {
        let project = self.project(project)?;
        self.sync.sync(&project).await
    }

    /// Parses every note without writing; returns problems by path.
    pub async fn validate(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let project = self.project(project)?;
        self.sync.validate(&project).await
    }

    /// Creates or updates an entity by writing its note file.
    ///
    /// The file is written first (guarded by `expected_checksum`, or by the
    /// checksum read just before writing), then the entity is upserted from
    /// it through the same protocol sync uses. Forward references are
    /// resolved afterwards; if that takes longer than the configured
    /// timeout it finishes in the background.
    ///
    /// Returns the entity and whether it was created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirtyFile`] if the file changed since the caller
    /// read it, [`Error::InvalidInput`] for a bad title or folder, and
    /// [`Error::PermalinkExhausted`] if no permalink is free.
    #[instrument(skip(self, document, expected_checksum), fields(operation = "upsert_entity", project = %project, title = %document.title))]
    pub async fn upsert_entity(
        &self,
        project: &str,
        document: EntityDocument,
        expected_checksum: Option<String>,
    ) -> Result<(Entity, bool)> {
        let project = self.project(project)?;
        let lock = self.sync.project_lock(&project.name);
        let outcome = {
            let _guard = lock.lock().await;
            let entities = self.entities.clone();
            let pipeline = self.sync.pipeline().clone();
            let target = project.clone();
            run_blocking("upsert_entity", move || {
                let written =
                    entities.write_document(&target, &document, expected_checksum.as_deref())?;
                let outcome = pipeline.apply_file(&target, &written.path)?;
                pipeline.index(&target, &BTreeSet::from([outcome.entity.id]))?;
                Ok(outcome)
            })
            .await?
        };

        let sync = Arc::clone(&self.sync);
        let resolving = project.clone();
        let task = tokio::spawn(async move { sync.resolve_relations(&resolving).await });
        match tokio::time::timeout(self.config.sync.resolve_timeout(), task).await {
            Ok(Ok(Ok(indexed))) => {
                tracing::debug!(project = %project.name, indexed, "resolved relations after write");
            },
            Ok(Ok(Err(e))) => {
                tracing::warn!(project = %project.name, error = %e, "relation resolution failed");
            },
            Ok(Err(e)) => {
                tracing::warn!(project = %project.name, error = %e, "relation resolution task failed");
            },
            Err(_) => {
                tracing::debug!(project = %project.name, "relation resolution continues in background");
            },
        }

        Ok((outcome.entity, outcome.created))
    }

    /// Deletes an entity and its note file. Returns false if nothing matched.
    ///
    /// `key` may be an id, permalink, `memory://` URL, title or path.
    pub async fn delete_entity(&self, project: &str, key: &str) -> Result<bool> {
        let project = self.project(project)?;
        let lock = self.sync.project_lock(&project.name);
        let _guard = lock.lock().await;
        let entities = self.entities.clone();
        let key = key.to_string();
        run_blocking("delete_entity", move || entities.delete_entity(&project, &key)).await
    }

    /// Finds an entity by id, permalink, `memory://` URL, title or path.
    pub fn find_entity(&self, project: &str, key: &str) -> Result<Option<Entity>> {
        let project = self.project(project)?;
        self.entities.find_entity(&project, key)
    }

    /// Builds a request for `seed` using the configured context defaults.
    ///
    /// `recent` (or `memory://recent`) selects recent activity.
    #[must_use]
    pub fn context_request(&self, seed: &str) -> ContextRequest {
        let seed = match ContextSeed::parse(seed) {
            ContextSeed::Permalink(s) if s == "recent" => ContextSeed::Recent,
            other => other,
        };
        let defaults = &self.config.context;
        ContextRequest::new(seed)
            .with_depth(defaults.default_depth)
            .with_page(1, defaults.default_page_size)
            .with_max_related(defaults.max_related)
    }

    /// Builds graph context around a seed.
    pub async fn get_context(&self, project: &str, request: &ContextRequest) -> Result<GraphContext> {
        let project = self.project(project)?;
        let context = self.context.clone();
        let request = request.clone();
        run_blocking("get_context", move || context.build_context(project.id, &request)).await
    }

    /// Full-text search over a project's entities, observations and relations.
    pub fn search(&self, project: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let project = self.project(project)?;
        self.index.search(project.id, query, limit)
    }

    /// Rebuilds a project's search index from the graph.
    pub async fn reindex(&self, project: &str) -> Result<usize> {
        let project = self.project(project)?;
        let lock = self.sync.project_lock(&project.name);
        let _guard = lock.lock().await;
        let indexer = self.indexer.clone();
        run_blocking("reindex", move || indexer.reindex_project(&project)).await
    }

    /// Current sync status of a project.
    #[must_use]
    pub fn sync_status(&self, project: &str) -> SyncStatus {
        self.sync.status().get(project)
    }

    /// Sync status of every project that has one.
    #[must_use]
    pub fn sync_statuses(&self) -> Vec<SyncStatus> {
        self.sync.status().all()
    }

    /// Starts watching a project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the project is unknown or the OS watcher cannot
    /// be attached.
    pub fn watch(&self, project: &str) -> Result<WatchHandle> {
        let project = self.project(project)?;
        WatchService::new(Arc::clone(&self.sync))
            .with_debounce(self.config.sync.debounce())
            .with_max_batch_window(self.config.sync.max_batch_window())
            .with_poll_interval(self.config.sync.poll_interval())
            .start(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationSpec;
    use tempfile::TempDir;

    fn knowledge_base(dir: &TempDir) -> KnowledgeBase {
        let config = NoteGraphConfig::default()
            .with_data_dir(dir.path().join(".notegraph"))
            .with_project("notes", dir.path());
        KnowledgeBase::in_memory(config).unwrap()
    }

    #[tokio::test]
    async fn test_configured_projects_are_registered() {
        let dir = TempDir::new().unwrap();
        let kb = knowledge_base(&dir);
        assert_eq!(kb.projects().unwrap().len(), 1);
        assert!(matches!(kb.project("missing"), Err(Error::NotFound(_))));
        assert!(matches!(kb.sync("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upsert_then_update_entity() {
        let dir = TempDir::new().unwrap();
        let kb = knowledge_base(&dir);

        let (entity, created) = kb
            .upsert_entity("notes", EntityDocument::new("Alpha", "").with_content("first"), None)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(entity.permalink.as_deref(), Some("alpha"));
        assert!(dir.path().join("Alpha.md").exists());

        let (updated, created) = kb
            .upsert_entity("notes", EntityDocument::new("Alpha", "").with_content("second"), None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(updated.id, entity.id);

        // The written file is already in the graph; a sync finds nothing.
        let report = kb.sync("notes").await.unwrap();
        assert!(report.is_empty(), "unexpected changes: {report:?}");
    }

    #[tokio::test]
    async fn test_upsert_resolves_forward_reference() {
        let dir = TempDir::new().unwrap();
        let kb = knowledge_base(&dir);

        let (from, _) = kb
            .upsert_entity(
                "notes",
                EntityDocument::new("From", "").with_relation(RelationSpec::new("links_to", "To")),
                None,
            )
            .await
            .unwrap();
        let (to, _) = kb
            .upsert_entity("notes", EntityDocument::new("To", ""), None)
            .await
            .unwrap();

        let outgoing = kb.store.outgoing_relations(from.id).unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].to_id, Some(to.id));
    }

    #[tokio::test]
    async fn test_delete_entity_removes_file_and_hits() {
        let dir = TempDir::new().unwrap();
        let kb = knowledge_base(&dir);
        kb.upsert_entity(
            "notes",
            EntityDocument::new("Gone", "").with_content("ephemeral words"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(kb.search("notes", "ephemeral", 10).unwrap().len(), 1);

        assert!(kb.delete_entity("notes", "gone").await.unwrap());
        assert!(!dir.path().join("Gone.md").exists());
        assert!(kb.search("notes", "ephemeral", 10).unwrap().is_empty());
        assert!(!kb.delete_entity("notes", "gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_context_request_uses_configured_defaults() {
        let dir = TempDir::new().unwrap();
        let mut config = NoteGraphConfig::default().with_data_dir(dir.path().join(".ng"));
        config.context.default_depth = 2;
        config.context.max_related = 3;
        let kb = KnowledgeBase::in_memory(config).unwrap();

        let request = kb.context_request("memory://specs/*");
        assert_eq!(request.seed, ContextSeed::Pattern("specs/*".to_string()));
        assert_eq!(request.depth, 2);
        assert_eq!(request.max_related, 3);
        assert_eq!(kb.context_request("recent").seed, ContextSeed::Recent);
    }

    #[tokio::test]
    async fn test_reindex_restores_search() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.md"), "# A\n\nsearchable text\n").unwrap();
        let kb = knowledge_base(&dir);
        kb.sync("notes").await.unwrap();

        let project = kb.project("notes").unwrap();
        kb.index.clear_project(project.id).unwrap();
        assert!(kb.search("notes", "searchable", 10).unwrap().is_empty());

        assert_eq!(kb.reindex("notes").await.unwrap(), 1);
        assert_eq!(kb.search("notes", "searchable", 10).unwrap().len(), 1);
    }
}
