//! Direct write path for entities.
//!
//! Writes go to the note file first, through the checksum-guarded writer;
//! the graph is then updated from the written file by the same upsert that
//! sync uses, so both paths share one conflict-resolution protocol.

use crate::models::{Entity, EntityDocument, EntityId, MEMORY_URL_SCHEME, Project};
use crate::services::indexer::Indexer;
use crate::services::link_resolver::LinkResolver;
use crate::services::parser::parse_document;
use crate::services::permalink::generate_permalink;
use crate::services::writer::{DocumentWriter, ensure_heading, render_body, render_document};
use crate::storage::GraphStore;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::instrument;

/// A file written by [`EntityService::write_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenDocument {
    /// Project-relative path.
    pub path: String,
    /// Checksum of the new content.
    pub checksum: String,
    /// True if the file did not exist before.
    pub created: bool,
}

/// Creates, finds and deletes entities on behalf of callers.
#[derive(Clone)]
pub struct EntityService {
    store: Arc<dyn GraphStore>,
    indexer: Indexer,
    resolver: LinkResolver,
}

impl EntityService {
    /// Creates an entity service.
    pub fn new(store: Arc<dyn GraphStore>, indexer: Indexer) -> Self {
        let resolver = LinkResolver::new(Arc::clone(&store));
        Self {
            store,
            indexer,
            resolver,
        }
    }

    /// Renders and writes a document to its file.
    ///
    /// On update the existing frontmatter is kept and overlaid with the
    /// document's fields. The free text is replaced only if the document
    /// carries content; the observation and relation sections are
    /// regenerated from the document unless it has no content and no items,
    /// in which case the body is left untouched.
    ///
    /// Without `expected_checksum`, the checksum read here guards the write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty title or a path outside
    /// the project, and [`Error::DirtyFile`] if the file changed underneath.
    #[instrument(skip(self, project, document), fields(operation = "write_document", project = %project.name, title = %document.title))]
    pub fn write_document(
        &self,
        project: &Project,
        document: &EntityDocument,
        expected_checksum: Option<&str>,
    ) -> Result<WrittenDocument> {
        let title = document.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput("entity title must not be empty".to_string()));
        }

        let path = self.existing_path(project, document)?;
        let writer = DocumentWriter::new(&project.path);
        let target = writer.resolve(&path)?;
        let existing = match std::fs::read_to_string(&target) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::operation("read_file", format!("{path}: {e}"))),
        };

        let (mut frontmatter, body) = match &existing {
            Some(text) => {
                let parsed = parse_document(text);
                let body = if document.content.is_none()
                    && document.observations.is_empty()
                    && document.relations.is_empty()
                {
                    parsed.body
                } else {
                    let free_text = document.content.as_deref().unwrap_or(&parsed.free_text);
                    render_body(free_text, &document.observations, &document.relations)
                };
                (parsed.frontmatter, body)
            },
            None => {
                let free_text = ensure_heading(title, document.content.as_deref().unwrap_or(""));
                let body = render_body(&free_text, &document.observations, &document.relations);
                (crate::models::Frontmatter::default(), body)
            },
        };

        frontmatter.title = Some(title.to_string());
        if let Some(entity_type) = &document.entity_type {
            frontmatter.entity_type = Some(entity_type.clone());
        }
        if let Some(permalink) = &document.permalink {
            frontmatter.permalink = Some(permalink.clone());
        }
        if !document.tags.is_empty() {
            frontmatter.tags.clone_from(&document.tags);
        }
        frontmatter
            .extra
            .extend(document.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

        let content = render_document(&frontmatter, &body)?;
        let guard = match (expected_checksum, &existing) {
            (Some(expected), _) => Some(expected.to_string()),
            (None, Some(text)) => Some(crate::services::writer::compute_checksum(text.as_bytes())),
            (None, None) => None,
        };
        let checksum = writer.write(&path, &content, guard.as_deref())?;

        Ok(WrittenDocument {
            path,
            checksum,
            created: existing.is_none(),
        })
    }

    /// Returns the file a document is written to: the file of the entity it
    /// already names, or the path derived from its folder and title.
    ///
    /// An existing entity is matched by explicit permalink, then by the
    /// permalink derived from folder and title, then by title within the
    /// folder, then by the derived path.
    fn existing_path(&self, project: &Project, document: &EntityDocument) -> Result<String> {
        let derived = document.file_path();
        let folder = document.folder.trim().trim_matches('/');

        let mut candidate = match document.permalink.as_deref().map(str::trim) {
            Some(permalink) if !permalink.is_empty() => {
                self.store.find_by_permalink(project.id, permalink)?
            },
            _ => None,
        };
        if candidate.is_none() {
            let stem = derived.strip_suffix(".md").unwrap_or(&derived);
            let permalink = generate_permalink(stem);
            if !permalink.is_empty() {
                candidate = self.store.find_by_permalink(project.id, &permalink)?;
            }
        }
        if candidate.is_none() {
            candidate = self
                .store
                .find_by_title(project.id, document.title.trim())?
                .into_iter()
                .find(|e| e.is_markdown() && parent_folder(&e.file_path) == folder);
        }
        if candidate.is_none() {
            candidate = self.store.find_by_file_path(project.id, &derived)?;
        }

        Ok(match candidate {
            Some(entity) if entity.is_markdown() => {
                if entity.file_path != derived {
                    tracing::debug!(path = %entity.file_path, "updating existing note");
                }
                entity.file_path
            },
            _ => derived,
        })
    }

    /// Finds an entity by id, permalink, `memory://` URL, title or path.
    pub fn find_entity(&self, project: &Project, key: &str) -> Result<Option<Entity>> {
        let key = key.trim();
        if let Ok(id) = key.parse::<i64>() {
            if let Some(entity) = self.store.get_entity(EntityId::new(id))? {
                if entity.project_id == project.id {
                    return Ok(Some(entity));
                }
            }
        }
        let key = key
            .strip_prefix(MEMORY_URL_SCHEME)
            .unwrap_or(key)
            .trim_matches('/');
        self.resolver.resolve(project.id, key)
    }

    /// Deletes an entity and its file. Returns false if nothing matched.
    #[instrument(skip(self, project), fields(operation = "delete_entity", project = %project.name))]
    pub fn delete_entity(&self, project: &Project, key: &str) -> Result<bool> {
        let Some(entity) = self.find_entity(project, key)? else {
            return Ok(false);
        };
        let writer = DocumentWriter::new(&project.path);
        if !writer.remove(&entity.file_path)? {
            tracing::debug!(path = %entity.file_path, "file already gone");
        }
        let outcome = self.store.delete_entity(entity.id)?;
        self.indexer.remove(entity.id)?;
        self.indexer.index_entities(project, &outcome.demoted_sources)?;
        tracing::info!(
            entity = %entity.id,
            path = %entity.file_path,
            demoted = outcome.demoted_sources.len(),
            "deleted entity"
        );
        Ok(outcome.deleted)
    }
}

fn parent_folder(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(folder, _)| folder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MARKDOWN_CONTENT_TYPE, NewEntity, ObservationSpec, RelationSpec};
    use std::collections::BTreeMap;
    use crate::storage::{SqliteGraphStore, SqliteSearchIndex};
    use tempfile::TempDir;

    fn setup() -> (EntityService, Project, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::in_memory().unwrap());
        let index = Arc::new(SqliteSearchIndex::in_memory().unwrap());
        let project = store
            .ensure_project("test", &dir.path().to_string_lossy())
            .unwrap();
        let service = EntityService::new(Arc::clone(&store), Indexer::new(store, index));
        (service, project, dir)
    }

    #[test]
    fn test_create_synthesizes_heading_and_sections() {
        let (service, project, dir) = setup();
        let document = EntityDocument::new("Search Design", "specs")
            .with_content("Full-text search.\n")
            .with_observation(ObservationSpec::new("tech", "Uses FTS5"))
            .with_relation(RelationSpec::new("implements", "Search"));
        let written = service.write_document(&project, &document, None).unwrap();
        assert!(written.created);
        assert_eq!(written.path, "specs/Search Design.md");

        let text = std::fs::read_to_string(dir.path().join(&written.path)).unwrap();
        assert!(text.starts_with("---\ntitle: Search Design\n"));
        assert!(text.contains("# Search Design\n\nFull-text search.\n"));
        assert!(text.contains("- [tech] Uses FTS5\n"));
        assert!(text.contains("- implements [[Search]]\n"));
    }

    #[test]
    fn test_update_keeps_body_and_extra_frontmatter() {
        let (service, project, dir) = setup();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "---\ntitle: note\nstatus: draft\n---\nMy words.\n").unwrap();

        let document = EntityDocument::new("note", "").with_type("Design Doc");
        let written = service.write_document(&project, &document, None).unwrap();
        assert!(!written.created);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("type: Design Doc\n"));
        assert!(text.contains("status: draft\n"));
        assert!(text.ends_with("---\nMy words.\n"));
    }

    #[test]
    fn test_stale_checksum_is_a_conflict() {
        let (service, project, dir) = setup();
        let document = EntityDocument::new("a", "").with_content("one");
        service.write_document(&project, &document, None).unwrap();
        std::fs::write(dir.path().join("a.md"), "edited elsewhere").unwrap();

        let err = service
            .write_document(&project, &document.clone().with_content("two"), Some("stale"))
            .unwrap_err();
        assert!(err.is_retryable());
        let text = std::fs::read_to_string(dir.path().join("a.md")).unwrap();
        assert_eq!(text, "edited elsewhere");
    }

    #[test]
    fn test_empty_title_is_invalid() {
        let (service, project, _dir) = setup();
        let err = service
            .write_document(&project, &EntityDocument::new("  ", ""), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_folder_escape_is_invalid() {
        let (service, project, _dir) = setup();
        let err = service
            .write_document(&project, &EntityDocument::new("x", "../outside"), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_update_targets_existing_note_by_title() {
        let (service, project, dir) = setup();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(
            dir.path().join("notes/draft-plan.md"),
            "---\ntitle: Draft Plan\n---\nFirst draft.\n",
        )
        .unwrap();
        let entity = NewEntity {
            title: "Draft Plan".to_string(),
            entity_type: "note".to_string(),
            content_type: MARKDOWN_CONTENT_TYPE.to_string(),
            permalink: Some("notes/plan".to_string()),
            file_path: "notes/draft-plan.md".to_string(),
            checksum: None,
            metadata: BTreeMap::new(),
        };
        service.store.upsert_entity(project.id, &entity, &[], &[]).unwrap();

        let document = EntityDocument::new("Draft Plan", "notes").with_content("Second draft.\n");
        let written = service.write_document(&project, &document, None).unwrap();
        assert!(!written.created);
        assert_eq!(written.path, "notes/draft-plan.md");
        assert!(!dir.path().join("notes/Draft Plan.md").exists());
        let text = std::fs::read_to_string(dir.path().join("notes/draft-plan.md")).unwrap();
        assert!(text.contains("Second draft."));
    }

    #[test]
    fn test_title_in_other_folder_is_a_new_note() {
        let (service, project, dir) = setup();
        let entity = NewEntity {
            title: "Plan".to_string(),
            entity_type: "note".to_string(),
            content_type: MARKDOWN_CONTENT_TYPE.to_string(),
            permalink: Some("archive/old-plan".to_string()),
            file_path: "archive/old-plan.md".to_string(),
            checksum: None,
            metadata: BTreeMap::new(),
        };
        service.store.upsert_entity(project.id, &entity, &[], &[]).unwrap();

        let written = service
            .write_document(&project, &EntityDocument::new("Plan", "notes"), None)
            .unwrap();
        assert!(written.created);
        assert_eq!(written.path, "notes/Plan.md");
        assert!(dir.path().join("notes/Plan.md").exists());
    }

    #[test]
    fn test_delete_unknown_entity() {
        let (service, project, _dir) = setup();
        assert!(!service.delete_entity(&project, "missing").unwrap());
    }
}
