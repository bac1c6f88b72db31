//! Keeps the full-text index in step with the graph store.

use crate::Result;
use crate::models::{Entity, EntityId, Observation, Project, Relation, SearchDocument, SearchItemKind};
use crate::services::parser::parse_document;
use crate::storage::{GraphStore, SearchIndex};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

/// Builds index rows from stored entities.
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn GraphStore>,
    index: Arc<dyn SearchIndex>,
}

impl Indexer {
    /// Creates an indexer.
    pub fn new(store: Arc<dyn GraphStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self { store, index }
    }

    /// Re-indexes the given entities. Missing ids are removed from the index.
    ///
    /// Returns the number of entities indexed.
    #[instrument(skip(self, project, ids), fields(operation = "index_entities", project = %project.name, count = ids.len()))]
    pub fn index_entities(&self, project: &Project, ids: &BTreeSet<EntityId>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let id_list: Vec<EntityId> = ids.iter().copied().collect();
        let entities = self.store.get_entities(&id_list)?;
        self.index_loaded(project, &entities, ids)
    }

    /// Drops the index rows of a deleted entity.
    pub fn remove(&self, id: EntityId) -> Result<usize> {
        self.index.remove_entity(id)
    }

    /// Rebuilds the whole index of a project from the store.
    #[instrument(skip(self, project), fields(operation = "reindex", project = %project.name))]
    pub fn reindex_project(&self, project: &Project) -> Result<usize> {
        self.index.clear_project(project.id)?;
        let entities = self.store.list_entities(project.id)?;
        let ids = entities.iter().map(|e| e.id).collect();
        let indexed = self.index_loaded(project, &entities, &ids)?;
        tracing::info!(project = %project.name, entities = indexed, "rebuilt search index");
        Ok(indexed)
    }

    fn index_loaded(
        &self,
        project: &Project,
        entities: &[Entity],
        requested: &BTreeSet<EntityId>,
    ) -> Result<usize> {
        let found: BTreeSet<EntityId> = entities.iter().map(|e| e.id).collect();
        for missing in requested.difference(&found) {
            self.index.remove_entity(*missing)?;
        }

        let ids: Vec<EntityId> = entities.iter().map(|e| e.id).collect();
        let observations = self.store.observations_for(&ids)?;
        let mut relations = Vec::new();
        for id in &ids {
            relations.extend(self.store.outgoing_relations(*id)?);
        }

        let target_ids: Vec<EntityId> = relations.iter().filter_map(|r| r.to_id).collect();
        let targets: HashMap<EntityId, String> = self
            .store
            .get_entities(&target_ids)?
            .into_iter()
            .map(|e| (e.id, e.link_key().to_string()))
            .collect();

        let root = Path::new(&project.path);
        for entity in entities {
            let owned_observations: Vec<&Observation> =
                observations.iter().filter(|o| o.entity_id == entity.id).collect();
            let owned_relations: Vec<&Relation> =
                relations.iter().filter(|r| r.from_id == entity.id).collect();
            let documents = search_documents(
                entity,
                &entity_text(root, entity),
                &owned_observations,
                &owned_relations,
                &targets,
            );
            self.index.index_entity(project.id, entity.id, &documents)?;
        }
        metrics::counter!("notegraph_index_entities_total").increment(entities.len() as u64);
        Ok(entities.len())
    }
}

/// Reads the searchable text of an entity's file.
fn entity_text(root: &Path, entity: &Entity) -> String {
    if !entity.is_markdown() {
        return entity.file_path.clone();
    }
    match std::fs::read_to_string(root.join(&entity.file_path)) {
        Ok(text) => parse_document(&text).body,
        Err(e) => {
            tracing::debug!(path = %entity.file_path, error = %e, "indexing entity without body");
            String::new()
        },
    }
}

/// Builds the index rows of one entity.
#[must_use]
pub fn search_documents(
    entity: &Entity,
    body: &str,
    observations: &[&Observation],
    relations: &[&Relation],
    targets: &HashMap<EntityId, String>,
) -> Vec<SearchDocument> {
    let permalink = entity.link_key();
    let mut documents = Vec::with_capacity(1 + observations.len() + relations.len());
    documents.push(SearchDocument {
        kind: SearchItemKind::Entity,
        entity_id: entity.id,
        permalink: permalink.to_string(),
        title: entity.title.clone(),
        content: body.to_string(),
        file_path: entity.file_path.clone(),
    });

    for observation in observations {
        documents.push(SearchDocument {
            kind: SearchItemKind::Observation,
            entity_id: entity.id,
            permalink: observation.permalink(permalink),
            title: format!("{}: {}", observation.category, entity.title),
            content: observation.content.clone(),
            file_path: entity.file_path.clone(),
        });
    }

    for relation in relations {
        let to_key = relation
            .to_id
            .and_then(|id| targets.get(&id))
            .map_or(relation.to_name.as_str(), String::as_str);
        documents.push(SearchDocument {
            kind: SearchItemKind::Relation,
            entity_id: entity.id,
            permalink: relation.permalink(permalink, to_key),
            title: format!("{} {} {}", entity.title, relation.relation_type, relation.to_name),
            content: relation.context.clone().unwrap_or_default(),
            file_path: entity.file_path.clone(),
        });
    }
    documents
}
