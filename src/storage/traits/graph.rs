//! Graph store trait.
//!
//! The graph store is the sole writer of entity, observation and relation
//! rows. Services never issue SQL of their own; every mutation goes through
//! [`GraphStore::upsert_entity`], [`GraphStore::move_entity`],
//! [`GraphStore::delete_entity`] or [`GraphStore::resolve_relation`].
//!
//! # Upsert Protocol
//!
//! | Step | Condition | Action |
//! |------|-----------|--------|
//! | 1 | an entity has this `(project, file_path)` | update in place, keep id |
//! | 2 | none found | insert |
//! | 3 | insert hits a uniqueness violation | re-check `file_path`; update if found, else append `-1`, `-2`, ... to the permalink and insert |
//!
//! Observations and outgoing relations are replaced wholesale in the same
//! transaction as the entity row. An update or move keeps the stored
//! permalink while it still derives from the same base (`base` or
//! `base-N`), so disambiguated permalinks stay stable.
//!
//! # Deletion
//!
//! Deleting an entity removes its observations and outgoing relations.
//! Incoming relations from other entities are demoted to unresolved: their
//! `to_id` is cleared and `to_name` is kept, so they rebind when the target
//! reappears.

use crate::Result;
use crate::models::{
    Entity, EntityId, NewEntity, NewRelation, Observation, ObservationSpec, Project, Relation,
    UpsertOutcome,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Stored path and checksum of one entity, used for diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    /// Entity id.
    pub id: EntityId,
    /// Stored checksum, if any.
    pub checksum: Option<String>,
}

/// Result of [`GraphStore::delete_entity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// False if the entity did not exist.
    pub deleted: bool,
    /// Entities whose relations to the deleted one were demoted; their
    /// index rows are stale.
    pub demoted_sources: BTreeSet<EntityId>,
}

/// Trait for graph store backends.
///
/// # Implementor Notes
///
/// - Methods take `&self` so the store can be shared as `Arc<dyn GraphStore>`
/// - Use interior mutability (e.g. `Mutex<Connection>`) for connection state
/// - Every project-scoped lookup must filter by `project_id`
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Projects
    // ========================================================================

    /// Registers a project, or updates its path if the name exists.
    fn ensure_project(&self, name: &str, path: &str) -> Result<Project>;

    /// Looks up a project by name.
    fn get_project(&self, name: &str) -> Result<Option<Project>>;

    /// Lists all projects ordered by name.
    fn list_projects(&self) -> Result<Vec<Project>>;

    // ========================================================================
    // Entities
    // ========================================================================

    /// Creates or updates an entity with its observations and outgoing
    /// relations, following the upsert protocol.
    fn upsert_entity(
        &self,
        project_id: i64,
        entity: &NewEntity,
        observations: &[ObservationSpec],
        relations: &[NewRelation],
    ) -> Result<UpsertOutcome>;

    /// Moves an entity to a new path, keeping its id, observations and
    /// relations. The permalink is disambiguated against other entities.
    fn move_entity(
        &self,
        id: EntityId,
        file_path: &str,
        title: &str,
        permalink: Option<&str>,
    ) -> Result<Entity>;

    /// Deletes an entity, demoting incoming relations.
    fn delete_entity(&self, id: EntityId) -> Result<DeleteOutcome>;

    /// Gets an entity by id.
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;

    /// Gets several entities by id, skipping unknown ids.
    fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>>;

    /// Finds the entity stored for a project-relative path.
    fn find_by_file_path(&self, project_id: i64, file_path: &str) -> Result<Option<Entity>>;

    /// Finds an entity by exact permalink.
    fn find_by_permalink(&self, project_id: i64, permalink: &str) -> Result<Option<Entity>>;

    /// Finds entities whose title matches case-insensitively.
    fn find_by_title(&self, project_id: i64, title: &str) -> Result<Vec<Entity>>;

    /// Finds entities whose permalink (or path, for files without one)
    /// matches a glob pattern.
    fn find_by_pattern(&self, project_id: i64, pattern: &str) -> Result<Vec<Entity>>;

    /// Lists all entities of a project.
    fn list_entities(&self, project_id: i64) -> Result<Vec<Entity>>;

    /// Returns path to id and checksum for every entity of a project.
    fn file_states(&self, project_id: i64) -> Result<BTreeMap<String, FileState>>;

    /// Lists entities updated at or after `since`, newest first.
    fn recent_entities(&self, project_id: i64, since: DateTime<Utc>) -> Result<Vec<Entity>>;

    // ========================================================================
    // Observations
    // ========================================================================

    /// Lists observations of the given entities.
    fn observations_for(&self, ids: &[EntityId]) -> Result<Vec<Observation>>;

    /// Lists observations written at or after `since`, newest first.
    fn recent_observations(&self, project_id: i64, since: DateTime<Utc>)
    -> Result<Vec<Observation>>;

    // ========================================================================
    // Relations
    // ========================================================================

    /// Lists relations whose source or target is one of `ids`, optionally
    /// only those updated at or after `since`.
    fn relations_touching(
        &self,
        ids: &[EntityId],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Relation>>;

    /// Lists outgoing relations of an entity.
    fn outgoing_relations(&self, id: EntityId) -> Result<Vec<Relation>>;

    /// Lists unresolved relations of a project.
    fn unresolved_relations(&self, project_id: i64) -> Result<Vec<Relation>>;

    /// Binds an unresolved relation to a target.
    ///
    /// Returns false if an identical resolved relation already existed; the
    /// unresolved duplicate is removed in that case.
    fn resolve_relation(&self, relation_id: i64, to_id: EntityId) -> Result<bool>;

    /// Lists relations updated at or after `since`, newest first.
    fn recent_relations(&self, project_id: i64, since: DateTime<Utc>) -> Result<Vec<Relation>>;
}
