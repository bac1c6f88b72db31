//! Search index trait.
//!
//! The index is a derived view of the graph store. It holds one row per
//! entity, observation and relation and can always be rebuilt from the
//! store.

use crate::Result;
use crate::models::{EntityId, SearchDocument, SearchHit};

/// Trait for full-text search backends.
///
/// # Implementor Notes
///
/// - Methods take `&self` so the index can be shared as `Arc<dyn SearchIndex>`
/// - Query text is user input; escape it for the backend's query syntax
/// - Clearing or rebuilding the index must not touch graph rows
pub trait SearchIndex: Send + Sync {
    /// Replaces every row of an entity with `documents`.
    fn index_entity(
        &self,
        project_id: i64,
        entity_id: EntityId,
        documents: &[SearchDocument],
    ) -> Result<()>;

    /// Removes every row of an entity. Returns the number removed.
    fn remove_entity(&self, entity_id: EntityId) -> Result<usize>;

    /// Searches a project, best matches first.
    fn search(&self, project_id: i64, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Removes every row of a project.
    fn clear_project(&self, project_id: i64) -> Result<()>;

    /// Counts rows of a project.
    fn count(&self, project_id: i64) -> Result<usize>;
}
