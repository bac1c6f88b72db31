//! Data models for notegraph.
//!
//! This module contains the graph arena types, parsed documents, context
//! queries and sync reports shared by the services and storage layers.

pub mod context;
mod document;
pub mod graph;
mod search;
mod sync;

pub use context::{
    ContextItem, ContextMetadata, ContextRequest, ContextResult, ContextSeed, EntitySummary,
    GraphContext, MEMORY_URL_SCHEME, ObservationSummary, RelatedItem, RelationSummary,
};
pub use document::{EntityDocument, Frontmatter, ParsedDocument, parse_datetime};
pub use graph::{
    DEFAULT_ENTITY_TYPE, DEFAULT_OBSERVATION_CATEGORY, DEFAULT_RELATION_TYPE, Entity, EntityId, LINKS_TO,
    MARKDOWN_CONTENT_TYPE, NewEntity, NewRelation, Observation, ObservationSpec, Project,
    Relation, RelationSpec, UpsertOutcome,
};
pub use search::{SearchDocument, SearchHit, SearchItemKind};
pub use sync::{ChangeKind, ChangeReport, FileChange, SyncState, SyncStatus};
