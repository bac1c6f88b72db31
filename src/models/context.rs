//! Context request and result types.
//!
//! A context request names a seed (permalink, glob pattern, or recent
//! activity), a traversal depth, and an optional timeframe. The result is a
//! page of primary items, each with its observations and the items reachable
//! within the depth bound.

use crate::models::graph::{Entity, EntityId, Observation, Relation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// URL scheme accepted in front of context seeds.
pub const MEMORY_URL_SCHEME: &str = "memory://";

/// Where context building starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContextSeed {
    /// An exact permalink.
    Permalink(String),
    /// A glob pattern such as `specs/*`.
    Pattern(String),
    /// Everything touched since the request's `since` (or the recent window).
    Recent,
}

impl ContextSeed {
    /// Parses a seed string, stripping a `memory://` prefix.
    ///
    /// Strings containing `*` or `?` are patterns; everything else is a
    /// permalink.
    #[must_use]
    pub fn parse(seed: &str) -> Self {
        let seed = seed.trim();
        let seed = seed.strip_prefix(MEMORY_URL_SCHEME).unwrap_or(seed);
        let seed = seed.trim_matches('/');
        if seed.contains(['*', '?']) {
            Self::Pattern(seed.to_string())
        } else {
            Self::Permalink(seed.to_string())
        }
    }

    /// Returns a display form of the seed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Permalink(s) | Self::Pattern(s) => s,
            Self::Recent => "recent",
        }
    }
}

impl std::fmt::Display for ContextSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{MEMORY_URL_SCHEME}{}", self.as_str())
    }
}

/// Parameters of a context query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    /// Starting point.
    pub seed: ContextSeed,
    /// Maximum number of relation hops from a seed.
    pub depth: usize,
    /// Only items and edges touched at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// 1-based page number over seeds.
    pub page: usize,
    /// Seeds per page.
    pub page_size: usize,
    /// Cap on related items per primary result.
    pub max_related: usize,
}

impl ContextRequest {
    /// Creates a request with depth 1, page 1, 10 seeds per page and 10
    /// related items.
    #[must_use]
    pub const fn new(seed: ContextSeed) -> Self {
        Self {
            seed,
            depth: 1,
            since: None,
            page: 1,
            page_size: 10,
            max_related: 10,
        }
    }

    /// Sets the traversal depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Sets the timeframe cutoff.
    #[must_use]
    pub const fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the page and page size.
    #[must_use]
    pub const fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Sets the related-item cap.
    #[must_use]
    pub const fn with_max_related(mut self, max_related: usize) -> Self {
        self.max_related = max_related;
        self
    }
}

/// Entity fields surfaced in context results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    /// Entity id.
    pub id: EntityId,
    /// Title.
    pub title: String,
    /// Entity type.
    pub entity_type: String,
    /// Permalink, or the file path for non-text entities.
    pub permalink: String,
    /// Project-relative path.
    pub file_path: String,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl From<&Entity> for EntitySummary {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            title: entity.title.clone(),
            entity_type: entity.entity_type.clone(),
            permalink: entity.link_key().to_string(),
            file_path: entity.file_path.clone(),
            updated_at: entity.updated_at,
        }
    }
}

/// Observation fields surfaced in context results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSummary {
    /// Observation id.
    pub id: i64,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Derived permalink.
    pub permalink: String,
    /// Category.
    pub category: String,
    /// Content.
    pub content: String,
    /// When it was written.
    pub created_at: DateTime<Utc>,
}

impl ObservationSummary {
    /// Builds a summary using the owning entity's permalink.
    #[must_use]
    pub fn new(observation: &Observation, entity_permalink: &str) -> Self {
        Self {
            id: observation.id,
            entity_id: observation.entity_id,
            permalink: observation.permalink(entity_permalink),
            category: observation.category.clone(),
            content: observation.content.clone(),
            created_at: observation.created_at,
        }
    }
}

/// Relation fields surfaced in context results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSummary {
    /// Relation id.
    pub id: i64,
    /// Source entity.
    pub from_id: EntityId,
    /// Target entity, if resolved.
    pub to_id: Option<EntityId>,
    /// Literal target text.
    pub to_name: String,
    /// Verb phrase.
    pub relation_type: String,
    /// Derived permalink.
    pub permalink: String,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl RelationSummary {
    /// Builds a summary from the relation and its endpoint keys.
    #[must_use]
    pub fn new(relation: &Relation, from_permalink: &str, to_key: &str) -> Self {
        Self {
            id: relation.id,
            from_id: relation.from_id,
            to_id: relation.to_id,
            to_name: relation.to_name.clone(),
            relation_type: relation.relation_type.clone(),
            permalink: relation.permalink(from_permalink, to_key),
            updated_at: relation.updated_at,
        }
    }
}

/// One item in a context result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    /// An entity.
    Entity(EntitySummary),
    /// An observation.
    Observation(ObservationSummary),
    /// A relation.
    Relation(RelationSummary),
}

impl ContextItem {
    /// Returns the item's recency timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Entity(e) => e.updated_at,
            Self::Observation(o) => o.created_at,
            Self::Relation(r) => r.updated_at,
        }
    }

    /// Returns the item's permalink.
    #[must_use]
    pub fn permalink(&self) -> &str {
        match self {
            Self::Entity(e) => &e.permalink,
            Self::Observation(o) => &o.permalink,
            Self::Relation(r) => &r.permalink,
        }
    }

    /// Returns the entity id if this item is an entity.
    #[must_use]
    pub const fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::Entity(e) => Some(e.id),
            _ => None,
        }
    }
}

/// An item reached by traversal, with its hop distance from the seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedItem {
    /// Hops from the primary item.
    pub depth: usize,
    /// The reached item.
    #[serde(flatten)]
    pub item: ContextItem,
}

/// A primary item with its observations and related items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextResult {
    /// The seed item.
    pub primary: ContextItem,
    /// Observations of the primary entity.
    pub observations: Vec<ObservationSummary>,
    /// Items reachable within the depth bound, nearest and newest first.
    pub related: Vec<RelatedItem>,
}

/// Paging and query echo for a context result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// The seed as requested.
    pub seed: String,
    /// Depth used.
    pub depth: usize,
    /// Timeframe cutoff used.
    pub since: Option<DateTime<Utc>>,
    /// Page returned.
    pub page: usize,
    /// Page size used.
    pub page_size: usize,
    /// Seeds matched across all pages.
    pub total_seeds: usize,
    /// True if later pages exist.
    pub has_more: bool,
    /// When the result was built.
    pub generated_at: DateTime<Utc>,
}

/// Hierarchical context result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphContext {
    /// One entry per seed on this page.
    pub results: Vec<ContextResult>,
    /// Paging information.
    pub metadata: ContextMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("specs/search", ContextSeed::Permalink("specs/search".into()); "plain permalink")]
    #[test_case("memory://specs/search", ContextSeed::Permalink("specs/search".into()); "memory url")]
    #[test_case("memory://specs/*", ContextSeed::Pattern("specs/*".into()); "memory url pattern")]
    #[test_case("notes/draft-?", ContextSeed::Pattern("notes/draft-?".into()); "single char pattern")]
    fn test_seed_parse(input: &str, expected: ContextSeed) {
        assert_eq!(ContextSeed::parse(input), expected);
    }

    #[test]
    fn test_seed_display_uses_memory_scheme() {
        assert_eq!(
            ContextSeed::Pattern("a/*".into()).to_string(),
            "memory://a/*"
        );
        assert_eq!(ContextSeed::Recent.to_string(), "memory://recent");
    }

    #[test]
    fn test_request_builder() {
        let req = ContextRequest::new(ContextSeed::Recent)
            .with_depth(3)
            .with_page(2, 5)
            .with_max_related(4);
        assert_eq!(req.depth, 3);
        assert_eq!(req.page, 2);
        assert_eq!(req.page_size, 5);
        assert_eq!(req.max_related, 4);
        assert!(req.since.is_none());
    }
}
