//! Graph types for the note knowledge graph.
//!
//! The graph is an arena of entities addressed by integer id. Observations
//! and relations refer to entities by id only; traversal is id lookup
//! against the store, never pointer chasing.
//!
//! # Ownership
//!
//! | Item | Owner | On owner delete |
//! |------|-------|-----------------|
//! | `Entity` | `Project` | cascades to observations and outgoing relations |
//! | `Observation` | `Entity` | deleted |
//! | `Relation` (outgoing) | source `Entity` | deleted |
//! | `Relation` (incoming) | foreign source `Entity` | target nulled (unresolved) |

use crate::services::generate_permalink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// MIME type of structured text entities (the only ones that carry permalinks).
pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown";

/// Entity type assigned to notes without a `type` field.
pub const DEFAULT_ENTITY_TYPE: &str = "note";

/// Category assigned to observations written without one.
pub const DEFAULT_OBSERVATION_CATEGORY: &str = "note";

/// Relation type of inline `[[links]]` outside explicit relation items.
pub const LINKS_TO: &str = "links_to";

/// Relation type used when an explicit relation item has no verb.
pub const DEFAULT_RELATION_TYPE: &str = "relates_to";

/// Store-assigned identifier of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    /// Wraps a raw store id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw store id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Tenancy boundary: one synchronized directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Store-assigned id.
    pub id: i64,
    /// Unique project name.
    pub name: String,
    /// Absolute path of the project directory.
    pub path: String,
    /// When the project was registered.
    pub created_at: DateTime<Utc>,
    /// When the project was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A node in the graph, one per synchronized file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Store-assigned identity.
    pub id: EntityId,
    /// Owning project id.
    pub project_id: i64,
    /// Human-readable title.
    pub title: String,
    /// Free-form classification, snake-case.
    pub entity_type: String,
    /// MIME-like content type.
    pub content_type: String,
    /// Stable identifier; `None` for non-text files.
    pub permalink: Option<String>,
    /// Project-relative path, always `/`-separated.
    pub file_path: String,
    /// Content hash; `None` until the first successful read or write.
    pub checksum: Option<String>,
    /// Frontmatter fields outside the known set.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Returns true if the entity is structured text.
    #[must_use]
    pub fn is_markdown(&self) -> bool {
        self.content_type == MARKDOWN_CONTENT_TYPE
    }

    /// Returns the permalink, or the file path for non-text entities.
    #[must_use]
    pub fn link_key(&self) -> &str {
        self.permalink.as_deref().unwrap_or(&self.file_path)
    }
}

/// Entity fields supplied to an upsert, before the store assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    /// Human-readable title.
    pub title: String,
    /// Free-form classification, snake-case.
    pub entity_type: String,
    /// MIME-like content type.
    pub content_type: String,
    /// Desired permalink; may be disambiguated on collision.
    pub permalink: Option<String>,
    /// Project-relative path.
    pub file_path: String,
    /// Content hash.
    pub checksum: Option<String>,
    /// Frontmatter fields outside the known set.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// An atomic, categorized note attached to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Store-assigned id.
    pub id: i64,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Category, defaulting to [`DEFAULT_OBSERVATION_CATEGORY`].
    pub category: String,
    /// Free-text content.
    pub content: String,
    /// Optional context annotation.
    pub context: Option<String>,
    /// Tags without the leading `#`.
    pub tags: Vec<String>,
    /// When the observation was written.
    pub created_at: DateTime<Utc>,
}

impl Observation {
    /// Returns the synthetic permalink derived from the owning entity.
    #[must_use]
    pub fn permalink(&self, entity_permalink: &str) -> String {
        generate_permalink(&format!(
            "{entity_permalink}/observations/{}/{}",
            self.category, self.content
        ))
    }
}

/// A directed, typed edge from an entity to an entity or an unresolved name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Store-assigned id.
    pub id: i64,
    /// Source entity; always real.
    pub from_id: EntityId,
    /// Target entity; `None` while unresolved.
    pub to_id: Option<EntityId>,
    /// Literal link target text.
    pub to_name: String,
    /// Active-voice verb phrase.
    pub relation_type: String,
    /// Optional context annotation.
    pub context: Option<String>,
    /// When the relation was created.
    pub created_at: DateTime<Utc>,
    /// When the relation was last updated (including resolution).
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    /// Returns true if the relation has no target entity yet.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        self.to_id.is_none()
    }

    /// Returns the synthetic permalink of the edge.
    #[must_use]
    pub fn permalink(&self, from_permalink: &str, to_key: &str) -> String {
        generate_permalink(&format!(
            "{from_permalink}/{}/{to_key}",
            self.relation_type
        ))
    }
}

/// An observation to be written alongside its entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationSpec {
    /// Category.
    pub category: String,
    /// Free-text content, tags included.
    pub content: String,
    /// Optional context annotation.
    pub context: Option<String>,
    /// Tags without the leading `#`.
    pub tags: Vec<String>,
}

impl ObservationSpec {
    /// Creates an observation in the given category.
    pub fn new(category: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            content: content.into(),
            context: None,
            tags: Vec::new(),
        }
    }

    /// Sets the context annotation.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Adds tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// An outgoing relation to be written alongside its entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationSpec {
    /// Active-voice verb phrase.
    pub relation_type: String,
    /// Literal link target text.
    pub target: String,
    /// Optional context annotation.
    pub context: Option<String>,
}

impl RelationSpec {
    /// Creates a relation to `target`.
    pub fn new(relation_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            relation_type: relation_type.into(),
            target: target.into(),
            context: None,
        }
    }

    /// Sets the context annotation.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A relation row ready for insertion, with its target resolved if possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRelation {
    /// Resolved target, if known at write time.
    pub to_id: Option<EntityId>,
    /// Literal link target text.
    pub to_name: String,
    /// Active-voice verb phrase.
    pub relation_type: String,
    /// Optional context annotation.
    pub context: Option<String>,
}

impl NewRelation {
    /// Builds an unresolved relation row from a parsed spec.
    #[must_use]
    pub fn unresolved(spec: &RelationSpec) -> Self {
        Self {
            to_id: None,
            to_name: spec.target.clone(),
            relation_type: spec.relation_type.clone(),
            context: spec.context.clone(),
        }
    }
}

/// Result of a store upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// The stored entity with identity.
    pub entity: Entity,
    /// True if a new row was inserted.
    pub created: bool,
    /// True if the requested permalink was taken and a suffix was appended.
    pub permalink_disambiguated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(from: i64, to: Option<i64>) -> Relation {
        Relation {
            id: 1,
            from_id: EntityId::new(from),
            to_id: to.map(EntityId::new),
            to_name: "b".to_string(),
            relation_type: "relates_to".to_string(),
            context: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_relation_resolution_state() {
        assert!(!relation(1, Some(2)).is_unresolved());
        assert!(relation(1, None).is_unresolved());
    }

    #[test]
    fn test_observation_permalink() {
        let obs = Observation {
            id: 1,
            entity_id: EntityId::new(1),
            category: "tech".to_string(),
            content: "Uses SQLite".to_string(),
            context: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        };
        assert_eq!(
            obs.permalink("specs/search"),
            "specs/search/observations/tech/uses-sqlite"
        );
    }

    #[test]
    fn test_entity_id_serializes_as_integer() {
        let json = serde_json::to_string(&EntityId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
