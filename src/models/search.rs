//! Full-text search rows and hits.

use crate::models::graph::EntityId;
use serde::{Deserialize, Serialize};

/// Kind of row in the full-text index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchItemKind {
    /// An entity's title and body.
    Entity,
    /// One observation.
    Observation,
    /// One relation.
    Relation,
}

impl SearchItemKind {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Observation => "observation",
            Self::Relation => "relation",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(Self::Entity),
            "observation" => Some(Self::Observation),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }
}

/// One row to write into the full-text index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDocument {
    /// Row kind.
    pub kind: SearchItemKind,
    /// Entity the row belongs to.
    pub entity_id: EntityId,
    /// Permalink of the row (derived for observations and relations).
    pub permalink: String,
    /// Title shown in results.
    pub title: String,
    /// Searchable text.
    pub content: String,
    /// Project-relative file of the owning entity.
    pub file_path: String,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Row kind.
    pub kind: SearchItemKind,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Permalink of the row.
    pub permalink: String,
    /// Title.
    pub title: String,
    /// Owning file.
    pub file_path: String,
    /// Normalized relevance in `(0, 1)`, higher is better.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            SearchItemKind::Entity,
            SearchItemKind::Observation,
            SearchItemKind::Relation,
        ] {
            assert_eq!(SearchItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SearchItemKind::parse("memory"), None);
    }
}
