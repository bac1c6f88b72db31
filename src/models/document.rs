//! Structured note documents.
//!
//! A note is YAML frontmatter followed by a markdown body. Frontmatter is
//! split into typed known fields and an opaque extension map so that the
//! fields the graph depends on are checked while arbitrary user metadata
//! still round-trips.

use crate::models::graph::{ObservationSpec, RelationSpec};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};
use std::collections::BTreeMap;

/// Known frontmatter keys, in the order they are rendered.
const KNOWN_KEYS: [&str; 6] = ["title", "type", "permalink", "tags", "created", "modified"];

/// Typed frontmatter: known fields plus an extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    /// Note title.
    pub title: Option<String>,
    /// Entity type (`type:` key).
    pub entity_type: Option<String>,
    /// Explicit permalink.
    pub permalink: Option<String>,
    /// Tags, from a YAML list or a comma-separated string.
    pub tags: Vec<String>,
    /// Creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Last modification timestamp.
    pub modified: Option<DateTime<Utc>>,
    /// Every other key, and known keys whose values did not type-check.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Frontmatter {
    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.entity_type.is_none()
            && self.permalink.is_none()
            && self.tags.is_empty()
            && self.created.is_none()
            && self.modified.is_none()
            && self.extra.is_empty()
    }

    /// Builds typed frontmatter from a parsed YAML mapping.
    ///
    /// Known keys with values of the wrong shape are kept in `extra` rather
    /// than dropped, so nothing the user wrote is lost.
    #[must_use]
    pub fn from_mapping(mapping: Mapping) -> Self {
        let mut fm = Self::default();
        for (key, value) in mapping {
            let key = match key {
                Value::String(s) => s,
                other => yaml_scalar_to_string(&other).unwrap_or_default(),
            };
            if key.is_empty() {
                continue;
            }
            let leftover = match key.as_str() {
                "title" => set_string(&mut fm.title, value),
                "type" => set_string(&mut fm.entity_type, value),
                "permalink" => set_string(&mut fm.permalink, value),
                "tags" => match parse_tags(&value) {
                    Some(tags) => {
                        fm.tags = tags;
                        None
                    },
                    None => Some(value),
                },
                "created" => set_datetime(&mut fm.created, value),
                "modified" => set_datetime(&mut fm.modified, value),
                _ => Some(value),
            };
            if let Some(value) = leftover {
                let json = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                fm.extra.insert(key, json);
            }
        }
        fm
    }

    /// Converts back to a YAML mapping, known keys first.
    #[must_use]
    pub fn to_mapping(&self) -> Mapping {
        let mut mapping = Mapping::new();
        let mut put = |key: &str, value: Value| {
            mapping.insert(Value::String(key.to_string()), value);
        };
        if let Some(title) = &self.title {
            put("title", Value::String(title.clone()));
        }
        if let Some(entity_type) = &self.entity_type {
            put("type", Value::String(entity_type.clone()));
        }
        if let Some(permalink) = &self.permalink {
            put("permalink", Value::String(permalink.clone()));
        }
        if !self.tags.is_empty() {
            put(
                "tags",
                Value::Sequence(self.tags.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(created) = self.created {
            put("created", Value::String(created.to_rfc3339()));
        }
        if let Some(modified) = self.modified {
            put("modified", Value::String(modified.to_rfc3339()));
        }
        for (key, value) in &self.extra {
            if KNOWN_KEYS.contains(&key.as_str()) && self.has_known(key) {
                continue;
            }
            let yaml = serde_yaml_ng::to_value(value).unwrap_or(Value::Null);
            put(key, yaml);
        }
        mapping
    }

    fn has_known(&self, key: &str) -> bool {
        match key {
            "title" => self.title.is_some(),
            "type" => self.entity_type.is_some(),
            "permalink" => self.permalink.is_some(),
            "tags" => !self.tags.is_empty(),
            "created" => self.created.is_some(),
            "modified" => self.modified.is_some(),
            _ => false,
        }
    }
}

fn yaml_scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn set_string(slot: &mut Option<String>, value: Value) -> Option<Value> {
    match yaml_scalar_to_string(&value) {
        Some(s) if !s.trim().is_empty() => {
            *slot = Some(s.trim().to_string());
            None
        },
        _ => Some(value),
    }
}

fn set_datetime(slot: &mut Option<DateTime<Utc>>, value: Value) -> Option<Value> {
    match value.as_str().and_then(parse_datetime) {
        Some(dt) => {
            *slot = Some(dt);
            None
        },
        None => Some(value),
    }
}

fn parse_tags(value: &Value) -> Option<Vec<String>> {
    let clean = |s: &str| s.trim().trim_start_matches('#').to_string();
    match value {
        Value::Sequence(items) => Some(
            items
                .iter()
                .filter_map(yaml_scalar_to_string)
                .map(|s| clean(&s))
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        Value::String(s) => Some(
            s.split([',', ' '])
                .map(clean)
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS`, or `YYYY-MM-DD` as UTC.
#[must_use]
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Output of the content parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    /// Typed frontmatter (empty if absent or malformed).
    pub frontmatter: Frontmatter,
    /// Everything after the frontmatter block, verbatim.
    pub body: String,
    /// The body without the trailing generated observation/relation sections.
    pub free_text: String,
    /// Observations found in list items.
    pub observations: Vec<ObservationSpec>,
    /// Explicit and inline relations.
    pub relations: Vec<RelationSpec>,
    /// Recoverable problems (malformed frontmatter and similar).
    pub warnings: Vec<String>,
}

impl ParsedDocument {
    /// Returns true if the parser had to degrade anything.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A note submitted through the direct write path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    /// Note title; also the file stem.
    pub title: String,
    /// Project-relative folder; empty for the project root.
    #[serde(default)]
    pub folder: String,
    /// Entity type; defaults to `note`.
    #[serde(default)]
    pub entity_type: Option<String>,
    /// Explicit permalink.
    #[serde(default)]
    pub permalink: Option<String>,
    /// Free-text body. `None` keeps the existing body on update.
    #[serde(default)]
    pub content: Option<String>,
    /// Observations to write.
    #[serde(default)]
    pub observations: Vec<ObservationSpec>,
    /// Outgoing relations to write.
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
    /// Tags for the frontmatter.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Extra frontmatter fields.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl EntityDocument {
    /// Creates a document with a title in a folder.
    pub fn new(title: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Sets the free-text body.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Sets the entity type.
    #[must_use]
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Adds an observation.
    #[must_use]
    pub fn with_observation(mut self, observation: ObservationSpec) -> Self {
        self.observations.push(observation);
        self
    }

    /// Adds a relation.
    #[must_use]
    pub fn with_relation(mut self, relation: RelationSpec) -> Self {
        self.relations.push(relation);
        self
    }

    /// Returns the project-relative path this document is written to.
    ///
    /// Path separators in the title are replaced so the title names exactly
    /// one file.
    #[must_use]
    pub fn file_path(&self) -> String {
        let stem = self.title.trim().replace(['/', '\\'], "-");
        let folder = self.folder.trim().trim_matches('/');
        if folder.is_empty() {
            format!("{stem}.md")
        } else {
            format!("{folder}/{stem}.md")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_known_fields_are_typed() {
        let fm = Frontmatter::from_mapping(mapping(
            "title: Search Design\ntype: Spec\npermalink: specs/search\ntags: [a, '#b']\ncreated: 2024-03-01\n",
        ));
        assert_eq!(fm.title.as_deref(), Some("Search Design"));
        assert_eq!(fm.entity_type.as_deref(), Some("Spec"));
        assert_eq!(fm.permalink.as_deref(), Some("specs/search"));
        assert_eq!(fm.tags, vec!["a", "b"]);
        assert_eq!(
            fm.created.map(|d| d.to_rfc3339()),
            Some("2024-03-01T00:00:00+00:00".to_string())
        );
        assert!(fm.extra.is_empty());
    }

    #[test]
    fn test_unknown_and_mistyped_fields_are_kept() {
        let fm = Frontmatter::from_mapping(mapping(
            "title: A\ncreated: not a date\nstatus: draft\nweights: [1, 2]\n",
        ));
        assert!(fm.created.is_none());
        assert_eq!(fm.extra["created"], serde_json::json!("not a date"));
        assert_eq!(fm.extra["status"], serde_json::json!("draft"));
        assert_eq!(fm.extra["weights"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_blank_known_field_survives_round_trip() {
        let fm = Frontmatter::from_mapping(mapping("title: ''\ntype: '  '\n"));
        assert!(fm.title.is_none());
        assert!(fm.entity_type.is_none());
        assert_eq!(fm.extra["title"], serde_json::json!(""));

        let back = fm.to_mapping();
        assert_eq!(back.get("title"), Some(&Value::String(String::new())));
        assert_eq!(back.get("type"), Some(&Value::String("  ".to_string())));
    }

    #[test]
    fn test_tags_from_comma_string() {
        let fm = Frontmatter::from_mapping(mapping("tags: rust, sqlite\n"));
        assert_eq!(fm.tags, vec!["rust", "sqlite"]);
    }

    #[test]
    fn test_mapping_roundtrip() {
        let original = Frontmatter::from_mapping(mapping(
            "title: A\ntype: note\ntags: [x]\nstatus: draft\n",
        ));
        let again = Frontmatter::from_mapping(original.to_mapping());
        assert_eq!(original, again);
    }

    #[test]
    fn test_entity_document_file_path() {
        assert_eq!(EntityDocument::new("Draft", "").file_path(), "Draft.md");
        assert_eq!(
            EntityDocument::new("A/B", "/notes/").file_path(),
            "notes/A-B.md"
        );
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime("2024-01-02T03:04:05Z").is_some());
        assert!(parse_datetime("2024-01-02 03:04:05").is_some());
        assert!(parse_datetime("2024-01-02").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
