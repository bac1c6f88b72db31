//! Note parsing.
//!
//! Turns raw note text into a [`ParsedDocument`]:
//!
//! ```text
//! ---
//! title: Search Design
//! type: spec
//! ---
//! # Search Design
//!
//! - [decision] Use FTS5 for ranking #search (simpler than a sidecar)
//! - implements [[Search Requirements]]
//! - [ ] not an observation
//!
//! See also [[Indexing Notes]].
//! ```
//!
//! Parsing never fails. Malformed frontmatter degrades to empty metadata
//! and a warning on the document.

use crate::models::{
    DEFAULT_ENTITY_TYPE, DEFAULT_OBSERVATION_CATEGORY, DEFAULT_RELATION_TYPE, Frontmatter,
    LINKS_TO, MARKDOWN_CONTENT_TYPE, NewEntity, ObservationSpec, ParsedDocument, RelationSpec,
};
use crate::services::permalink::{generate_permalink, normalize_entity_type};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

/// Frontmatter delimiter line.
pub const FRONTMATTER_DELIMITER: &str = "---";

/// Heading of the generated observation section.
pub const OBSERVATIONS_HEADING: &str = "## Observations";

/// Heading of the generated relation section.
pub const RELATIONS_HEADING: &str = "## Relations";

/// Permalink used when a path yields no usable characters.
const FALLBACK_PERMALINK: &str = "untitled";

/// `#tag` tokens at a word start.
static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)#([\p{L}\p{N}_][\p{L}\p{N}_/-]*)").unwrap_or_else(|_| unreachable!())
});

/// Checkbox list item markers.
static CHECKBOX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[ xX-]\](?:\s|$)").unwrap_or_else(|_| unreachable!()));

/// Result of splitting frontmatter from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontmatterSplit<'a> {
    /// Raw YAML between the delimiters, if a complete block was found.
    pub yaml: Option<&'a str>,
    /// Everything after the closing delimiter line.
    pub body: &'a str,
}

/// Splits a leading `---` block from the text.
///
/// The opening line must be exactly `---`. Without a closing `---` line
/// the whole text is body.
#[must_use]
pub fn split_frontmatter(text: &str) -> FrontmatterSplit<'_> {
    let no_frontmatter = FrontmatterSplit {
        yaml: None,
        body: text,
    };
    let Some(first_end) = text.find('\n') else {
        return no_frontmatter;
    };
    if text[..first_end].trim_end_matches('\r') != FRONTMATTER_DELIMITER {
        return no_frontmatter;
    }
    let yaml_start = first_end + 1;
    let mut offset = yaml_start;
    for line in text[yaml_start..].split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == FRONTMATTER_DELIMITER {
            return FrontmatterSplit {
                yaml: Some(&text[yaml_start..offset]),
                body: &text[offset + line.len()..],
            };
        }
        offset += line.len();
    }
    no_frontmatter
}

/// Parses frontmatter YAML into typed fields.
///
/// Returns an error message instead of failing when the YAML is invalid or
/// is not a mapping.
pub fn parse_frontmatter(yaml: &str) -> std::result::Result<Frontmatter, String> {
    if yaml.trim().is_empty() {
        return Ok(Frontmatter::default());
    }
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("invalid frontmatter: {e}"))?;
    match value {
        serde_yaml_ng::Value::Mapping(mapping) => Ok(Frontmatter::from_mapping(mapping)),
        serde_yaml_ng::Value::Null => Ok(Frontmatter::default()),
        _ => Err("invalid frontmatter: expected a mapping".to_string()),
    }
}

fn is_managed_heading(line: &str) -> bool {
    let line = line.trim_end();
    line == OBSERVATIONS_HEADING || line == RELATIONS_HEADING
}

fn is_list_item(line: &str) -> bool {
    let line = line.trim_start();
    line == "-" || line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ")
}

/// Splits the body into free text and the trailing generated sections.
///
/// The generated region starts at the first `## Observations` or
/// `## Relations` heading after which only list items, blank lines and
/// those headings follow. One newline separating the free text from the
/// region belongs to the region.
#[must_use]
pub fn split_managed_sections(body: &str) -> (&str, &str) {
    let lines: Vec<(usize, &str)> = body
        .split_inclusive('\n')
        .scan(0usize, |offset, line| {
            let start = *offset;
            *offset += line.len();
            Some((start, line))
        })
        .collect();

    let mut tail_start = lines.len();
    while tail_start > 0 {
        let line = lines[tail_start - 1].1.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || is_list_item(line) || is_managed_heading(line) {
            tail_start -= 1;
        } else {
            break;
        }
    }

    let Some(&(start, _)) = lines[tail_start..]
        .iter()
        .find(|(_, line)| is_managed_heading(line.trim_end_matches(['\r', '\n'])))
    else {
        return (body, "");
    };

    let free = &body[..start];
    let free = free.strip_suffix('\n').unwrap_or(free);
    (free, &body[start..])
}

/// Returns `[[...]]` spans as `(start, end, inner)`, outermost only.
///
/// `start..end` covers the brackets; unbalanced openers are ignored.
#[must_use]
pub fn find_wiki_links(text: &str) -> Vec<(usize, usize, &str)> {
    let bytes = text.as_bytes();
    let mut links = Vec::new();
    let mut depth = 0usize;
    let mut open = 0usize;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            if depth == 0 {
                open = i;
            }
            depth += 1;
            i += 2;
        } else if bytes[i] == b']' && bytes[i + 1] == b']' && depth > 0 {
            depth -= 1;
            i += 2;
            if depth == 0 {
                links.push((open, i, &text[open + 2..i - 2]));
            }
        } else {
            i += 1;
        }
    }
    links
}

/// Normalizes a link's inner text to a target name.
///
/// `[[target|label]]` links to `target`.
fn link_target(inner: &str) -> Option<String> {
    let target = inner.split('|').next().unwrap_or(inner).trim();
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

/// Splits a trailing ` (context)` from text.
///
/// The opening parenthesis must start the text or follow whitespace, so
/// `call(arg)` stays content.
fn split_context(text: &str) -> (&str, Option<&str>) {
    let text = text.trim_end();
    if !text.ends_with(')') {
        return (text, None);
    }
    let mut depth = 0i32;
    for (i, c) in text.char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    let before = &text[..i];
                    if !before.is_empty() && !before.ends_with(char::is_whitespace) {
                        return (text, None);
                    }
                    let context = text[i + 1..text.len() - 1].trim();
                    let content = before.trim_end();
                    if context.is_empty() {
                        return (content, None);
                    }
                    return (content, Some(context));
                }
            },
            _ => {},
        }
    }
    (text, None)
}

/// Extracts `#tag` tokens, without the `#`, in order of first appearance.
#[must_use]
pub fn extract_tags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    TAG_PATTERN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(['/', '-']).to_string())
        .filter(|tag| !tag.is_empty() && seen.insert(tag.clone()))
        .collect()
}

/// Removes inline code spans so links inside them are ignored.
fn strip_inline_code(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_code = false;
    for c in line.chars() {
        if c == '`' {
            in_code = !in_code;
            out.push(' ');
        } else if in_code {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

/// Classification of one list item.
enum ListItem {
    Observation(ObservationSpec),
    Relation(RelationSpec),
    Other,
}

fn classify_item(item: &str) -> ListItem {
    let item = item.trim();
    if CHECKBOX_PATTERN.is_match(item) {
        return ListItem::Other;
    }

    if item.starts_with('[') && !item.starts_with("[[") {
        if let Some(close) = item.find(']') {
            let category = item[1..close].trim();
            let rest = item[close + 1..].trim();
            if !rest.is_empty() {
                let category = if category.is_empty() {
                    DEFAULT_OBSERVATION_CATEGORY
                } else {
                    category
                };
                return ListItem::Observation(observation(category, rest));
            }
        }
        return ListItem::Other;
    }

    if let Some(&(start, end, inner)) = find_wiki_links(item).first() {
        let Some(target) = link_target(inner) else {
            return ListItem::Other;
        };
        let prefix = item[..start].trim();
        let relation_type = if prefix.is_empty() {
            DEFAULT_RELATION_TYPE
        } else {
            prefix
        };
        let (_, context) = split_context(&item[end..]);
        let mut spec = RelationSpec::new(relation_type, target);
        spec.context = context.map(str::to_string);
        return ListItem::Relation(spec);
    }

    if extract_tags(item).is_empty() {
        ListItem::Other
    } else {
        ListItem::Observation(observation(DEFAULT_OBSERVATION_CATEGORY, item))
    }
}

fn observation(category: &str, text: &str) -> ObservationSpec {
    let (content, context) = split_context(text);
    let content = if content.is_empty() { text } else { content };
    let mut spec = ObservationSpec::new(category, content).with_tags(extract_tags(content));
    spec.context = context.map(str::to_string);
    spec
}

fn list_item_text(line: &str) -> Option<&str> {
    let line = line.trim_start();
    ["- ", "* ", "+ "]
        .iter()
        .find_map(|marker| line.strip_prefix(marker))
}

/// Extracts observations and relations from body text.
///
/// Explicit relation items yield their typed relation; every other
/// `[[link]]` outside fenced code yields a `links_to` relation. Relations
/// are deduplicated on `(type, target)`, first occurrence wins.
#[must_use]
pub fn extract_items(body: &str) -> (Vec<ObservationSpec>, Vec<RelationSpec>) {
    let mut observations = Vec::new();
    let mut relations: Vec<RelationSpec> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut fence: Option<&str> = None;

    let mut push_relation = |spec: RelationSpec, relations: &mut Vec<RelationSpec>| {
        if seen.insert((spec.relation_type.clone(), spec.target.clone())) {
            relations.push(spec);
        }
    };

    for raw_line in body.lines() {
        let trimmed = raw_line.trim_start();
        if let Some(marker) = fence {
            if trimmed.starts_with(marker) {
                fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            fence = Some("```");
            continue;
        }
        if trimmed.starts_with("~~~") {
            fence = Some("~~~");
            continue;
        }

        let line = strip_inline_code(raw_line);
        let mut explicit_span = None;

        if let Some(item) = list_item_text(&line) {
            match classify_item(item) {
                ListItem::Observation(spec) => observations.push(spec),
                ListItem::Relation(spec) => {
                    let offset = line.len() - item.len();
                    explicit_span = find_wiki_links(item)
                        .first()
                        .map(|&(start, end, _)| (offset + start, offset + end));
                    push_relation(spec, &mut relations);
                },
                ListItem::Other => {},
            }
        }

        for (start, end, inner) in find_wiki_links(&line) {
            if explicit_span == Some((start, end)) {
                continue;
            }
            if let Some(target) = link_target(inner) {
                push_relation(RelationSpec::new(LINKS_TO, target), &mut relations);
            }
        }
    }

    (observations, relations)
}

/// Parses raw note text. Never fails.
#[must_use]
pub fn parse_document(text: &str) -> ParsedDocument {
    let split = split_frontmatter(text);
    let mut warnings = Vec::new();
    let frontmatter = match split.yaml {
        Some(yaml) => parse_frontmatter(yaml).unwrap_or_else(|warning| {
            warnings.push(warning);
            Frontmatter::default()
        }),
        None => {
            if text.starts_with(FRONTMATTER_DELIMITER)
                && text.lines().next().map(str::trim_end) == Some(FRONTMATTER_DELIMITER)
            {
                warnings.push("frontmatter is missing its closing delimiter".to_string());
            }
            Frontmatter::default()
        },
    };

    let body = split.body;
    let (free_text, _) = split_managed_sections(body);
    let (observations, relations) = extract_items(body);

    ParsedDocument {
        frontmatter,
        body: body.to_string(),
        free_text: free_text.to_string(),
        observations,
        relations,
        warnings,
    }
}

/// Returns true if the path names a markdown note.
#[must_use]
pub fn is_markdown_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
}

/// Returns the content type for a project-relative path.
#[must_use]
pub fn content_type_for(path: &str) -> String {
    if is_markdown_path(path) {
        MARKDOWN_CONTENT_TYPE.to_string()
    } else {
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Derives the permalink of a markdown note at `path`.
#[must_use]
pub fn permalink_for_path(path: &str) -> String {
    let permalink = generate_permalink(path);
    if permalink.is_empty() {
        FALLBACK_PERMALINK.to_string()
    } else {
        permalink
    }
}

/// Builds the entity fields for a parsed markdown note.
#[must_use]
pub fn entity_from_document(
    document: &ParsedDocument,
    file_path: &str,
    checksum: Option<String>,
) -> NewEntity {
    let fm = &document.frontmatter;
    let title = fm.title.clone().unwrap_or_else(|| file_stem(file_path));
    let entity_type = fm
        .entity_type
        .as_deref()
        .map_or_else(|| DEFAULT_ENTITY_TYPE.to_string(), normalize_entity_type);
    let permalink = fm
        .permalink
        .as_deref()
        .map(generate_permalink)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| permalink_for_path(file_path));

    let mut metadata = fm.extra.clone();
    if !fm.tags.is_empty() {
        metadata.insert("tags".to_string(), serde_json::json!(fm.tags));
    }

    NewEntity {
        title,
        entity_type,
        content_type: MARKDOWN_CONTENT_TYPE.to_string(),
        permalink: Some(permalink),
        file_path: file_path.to_string(),
        checksum,
        metadata,
    }
}

/// Builds the entity fields for a non-markdown file.
#[must_use]
pub fn entity_for_binary(file_path: &str, checksum: Option<String>) -> NewEntity {
    NewEntity {
        title: Path::new(file_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(file_path)
            .to_string(),
        entity_type: "file".to_string(),
        content_type: content_type_for(file_path),
        permalink: None,
        file_path: file_path.to_string(),
        checksum,
        metadata: std::collections::BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_split_frontmatter() {
        let split = split_frontmatter("---\ntitle: A\n---\n\n# A\n");
        assert_eq!(split.yaml, Some("title: A\n"));
        assert_eq!(split.body, "\n# A\n");
    }

    #[test]
    fn test_split_frontmatter_crlf() {
        let split = split_frontmatter("---\r\ntitle: A\r\n---\r\nbody");
        assert_eq!(split.yaml, Some("title: A\r\n"));
        assert_eq!(split.body, "body");
    }

    #[test]
    fn test_no_frontmatter() {
        let split = split_frontmatter("# Heading\n---\nmore");
        assert!(split.yaml.is_none());
        assert_eq!(split.body, "# Heading\n---\nmore");
    }

    #[test]
    fn test_malformed_frontmatter_degrades() {
        let doc = parse_document("---\ntitle: [unclosed\n---\nBody with [[Link]]\n");
        assert!(doc.frontmatter.is_empty());
        assert!(doc.has_warnings());
        assert_eq!(doc.body, "Body with [[Link]]\n");
        assert_eq!(doc.relations, vec![RelationSpec::new(LINKS_TO, "Link")]);
    }

    #[test]
    fn test_unclosed_frontmatter_is_body() {
        let doc = parse_document("---\ntitle: A\nno closing\n");
        assert!(doc.frontmatter.is_empty());
        assert!(doc.has_warnings());
        assert_eq!(doc.body, "---\ntitle: A\nno closing\n");
    }

    #[test]
    fn test_observation_shapes() {
        let (obs, rels) = extract_items(
            "- [tech] Uses SQLite #db #storage (chosen for portability)\n\
             - [idea] call(arg)\n\
             - plain bullet\n\
             - tagged only #todo\n",
        );
        assert!(rels.is_empty());
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].category, "tech");
        assert_eq!(obs[0].content, "Uses SQLite #db #storage");
        assert_eq!(obs[0].tags, vec!["db", "storage"]);
        assert_eq!(obs[0].context.as_deref(), Some("chosen for portability"));
        assert_eq!(obs[1].content, "call(arg)");
        assert!(obs[1].context.is_none());
        assert_eq!(obs[2].category, DEFAULT_OBSERVATION_CATEGORY);
        assert_eq!(obs[2].tags, vec!["todo"]);
    }

    #[test_case("- [ ] write tests #todo"; "unchecked")]
    #[test_case("- [x] write tests #todo"; "checked")]
    #[test_case("- [X] write tests"; "checked upper")]
    #[test_case("- [-] cancelled"; "cancelled")]
    fn test_checkbox_is_never_an_observation(line: &str) {
        let (obs, _) = extract_items(line);
        assert!(obs.is_empty());
    }

    #[test]
    fn test_explicit_relation() {
        let (obs, rels) = extract_items("- implements [[Search Spec]] (phase one)\n");
        assert!(obs.is_empty());
        assert_eq!(
            rels,
            vec![RelationSpec::new("implements", "Search Spec").with_context("phase one")]
        );
    }

    #[test]
    fn test_relation_without_verb_defaults() {
        let (_, rels) = extract_items("- [[Other]]\n");
        assert_eq!(rels, vec![RelationSpec::new(DEFAULT_RELATION_TYPE, "Other")]);
    }

    #[test]
    fn test_category_wins_over_link() {
        let (obs, rels) = extract_items("- [tech] depends on [[SQLite]]\n");
        assert_eq!(obs.len(), 1);
        assert_eq!(rels, vec![RelationSpec::new(LINKS_TO, "SQLite")]);
    }

    #[test]
    fn test_inline_links_anywhere() {
        let (_, rels) = extract_items(
            "Intro mentions [[A]] and [[B|the b note]].\n\n- relates_to [[C]] see [[D]]\n",
        );
        assert_eq!(
            rels,
            vec![
                RelationSpec::new(LINKS_TO, "A"),
                RelationSpec::new(LINKS_TO, "B"),
                RelationSpec::new("relates_to", "C"),
                RelationSpec::new(LINKS_TO, "D"),
            ]
        );
    }

    #[test]
    fn test_nested_links_use_outermost_span() {
        let links = find_wiki_links("x [[A [[B]] C]] y");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].2, "A [[B]] C");
    }

    #[test]
    fn test_duplicate_relations_are_dropped() {
        let (_, rels) = extract_items("[[A]] and [[A]]\n- links_to [[A]]\n");
        assert_eq!(rels, vec![RelationSpec::new(LINKS_TO, "A")]);
    }

    #[test]
    fn test_fenced_code_is_skipped() {
        let (obs, rels) = extract_items(
            "```md\n- [tech] not real\n[[NotALink]]\n```\n- [tech] real\n`[[inline]]`\n",
        );
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].content, "real");
        assert!(rels.is_empty());
    }

    #[test]
    fn test_split_managed_sections() {
        let body = "# A\n\nText.\n\n## Observations\n- [a] b\n\n## Relations\n- x [[Y]]\n";
        let (free, sections) = split_managed_sections(body);
        assert_eq!(free, "# A\n\nText.\n");
        assert!(sections.starts_with(OBSERVATIONS_HEADING));
    }

    #[test]
    fn test_managed_heading_followed_by_prose_is_free_text() {
        let body = "## Observations\nThis is prose, not a list.\n";
        let (free, sections) = split_managed_sections(body);
        assert_eq!(free, body);
        assert_eq!(sections, "");
    }

    #[test]
    fn test_entity_from_document_defaults() {
        let doc = parse_document("# Body\n");
        let entity = entity_from_document(&doc, "notes/Draft Plan.md", None);
        assert_eq!(entity.title, "Draft Plan");
        assert_eq!(entity.entity_type, DEFAULT_ENTITY_TYPE);
        assert_eq!(entity.permalink.as_deref(), Some("notes/draft-plan"));
        assert_eq!(entity.content_type, MARKDOWN_CONTENT_TYPE);
    }

    #[test]
    fn test_entity_from_document_frontmatter() {
        let doc = parse_document(
            "---\ntitle: Search\ntype: Tech Spec\npermalink: specs/Search\nstatus: draft\n---\n",
        );
        let entity = entity_from_document(&doc, "x.md", Some("abc".into()));
        assert_eq!(entity.title, "Search");
        assert_eq!(entity.entity_type, "tech_spec");
        assert_eq!(entity.permalink.as_deref(), Some("specs/search"));
        assert_eq!(entity.metadata["status"], serde_json::json!("draft"));
        assert_eq!(entity.checksum.as_deref(), Some("abc"));
    }

    #[test_case("notes/a.md", "text/markdown"; "md")]
    #[test_case("notes/a.MARKDOWN", "text/markdown"; "markdown upper")]
    #[test_case("img/logo.png", "image/png"; "png")]
    #[test_case("data/blob", "application/octet-stream"; "unknown")]
    fn test_content_type_for(path: &str, expected: &str) {
        assert_eq!(content_type_for(path), expected);
    }
}
