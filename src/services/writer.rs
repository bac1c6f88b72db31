//! Document rendering and checksum-guarded atomic writes.
//!
//! The writer is the only code that modifies note files. Every write is
//! staged in a temporary file in the target directory and renamed over the
//! target, so readers never observe a partial file. A caller that passes the
//! checksum it last read gets [`Error::DirtyFile`] instead of clobbering an
//! external edit.

use crate::models::{Frontmatter, ObservationSpec, RelationSpec};
use crate::services::parser::{
    FRONTMATTER_DELIMITER, OBSERVATIONS_HEADING, RELATIONS_HEADING, extract_items,
};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Computes the hex SHA-256 checksum of file content.
#[must_use]
pub fn compute_checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Renders one observation as a list item.
#[must_use]
pub fn render_observation(observation: &ObservationSpec) -> String {
    let mut line = format!("- [{}] {}", observation.category, observation.content.trim());
    let present: HashSet<String> = crate::services::parser::extract_tags(&observation.content)
        .into_iter()
        .collect();
    for tag in &observation.tags {
        if !present.contains(tag) {
            line.push_str(" #");
            line.push_str(tag);
        }
    }
    if let Some(context) = &observation.context {
        line.push_str(" (");
        line.push_str(context);
        line.push(')');
    }
    line
}

/// Renders one relation as a list item.
#[must_use]
pub fn render_relation(relation: &RelationSpec) -> String {
    let mut line = format!("- {} [[{}]]", relation.relation_type, relation.target);
    if let Some(context) = &relation.context {
        line.push_str(" (");
        line.push_str(context);
        line.push(')');
    }
    line
}

/// Renders the generated sections for items not already in `free_text`.
#[must_use]
pub fn render_sections(
    free_text: &str,
    observations: &[ObservationSpec],
    relations: &[RelationSpec],
) -> String {
    let (inline_observations, inline_relations) = extract_items(free_text);
    let inline_observations: HashSet<&ObservationSpec> = inline_observations.iter().collect();
    let inline_relations: HashSet<(&str, &str)> = inline_relations
        .iter()
        .map(|r| (r.relation_type.as_str(), r.target.as_str()))
        .collect();

    let observation_lines: Vec<String> = observations
        .iter()
        .filter(|o| !inline_observations.contains(o))
        .map(render_observation)
        .collect();

    let mut seen = HashSet::new();
    let relation_lines: Vec<String> = relations
        .iter()
        .filter(|r| !inline_relations.contains(&(r.relation_type.as_str(), r.target.as_str())))
        .filter(|r| seen.insert((r.relation_type.as_str(), r.target.as_str())))
        .map(render_relation)
        .collect();

    let mut out = String::new();
    if !observation_lines.is_empty() {
        out.push_str(OBSERVATIONS_HEADING);
        out.push('\n');
        for line in &observation_lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !relation_lines.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(RELATIONS_HEADING);
        out.push('\n');
        for line in &relation_lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Renders a body from free text and structured items.
///
/// Free text is emitted byte-for-byte; one newline separates it from the
/// generated sections.
#[must_use]
pub fn render_body(
    free_text: &str,
    observations: &[ObservationSpec],
    relations: &[RelationSpec],
) -> String {
    let sections = render_sections(free_text, observations, relations);
    if sections.is_empty() {
        return free_text.to_string();
    }
    if free_text.is_empty() {
        return sections;
    }
    format!("{free_text}\n{sections}")
}

/// Renders a complete note: frontmatter block (if any) followed by the body.
pub fn render_document(frontmatter: &Frontmatter, body: &str) -> Result<String> {
    if frontmatter.is_empty() {
        return Ok(body.to_string());
    }
    let yaml = serde_yaml_ng::to_string(&frontmatter.to_mapping())
        .map_err(|e| Error::operation("serialize_frontmatter", e))?;
    Ok(format!(
        "{FRONTMATTER_DELIMITER}\n{yaml}{FRONTMATTER_DELIMITER}\n{body}"
    ))
}

/// Synthesizes a `# title` heading when the body does not start with one.
#[must_use]
pub fn ensure_heading(title: &str, body: &str) -> String {
    let first = body.lines().find(|line| !line.trim().is_empty());
    if first.is_some_and(|line| line.trim_start().starts_with("# ")) {
        body.to_string()
    } else if body.trim().is_empty() {
        format!("# {title}\n")
    } else {
        format!("# {title}\n\n{}", body.trim_start_matches(['\r', '\n']))
    }
}

/// Writes note files under a project root.
#[derive(Debug, Clone)]
pub struct DocumentWriter {
    root: PathBuf,
}

impl DocumentWriter {
    /// Creates a writer for a project directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a project-relative path, rejecting escapes from the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = relative.trim_start_matches('/');
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir
                    | std::path::Component::RootDir
                    | std::path::Component::Prefix(_)
            )
        });
        if relative.is_empty() || escapes {
            return Err(Error::InvalidInput(format!(
                "path '{relative}' is outside the project"
            )));
        }
        Ok(self.root.join(path))
    }

    /// Returns the checksum of the file on disk, or `None` if it is absent.
    pub fn current_checksum(&self, relative: &str) -> Result<Option<String>> {
        let path = self.resolve(relative)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(compute_checksum(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::operation("read_file", format!("{}: {e}", path.display()))),
        }
    }

    /// Writes `content` to `relative` and returns the new checksum.
    ///
    /// With `expected_checksum`, the write only happens if the file on disk
    /// still has that checksum. A missing file never matches an expected
    /// checksum.
    #[instrument(skip(self, content), fields(operation = "write_document", path = %relative))]
    pub fn write(
        &self,
        relative: &str,
        content: &str,
        expected_checksum: Option<&str>,
    ) -> Result<String> {
        let target = self.resolve(relative)?;

        if let Some(expected) = expected_checksum {
            let actual = self.current_checksum(relative)?;
            if actual.as_deref() != Some(expected) {
                metrics::counter!("notegraph_write_conflicts_total").increment(1);
                tracing::warn!(
                    path = relative,
                    expected,
                    actual = actual.as_deref().unwrap_or("<missing>"),
                    "refusing to overwrite externally modified file"
                );
                return Err(Error::DirtyFile {
                    path: relative.to_string(),
                    expected: expected.to_string(),
                    actual: actual.unwrap_or_default(),
                });
            }
        }

        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("path '{relative}' has no parent")))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::operation("create_dir", format!("{}: {e}", parent.display())))?;

        let mut staged = tempfile::Builder::new()
            .prefix(".notegraph-")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| Error::operation("stage_write", e))?;
        staged
            .write_all(content.as_bytes())
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| Error::operation("stage_write", e))?;
        staged
            .persist(&target)
            .map_err(|e| Error::operation("persist_write", e.error))?;

        let checksum = compute_checksum(content.as_bytes());
        tracing::debug!(path = relative, checksum = %checksum, "wrote document");
        Ok(checksum)
    }

    /// Removes a file; returns false if it did not exist.
    pub fn remove(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::operation("remove_file", format!("{}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::parser::parse_document;
    use tempfile::TempDir;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            compute_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_write_without_precondition_creates_file() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        let checksum = writer.write("notes/a.md", "hello", None).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes/a.md")).unwrap(),
            "hello"
        );
        assert_eq!(checksum, compute_checksum(b"hello"));
    }

    #[test]
    fn test_stale_checksum_is_rejected_and_file_untouched() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        let first = writer.write("a.md", "v1", None).unwrap();
        std::fs::write(dir.path().join("a.md"), "edited elsewhere").unwrap();

        let err = writer.write("a.md", "v2", Some(&first)).unwrap_err();
        assert!(matches!(err, Error::DirtyFile { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.md")).unwrap(),
            "edited elsewhere"
        );
    }

    #[test]
    fn test_current_checksum_allows_write() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        let first = writer.write("a.md", "v1", None).unwrap();
        let second = writer.write("a.md", "v2", Some(&first)).unwrap();
        assert_eq!(second, compute_checksum(b"v2"));
    }

    #[test]
    fn test_expected_checksum_on_missing_file_conflicts() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        let err = writer.write("gone.md", "x", Some("abc")).unwrap_err();
        assert!(matches!(err, Error::DirtyFile { ref actual, .. } if actual.is_empty()));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        writer.write("a.md", "x", None).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md"]);
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let writer = DocumentWriter::new("/tmp/project");
        assert!(writer.resolve("../etc/passwd").is_err());
        assert!(writer.resolve("").is_err());
        assert!(writer.resolve("notes/a.md").is_ok());
    }

    #[test]
    fn test_ensure_heading() {
        assert_eq!(ensure_heading("A", ""), "# A\n");
        assert_eq!(ensure_heading("A", "text\n"), "# A\n\ntext\n");
        assert_eq!(ensure_heading("A", "\n# Existing\n"), "\n# Existing\n");
    }

    #[test]
    fn test_render_body_keeps_free_text_and_skips_inline_items() {
        let free = "# A\n\n- [tech] inline fact\nSee [[B]].\n";
        let observations = vec![
            ObservationSpec::new("tech", "inline fact"),
            ObservationSpec::new("idea", "new one").with_tags(["x"]),
        ];
        let relations = vec![
            RelationSpec::new("links_to", "B"),
            RelationSpec::new("implements", "C").with_context("v1"),
        ];
        let body = render_body(free, &observations, &relations);
        assert_eq!(
            body,
            "# A\n\n- [tech] inline fact\nSee [[B]].\n\n## Observations\n- [idea] new one #x\n\n## Relations\n- implements [[C]] (v1)\n"
        );

        let reparsed = parse_document(&body);
        assert_eq!(reparsed.free_text, free);
        assert_eq!(reparsed.observations.len(), 2);
        assert_eq!(reparsed.relations.len(), 2);
    }

    #[test]
    fn test_render_document_with_frontmatter() {
        let fm = Frontmatter {
            title: Some("A".into()),
            entity_type: Some("note".into()),
            ..Frontmatter::default()
        };
        let text = render_document(&fm, "# A\n").unwrap();
        assert_eq!(text, "---\ntitle: A\ntype: note\n---\n# A\n");
        let parsed = parse_document(&text);
        assert_eq!(parsed.frontmatter, fm);
        assert_eq!(parsed.body, "# A\n");
    }
}
