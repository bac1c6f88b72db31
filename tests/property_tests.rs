//! Property-based tests for permalinks and note round-trips.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Permalink generation is idempotent
//! - Permalinks use a restricted alphabet with clean segments
//! - Rendered notes parse back to the same items
//! - The parser never panics and keeps the body verbatim

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use notegraph::models::{Frontmatter, ObservationSpec, RelationSpec};
use notegraph::services::parse_document;
use notegraph::services::writer::{render_body, render_document};
use notegraph::generate_permalink;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn observation_strategy() -> impl Strategy<Value = ObservationSpec> {
    ("[a-z]{2,10}", "[A-Za-z][A-Za-z0-9 ,.]{0,30}[A-Za-z0-9]")
        .prop_map(|(category, content)| ObservationSpec::new(category, content))
}

fn relations_strategy() -> impl Strategy<Value = Vec<RelationSpec>> {
    prop::collection::btree_set(
        ("[a-z]{2,8}(_[a-z]{2,8})?", "[A-Z][a-z]{0,10}( [A-Z][a-z]{0,10})?"),
        0..6,
    )
    .prop_map(|set: BTreeSet<(String, String)>| {
        set.into_iter()
            .map(|(relation_type, target)| RelationSpec::new(relation_type, target))
            .collect()
    })
}

proptest! {
    /// Property: permalinks are fixed points of permalink generation.
    #[test]
    fn prop_permalink_is_idempotent(input in "[A-Za-z0-9 _./'éüßç-]{0,60}") {
        let once = generate_permalink(&input);
        prop_assert_eq!(generate_permalink(&once), once.clone());
    }

    /// Property: ASCII input yields lowercase ASCII segments without stray hyphens.
    #[test]
    fn prop_permalink_alphabet(input in "[ -~]{0,80}") {
        let permalink = generate_permalink(&input);
        prop_assume!(!permalink.is_empty());
        prop_assert!(permalink
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '/'));
        for segment in permalink.split('/') {
            prop_assert!(!segment.is_empty());
            prop_assert!(!segment.starts_with('-') && !segment.ends_with('-'));
            prop_assert!(!segment.contains("--"));
        }
    }

    /// Property: a rendered note parses back to its title, observations and relations.
    #[test]
    fn prop_render_parse_roundtrip(
        title in "[A-Z][a-z]{0,12}( [A-Z][a-z]{0,12})?",
        prose in "[a-z]{1,8}( [a-z]{1,8}){0,8}",
        observations in prop::collection::vec(observation_strategy(), 0..6),
        relations in relations_strategy(),
    ) {
        let free_text = format!("# {title}\n\n{prose}\n");
        let body = render_body(&free_text, &observations, &relations);
        let frontmatter = Frontmatter {
            title: Some(title.clone()),
            ..Frontmatter::default()
        };
        let note = render_document(&frontmatter, &body).unwrap();

        let parsed = parse_document(&note);
        prop_assert!(parsed.warnings.is_empty());
        prop_assert_eq!(parsed.frontmatter.title.as_deref(), Some(title.as_str()));
        prop_assert_eq!(&parsed.body, &body);
        prop_assert_eq!(&parsed.free_text, &free_text);
        prop_assert_eq!(parsed.observations, observations);
        prop_assert_eq!(parsed.relations, relations);
    }

    /// Property: parsing arbitrary text never panics and keeps text without
    /// frontmatter as the body.
    #[test]
    fn prop_parse_never_panics(text in any::<String>()) {
        let parsed = parse_document(&text);
        if !text.starts_with("---") {
            prop_assert_eq!(parsed.body, text);
        }
    }
}
