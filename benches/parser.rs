//! Benchmarks for permalink generation and note parsing.

// Criterion macros generate items without docs - this is expected for benchmarks
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::fmt::Write as _;
use std::hint::black_box;

use notegraph::services::generate_permalink;
use notegraph::services::parse_document;

const TITLES: &[(&str, &str)] = &[
    ("ascii", "Search Design"),
    ("path", "specs/Search Design/Query Planner v2"),
    ("camel", "HTTPServerConfigLoader"),
    ("accented", "Café Crème Brûlée über alles"),
    ("cjk", "知识图谱 设计 notes"),
];

fn bench_permalink(c: &mut Criterion) {
    let mut group = c.benchmark_group("permalink");
    for (name, title) in TITLES {
        group.bench_with_input(BenchmarkId::from_parameter(name), title, |b, title| {
            b.iter(|| generate_permalink(black_box(title)));
        });
    }
    group.finish();
}

/// Builds a note with `items` observations and as many relations.
fn sample_note(items: usize) -> String {
    let mut note = String::from(
        "---\ntitle: Search Design\ntype: spec\ntags: [search, fts]\n---\n\n\
         # Search Design\n\nThe index is kept in step with [[Graph Store]] by the indexer.\n\n\
         ```rust\n- [ignored] inside a fence\n```\n\n## Observations\n",
    );
    for i in 0..items {
        let _ = writeln!(note, "- [tech] Observation number {i} #tag{i} (from review)");
    }
    note.push_str("\n## Relations\n");
    for i in 0..items {
        let _ = writeln!(note, "- relates_to [[Note {i}]]");
    }
    note
}

fn bench_parse_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_document");
    for items in [0usize, 10, 100, 1000] {
        let note = sample_note(items);
        group.throughput(Throughput::Bytes(note.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(items), &note, |b, note| {
            b.iter(|| parse_document(black_box(note)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_permalink, bench_parse_document);
criterion_main!(benches);
