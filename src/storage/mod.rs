//! Storage layer.
//!
//! Two layers share one `SQLite` database file:
//! - **Graph**: authoritative entities, observations and relations
//! - **Index**: FTS5 full-text search, derived from the graph
//!
//! Each layer owns its connection and its migration history.

// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow unused_self for methods kept for API consistency.
#![allow(clippy::unused_self)]

pub mod graph;
pub mod index;
pub mod migrations;
pub mod sqlite;
pub mod traits;

pub use graph::SqliteGraphStore;
pub use index::SqliteSearchIndex;
pub use traits::{DeleteOutcome, GraphStore, SearchIndex};
