//! Full-text search backends.
//!
//! The index is derived from the graph store and can be rebuilt from it at
//! any time.

mod sqlite;

pub use sqlite::{SEARCH_MIGRATIONS, SqliteSearchIndex, build_fts_query};

pub use crate::storage::traits::index::SearchIndex;
