//! Graph store backends.
//!
//! | Backend | Use Case |
//! |---------|----------|
//! | [`SqliteGraphStore`] | Default; embedded, file-backed or in-memory |
//!
//! # Example
//!
//! ```rust,ignore
//! use notegraph::storage::graph::SqliteGraphStore;
//! use notegraph::storage::GraphStore;
//!
//! let store = SqliteGraphStore::new("notegraph.db")?;
//! let project = store.ensure_project("notes", "/home/me/notes")?;
//! let entities = store.list_entities(project.id)?;
//! ```

mod sqlite;

pub use sqlite::{DEFAULT_MAX_PERMALINK_SUFFIX, GRAPH_MIGRATIONS, SqliteGraphStore};

pub use crate::storage::traits::graph::{FileState, GraphStore};
