//! Storage backend traits.

pub mod graph;
pub mod index;

pub use graph::{DeleteOutcome, GraphStore};
pub use index::SearchIndex;
