//! Shared `SQLite` infrastructure for the graph store and the search index.
//!
//! Both backends open their own connection to the same database file. WAL
//! mode lets the search index read while the graph store writes.
//!
//! - [`connection`]: `Mutex<Connection>` locking with poison recovery, pragmas
//! - [`sql`]: LIKE escaping, glob patterns, timestamps and id lists
//! - [`metrics`]: per-operation counters and latency histograms

mod connection;
mod metrics;
mod sql;

pub use connection::{acquire_lock, configure_connection, open_connection};
pub use metrics::record_operation_metrics;
pub use sql::{
    escape_like_wildcards, from_millis, glob_to_like_pattern, id_list_json, to_millis,
};
