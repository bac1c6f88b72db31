//! `SQLite` + FTS5 search index.

// FTS5 scores are f64; f32 precision is enough for ranking.
#![allow(clippy::cast_possible_truncation)]

use crate::models::{EntityId, SearchDocument, SearchHit, SearchItemKind};
use crate::storage::migrations::{Migration, MigrationRunner};
use crate::storage::sqlite::{acquire_lock, open_connection, record_operation_metrics};
use crate::storage::traits::SearchIndex;
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;

/// Schema migrations for the search index.
pub const SEARCH_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Create FTS5 search index",
    sql: "
        CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
            title,
            content,
            permalink,
            kind UNINDEXED,
            entity_id UNINDEXED,
            project_id UNINDEXED,
            file_path UNINDEXED,
            tokenize = 'unicode61'
        );
    ",
}];

/// Search index backed by an FTS5 virtual table.
pub struct SqliteSearchIndex {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteSearchIndex {
    /// Opens (creating if needed) the index at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = open_connection(Some(&db_path), "open_search_sqlite")?;
        Self::from_connection(conn, Some(db_path))
    }

    /// Creates an in-memory index (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = open_connection(None, "open_search_sqlite_memory")?;
        Self::from_connection(conn, None)
    }

    fn from_connection(mut conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        MigrationRunner::new("search").run(&mut conn, SEARCH_MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

/// Builds an FTS5 query matching any of the whitespace-separated terms.
///
/// Each term is quoted so FTS5 operators in user input match literally.
pub fn build_fts_query(query: &str) -> String {
    let terms: Vec<_> = query.split_whitespace().collect();
    let estimated_len = terms.iter().map(|t| t.len() + 8).sum::<usize>();
    let mut fts_query = String::with_capacity(estimated_len);
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            fts_query.push_str(" OR ");
        }
        fts_query.push('"');
        for c in term.chars() {
            if c == '"' {
                fts_query.push_str("\"\"");
            } else {
                fts_query.push(c);
            }
        }
        fts_query.push('"');
    }
    fts_query
}

/// Maps an FTS5 `bm25()` value (more negative is better) into `(0, 1)`.
fn normalize_bm25(score: f64) -> f32 {
    let positive_score = -score;
    let sigmoid = 1.0 / (1.0 + (-0.5 * positive_score).exp());
    sigmoid.clamp(0.0, 1.0) as f32
}

impl SearchIndex for SqliteSearchIndex {
    #[instrument(skip(self, documents), fields(operation = "index_entity", rows = documents.len()))]
    fn index_entity(
        &self,
        project_id: i64,
        entity_id: EntityId,
        documents: &[SearchDocument],
    ) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            let mut conn = acquire_lock(&self.conn);
            let tx = conn
                .transaction()
                .map_err(|e| Error::operation("begin_index_entity", e))?;
            tx.execute(
                "DELETE FROM search_index WHERE entity_id = ?1",
                params![entity_id.get()],
            )
            .map_err(|e| Error::operation("clear_entity_rows", e))?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO search_index
                             (title, content, permalink, kind, entity_id, project_id, file_path)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(|e| Error::operation("prepare_index_row", e))?;
                for doc in documents {
                    stmt.execute(params![
                        doc.title,
                        doc.content,
                        doc.permalink,
                        doc.kind.as_str(),
                        doc.entity_id.get(),
                        project_id,
                        doc.file_path
                    ])
                    .map_err(|e| Error::operation("insert_index_row", e))?;
                }
            }
            tx.commit()
                .map_err(|e| Error::operation("commit_index_entity", e))
        })();

        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("search", "index_entity", start, status);
        result
    }

    #[instrument(skip(self), fields(operation = "remove_entity"))]
    fn remove_entity(&self, entity_id: EntityId) -> Result<usize> {
        let start = Instant::now();
        let result = {
            let conn = acquire_lock(&self.conn);
            conn.execute(
                "DELETE FROM search_index WHERE entity_id = ?1",
                params![entity_id.get()],
            )
            .map_err(|e| Error::operation("remove_entity_rows", e))
        };
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("search", "remove_entity", start, status);
        result
    }

    #[instrument(
        skip(self, query),
        fields(operation = "search", query_length = query.len(), limit = limit)
    )]
    fn search(&self, project_id: i64, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let result = (|| {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare_cached(
                    "SELECT kind, entity_id, permalink, title, file_path, bm25(search_index) AS score
                     FROM search_index
                     WHERE search_index MATCH ?1 AND project_id = ?2
                     ORDER BY score
                     LIMIT ?3",
                )
                .map_err(|e| Error::operation("prepare_search", e))?;
            let rows = stmt
                .query_map(
                    params![fts_query, project_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, f64>(5)?,
                        ))
                    },
                )
                .map_err(|e| Error::operation("execute_search", e))?;

            let mut hits = Vec::new();
            for row in rows {
                let (kind, entity_id, permalink, title, file_path, score) =
                    row.map_err(|e| Error::operation("read_search_row", e))?;
                let Some(kind) = SearchItemKind::parse(&kind) else {
                    tracing::warn!(kind = %kind, "skipping index row of unknown kind");
                    continue;
                };
                hits.push(SearchHit {
                    kind,
                    entity_id: EntityId::new(entity_id),
                    permalink,
                    title,
                    file_path,
                    score: normalize_bm25(score),
                });
            }
            Ok(hits)
        })();

        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("search", "search", start, status);
        result
    }

    #[instrument(skip(self), fields(operation = "clear_project"))]
    fn clear_project(&self, project_id: i64) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "DELETE FROM search_index WHERE project_id = ?1",
            params![project_id],
        )
        .map_err(|e| Error::operation("clear_project_index", e))?;
        Ok(())
    }

    fn count(&self, project_id: i64) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM search_index WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::operation("count_index_rows", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
