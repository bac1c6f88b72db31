//! `SQLite` graph store.
//!
//! Stores projects, entities, observations and relations in one database,
//! with the project-scoped uniqueness rules enforced by indexes:
//!
//! - `entities(project_id, file_path)` is unique
//! - `entities(project_id, permalink)` is unique among markdown entities
//! - `relations(from_id, to_id, relation_type)` is unique when resolved
//! - `relations(from_id, to_name, relation_type)` is unique when unresolved

// SQLite returns i64 counts; they are small and non-negative.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Closures are needed around rusqlite's Error type.
#![allow(clippy::redundant_closure_for_method_calls)]

use crate::models::{
    Entity, EntityId, MARKDOWN_CONTENT_TYPE, NewEntity, NewRelation, Observation,
    ObservationSpec, Project, Relation, UpsertOutcome,
};
use crate::services::permalink::{disambiguated_permalink, is_derived_permalink};
use crate::storage::migrations::{Migration, MigrationRunner};
use crate::storage::sqlite::{
    acquire_lock, from_millis, glob_to_like_pattern, id_list_json, open_connection,
    record_operation_metrics, to_millis,
};
use crate::storage::traits::graph::{DeleteOutcome, FileState, GraphStore};
use crate::{Error, Result, now_millis};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;

/// Default bound on permalink disambiguation suffixes.
pub const DEFAULT_MAX_PERMALINK_SUFFIX: u32 = 1000;

/// Schema migrations for the graph tables.
pub const GRAPH_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create projects, entities, observations and relations",
        sql: "
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                content_type TEXT NOT NULL,
                permalink TEXT,
                file_path TEXT NOT NULL,
                checksum TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (project_id, file_path)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uix_entities_permalink
                ON entities(project_id, permalink)
                WHERE content_type = 'text/markdown' AND permalink IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_entities_title
                ON entities(project_id, title COLLATE NOCASE);
            CREATE INDEX IF NOT EXISTS idx_entities_checksum ON entities(project_id, checksum);
            CREATE INDEX IF NOT EXISTS idx_entities_updated ON entities(project_id, updated_at);

            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                content TEXT NOT NULL,
                context TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_observations_entity ON observations(entity_id);
            CREATE INDEX IF NOT EXISTS idx_observations_created
                ON observations(project_id, created_at);

            CREATE TABLE IF NOT EXISTS relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                from_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                to_id INTEGER REFERENCES entities(id) ON DELETE SET NULL,
                to_name TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                context TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uix_relations_resolved
                ON relations(from_id, to_id, relation_type) WHERE to_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS uix_relations_unresolved
                ON relations(from_id, to_name, relation_type) WHERE to_id IS NULL;
            CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_id);
            CREATE INDEX IF NOT EXISTS idx_relations_pending
                ON relations(project_id) WHERE to_id IS NULL;
            CREATE INDEX IF NOT EXISTS idx_relations_updated
                ON relations(project_id, updated_at);
        ",
    },
];

const ENTITY_COLUMNS: &str = "id, project_id, title, entity_type, content_type, permalink, \
                              file_path, checksum, metadata, created_at, updated_at";

const RELATION_COLUMNS: &str =
    "id, from_id, to_id, to_name, relation_type, context, created_at, updated_at";

const OBSERVATION_COLUMNS: &str =
    "id, entity_id, category, content, context, tags, created_at";

/// `SQLite`-based graph store.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Connection>` so every upsert runs as one serialized
/// transaction. WAL mode and `busy_timeout` handle other processes on the
/// same file.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    max_permalink_suffix: u32,
}

impl SqliteGraphStore {
    /// Opens (creating if needed) the store at `db_path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] if the schema cannot be brought up to
    /// date, or [`Error::OperationFailed`] if the database cannot be opened.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = open_connection(Some(&db_path), "open_graph_sqlite")?;
        Self::from_connection(conn, Some(db_path))
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = open_connection(None, "open_graph_sqlite_memory")?;
        Self::from_connection(conn, None)
    }

    fn from_connection(mut conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        MigrationRunner::new("graph").run(&mut conn, GRAPH_MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            max_permalink_suffix: DEFAULT_MAX_PERMALINK_SUFFIX,
        })
    }

    /// Sets the bound on permalink disambiguation suffixes.
    #[must_use]
    pub fn with_max_permalink_suffix(mut self, max: u32) -> Self {
        self.max_permalink_suffix = max;
        self
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns the applied schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = acquire_lock(&self.conn);
        MigrationRunner::new("graph").current_version(&conn)
    }

    /// Returns a permalink free for `exclude` (or anyone), appending `-1`,
    /// `-2`, ... to `base` as needed. The flag is true if a suffix was used.
    fn available_permalink(
        &self,
        conn: &Connection,
        project_id: i64,
        base: &str,
        exclude: Option<EntityId>,
    ) -> Result<(String, bool)> {
        let is_free = |candidate: &str| -> Result<bool> {
            let owner = permalink_owner(conn, project_id, candidate)?;
            Ok(owner.is_none() || owner == exclude)
        };

        if is_free(base)? {
            return Ok((base.to_string(), false));
        }
        metrics::counter!("notegraph_permalink_collisions_total").increment(1);
        for suffix in 1..=self.max_permalink_suffix {
            let candidate = disambiguated_permalink(base, suffix);
            if is_free(&candidate)? {
                tracing::debug!(base, permalink = %candidate, "disambiguated permalink");
                return Ok((candidate, true));
            }
        }
        Err(Error::PermalinkExhausted {
            permalink: base.to_string(),
            attempts: self.max_permalink_suffix,
        })
    }

    /// Resolves the permalink to store for an entity.
    fn permalink_for(
        &self,
        conn: &Connection,
        project_id: i64,
        entity: &NewEntity,
        exclude: Option<EntityId>,
    ) -> Result<(Option<String>, bool)> {
        match entity.permalink.as_deref() {
            Some(base) if entity.content_type == MARKDOWN_CONTENT_TYPE => {
                let (permalink, disambiguated) =
                    self.available_permalink(conn, project_id, base, exclude)?;
                Ok((Some(permalink), disambiguated))
            },
            _ => Ok((None, false)),
        }
    }

    fn update_row(
        &self,
        conn: &Connection,
        id: EntityId,
        project_id: i64,
        entity: &NewEntity,
        now: i64,
    ) -> Result<bool> {
        let stored = stored_permalink(conn, id)?;
        let (permalink, disambiguated) = match (stored, entity.permalink.as_deref()) {
            (Some(stored), Some(base))
                if entity.content_type == MARKDOWN_CONTENT_TYPE
                    && is_derived_permalink(&stored, base) =>
            {
                (Some(stored), false)
            },
            _ => self.permalink_for(conn, project_id, entity, Some(id))?,
        };
        conn.execute(
            "UPDATE entities
             SET title = ?2, entity_type = ?3, content_type = ?4, permalink = ?5,
                 checksum = ?6, metadata = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                id.get(),
                entity.title,
                entity.entity_type,
                entity.content_type,
                permalink,
                entity.checksum,
                metadata_json(entity),
                now
            ],
        )
        .map_err(|e| Error::operation("update_entity", e))?;
        Ok(disambiguated)
    }

    fn upsert_in(
        &self,
        conn: &mut Connection,
        project_id: i64,
        entity: &NewEntity,
        observations: &[ObservationSpec],
        relations: &[NewRelation],
    ) -> Result<UpsertOutcome> {
        let tx = conn
            .transaction()
            .map_err(|e| Error::operation("begin_upsert", e))?;
        let now = to_millis(now_millis());

        let (id, created, disambiguated) =
            if let Some(id) = find_id_by_path(&tx, project_id, &entity.file_path)? {
                let disambiguated = self.update_row(&tx, id, project_id, entity, now)?;
                (id, false, disambiguated)
            } else {
                match insert_row(&tx, project_id, entity, entity.permalink.as_deref(), now) {
                    Ok(id) => (id, true, false),
                    Err(e) if is_constraint_violation(&e) => {
                        if let Some(id) = find_id_by_path(&tx, project_id, &entity.file_path)? {
                            tracing::debug!(path = %entity.file_path, "insert raced on file path, updating");
                            let disambiguated = self.update_row(&tx, id, project_id, entity, now)?;
                            (id, false, disambiguated)
                        } else {
                            let (permalink, _) = self.permalink_for(&tx, project_id, entity, None)?;
                            let id = insert_row(&tx, project_id, entity, permalink.as_deref(), now)
                                .map_err(|e| Error::operation("insert_entity", e))?;
                            (id, true, true)
                        }
                    },
                    Err(e) => return Err(Error::operation("insert_entity", e)),
                }
            };

        replace_observations(&tx, project_id, id, observations, now)?;
        replace_relations(&tx, project_id, id, relations, now)?;

        let stored = entity_by_id(&tx, id)?.ok_or_else(|| {
            Error::operation("upsert_entity", format!("entity {id} missing after write"))
        })?;
        tx.commit()
            .map_err(|e| Error::operation("commit_upsert", e))?;

        Ok(UpsertOutcome {
            entity: stored,
            created,
            permalink_disambiguated: disambiguated,
        })
    }

    /// Runs a read query under the lock and records metrics.
    fn read<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = {
            let conn = acquire_lock(&self.conn);
            f(&conn)
        };
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("graph", operation, start, status);
        result
    }

    /// Runs a mutation in one transaction under the lock and records metrics.
    fn transact<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = {
            let mut conn = acquire_lock(&self.conn);
            conn.transaction()
                .map_err(|e| Error::operation(operation, e))
                .and_then(|tx| {
                    let value = f(&tx)?;
                    tx.commit().map_err(|e| Error::operation(operation, e))?;
                    Ok(value)
                })
        };
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("graph", operation, start, status);
        result
    }
}

fn stored_permalink(conn: &Connection, id: EntityId) -> Result<Option<String>> {
    conn.query_row(
        "SELECT permalink FROM entities WHERE id = ?1",
        params![id.get()],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(|e| Error::operation("get_permalink", e))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn metadata_json(entity: &NewEntity) -> String {
    serde_json::to_string(&entity.metadata).unwrap_or_else(|_| "{}".to_string())
}

fn insert_row(
    conn: &Connection,
    project_id: i64,
    entity: &NewEntity,
    permalink: Option<&str>,
    now: i64,
) -> rusqlite::Result<EntityId> {
    let permalink = if entity.content_type == MARKDOWN_CONTENT_TYPE {
        permalink
    } else {
        None
    };
    conn.execute(
        "INSERT INTO entities (project_id, title, entity_type, content_type, permalink,
                               file_path, checksum, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            project_id,
            entity.title,
            entity.entity_type,
            entity.content_type,
            permalink,
            entity.file_path,
            entity.checksum,
            metadata_json(entity),
            now
        ],
    )?;
    Ok(EntityId::new(conn.last_insert_rowid()))
}

fn find_id_by_path(conn: &Connection, project_id: i64, file_path: &str) -> Result<Option<EntityId>> {
    conn.query_row(
        "SELECT id FROM entities WHERE project_id = ?1 AND file_path = ?2",
        params![project_id, file_path],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|id| id.map(EntityId::new))
    .map_err(|e| Error::operation("find_entity_by_path", e))
}

fn permalink_owner(conn: &Connection, project_id: i64, permalink: &str) -> Result<Option<EntityId>> {
    conn.query_row(
        "SELECT id FROM entities
         WHERE project_id = ?1 AND permalink = ?2 AND content_type = ?3",
        params![project_id, permalink, MARKDOWN_CONTENT_TYPE],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|id| id.map(EntityId::new))
    .map_err(|e| Error::operation("find_permalink_owner", e))
}

fn replace_observations(
    conn: &Connection,
    project_id: i64,
    entity_id: EntityId,
    observations: &[ObservationSpec],
    now: i64,
) -> Result<()> {
    conn.execute(
        "DELETE FROM observations WHERE entity_id = ?1",
        params![entity_id.get()],
    )
    .map_err(|e| Error::operation("delete_observations", e))?;

    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO observations (project_id, entity_id, category, content, context, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(|e| Error::operation("prepare_insert_observation", e))?;
    for observation in observations {
        let tags = serde_json::to_string(&observation.tags).unwrap_or_else(|_| "[]".to_string());
        stmt.execute(params![
            project_id,
            entity_id.get(),
            observation.category,
            observation.content,
            observation.context,
            tags,
            now
        ])
        .map_err(|e| Error::operation("insert_observation", e))?;
    }
    Ok(())
}

fn replace_relations(
    conn: &Connection,
    project_id: i64,
    entity_id: EntityId,
    relations: &[NewRelation],
    now: i64,
) -> Result<()> {
    conn.execute(
        "DELETE FROM relations WHERE from_id = ?1",
        params![entity_id.get()],
    )
    .map_err(|e| Error::operation("delete_relations", e))?;

    let mut stmt = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO relations
                 (project_id, from_id, to_id, to_name, relation_type, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .map_err(|e| Error::operation("prepare_insert_relation", e))?;
    for relation in relations {
        stmt.execute(params![
            project_id,
            entity_id.get(),
            relation.to_id.map(EntityId::get),
            relation.to_name,
            relation.relation_type,
            relation.context,
            now
        ])
        .map_err(|e| Error::operation("insert_relation", e))?;
    }
    Ok(())
}

fn parse_entity_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let metadata: String = row.get("metadata")?;
    Ok(Entity {
        id: EntityId::new(row.get("id")?),
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        entity_type: row.get("entity_type")?,
        content_type: row.get("content_type")?,
        permalink: row.get("permalink")?,
        file_path: row.get("file_path")?,
        checksum: row.get("checksum")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

fn parse_relation_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: row.get("id")?,
        from_id: EntityId::new(row.get("from_id")?),
        to_id: row.get::<_, Option<i64>>("to_id")?.map(EntityId::new),
        to_name: row.get("to_name")?,
        relation_type: row.get("relation_type")?,
        context: row.get("context")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

fn parse_observation_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let tags: String = row.get("tags")?;
    Ok(Observation {
        id: row.get("id")?,
        entity_id: EntityId::new(row.get("entity_id")?),
        category: row.get("category")?,
        content: row.get("content")?,
        context: row.get("context")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: from_millis(row.get("created_at")?),
    })
}

fn parse_project_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

/// Runs a query and collects mapped rows.
fn query_rows<T, P: rusqlite::Params>(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| Error::operation(operation, e))?;
    let rows = stmt
        .query_map(params, map)
        .map_err(|e| Error::operation(operation, e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::operation(operation, e))
}

fn entity_by_id(conn: &Connection, id: EntityId) -> Result<Option<Entity>> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
        params![id.get()],
        parse_entity_row,
    )
    .optional()
    .map_err(|e| Error::operation("get_entity", e))
}

fn ids_json(ids: &[EntityId]) -> String {
    id_list_json(&ids.iter().map(|id| id.get()).collect::<Vec<_>>())
}

impl GraphStore for SqliteGraphStore {
    #[instrument(skip(self), fields(operation = "ensure_project"))]
    fn ensure_project(&self, name: &str, path: &str) -> Result<Project> {
        self.transact("ensure_project", |conn| {
            let now = to_millis(now_millis());
            conn.execute(
                "INSERT INTO projects (name, path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(name) DO UPDATE SET path = excluded.path, updated_at = excluded.updated_at
                 WHERE projects.path != excluded.path",
                params![name, path, now],
            )
            .map_err(|e| Error::operation("ensure_project", e))?;
            conn.query_row(
                "SELECT id, name, path, created_at, updated_at FROM projects WHERE name = ?1",
                params![name],
                parse_project_row,
            )
            .map_err(|e| Error::operation("ensure_project", e))
        })
    }

    fn get_project(&self, name: &str) -> Result<Option<Project>> {
        self.read("get_project", |conn| {
            conn.query_row(
                "SELECT id, name, path, created_at, updated_at FROM projects WHERE name = ?1",
                params![name],
                parse_project_row,
            )
            .optional()
            .map_err(|e| Error::operation("get_project", e))
        })
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        self.read("list_projects", |conn| {
            query_rows(
                conn,
                "list_projects",
                "SELECT id, name, path, created_at, updated_at FROM projects ORDER BY name",
                [],
                parse_project_row,
            )
        })
    }

    #[instrument(
        skip(self, entity, observations, relations),
        fields(operation = "upsert_entity", path = %entity.file_path)
    )]
    fn upsert_entity(
        &self,
        project_id: i64,
        entity: &NewEntity,
        observations: &[ObservationSpec],
        relations: &[NewRelation],
    ) -> Result<UpsertOutcome> {
        let start = Instant::now();
        let result = {
            let mut conn = acquire_lock(&self.conn);
            self.upsert_in(&mut conn, project_id, entity, observations, relations)
        };

        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics("graph", "upsert_entity", start, status);
        if let Ok(outcome) = &result {
            let outcome_label = if outcome.created { "created" } else { "updated" };
            metrics::counter!("notegraph_upsert_total", "outcome" => outcome_label).increment(1);
        }
        result
    }

    #[instrument(skip(self), fields(operation = "move_entity"))]
    fn move_entity(
        &self,
        id: EntityId,
        file_path: &str,
        title: &str,
        permalink: Option<&str>,
    ) -> Result<Entity> {
        self.transact("move_entity", |conn| {
            let existing =
                entity_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
            let permalink = match (permalink, existing.permalink) {
                (Some(base), Some(stored))
                    if existing.content_type == MARKDOWN_CONTENT_TYPE
                        && is_derived_permalink(&stored, base) =>
                {
                    Some(stored)
                },
                (Some(base), _) if existing.content_type == MARKDOWN_CONTENT_TYPE => {
                    Some(self.available_permalink(conn, existing.project_id, base, Some(id))?.0)
                },
                _ => None,
            };
            conn.execute(
                "UPDATE entities SET file_path = ?2, title = ?3, permalink = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id.get(), file_path, title, permalink, to_millis(now_millis())],
            )
            .map_err(|e| Error::operation("move_entity", e))?;
            entity_by_id(conn, id)?.ok_or_else(|| Error::NotFound(format!("entity {id}")))
        })
    }

    #[instrument(skip(self), fields(operation = "delete_entity"))]
    fn delete_entity(&self, id: EntityId) -> Result<DeleteOutcome> {
        self.transact("delete_entity", |conn| {
            let now = to_millis(now_millis());
            let demoted_sources = query_rows(
                conn,
                "incoming_relation_sources",
                "SELECT DISTINCT from_id FROM relations WHERE to_id = ?1 AND from_id != ?1",
                params![id.get()],
                |row| row.get::<_, i64>(0).map(EntityId::new),
            )?
            .into_iter()
            .collect::<BTreeSet<_>>();

            // Incoming relations that would collide with an existing
            // unresolved row once demoted are dropped first.
            conn.execute(
                "DELETE FROM relations
                 WHERE to_id = ?1 AND from_id != ?1
                   AND EXISTS (
                       SELECT 1 FROM relations u
                       WHERE u.from_id = relations.from_id
                         AND u.to_id IS NULL
                         AND u.to_name = relations.to_name
                         AND u.relation_type = relations.relation_type
                   )",
                params![id.get()],
            )
            .map_err(|e| Error::operation("drop_colliding_relations", e))?;
            let demoted = conn
                .execute(
                    "UPDATE relations SET to_id = NULL, updated_at = ?2
                     WHERE to_id = ?1 AND from_id != ?1",
                    params![id.get(), now],
                )
                .map_err(|e| Error::operation("demote_incoming_relations", e))?;
            let deleted = conn
                .execute("DELETE FROM entities WHERE id = ?1", params![id.get()])
                .map_err(|e| Error::operation("delete_entity", e))?;

            if deleted > 0 {
                tracing::debug!(entity = %id, demoted, "deleted entity");
            }
            Ok(DeleteOutcome {
                deleted: deleted > 0,
                demoted_sources,
            })
        })
    }

    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        self.read("get_entity", |conn| entity_by_id(conn, id))
    }

    fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read("get_entities", |conn| {
            query_rows(
                conn,
                "get_entities",
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE id IN (SELECT value FROM json_each(?1))"
                ),
                params![ids_json(ids)],
                parse_entity_row,
            )
        })
    }

    fn find_by_file_path(&self, project_id: i64, file_path: &str) -> Result<Option<Entity>> {
        self.read("find_by_file_path", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE project_id = ?1 AND file_path = ?2"
                ),
                params![project_id, file_path],
                parse_entity_row,
            )
            .optional()
            .map_err(|e| Error::operation("find_by_file_path", e))
        })
    }

    fn find_by_permalink(&self, project_id: i64, permalink: &str) -> Result<Option<Entity>> {
        self.read("find_by_permalink", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE project_id = ?1 AND permalink = ?2"
                ),
                params![project_id, permalink],
                parse_entity_row,
            )
            .optional()
            .map_err(|e| Error::operation("find_by_permalink", e))
        })
    }

    fn find_by_title(&self, project_id: i64, title: &str) -> Result<Vec<Entity>> {
        self.read("find_by_title", |conn| {
            query_rows(
                conn,
                "find_by_title",
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE project_id = ?1 AND title = ?2 COLLATE NOCASE
                     ORDER BY updated_at DESC, id"
                ),
                params![project_id, title],
                parse_entity_row,
            )
        })
    }

    fn find_by_pattern(&self, project_id: i64, pattern: &str) -> Result<Vec<Entity>> {
        self.read("find_by_pattern", |conn| {
            query_rows(
                conn,
                "find_by_pattern",
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE project_id = ?1 AND COALESCE(permalink, file_path) LIKE ?2 ESCAPE '\\'
                     ORDER BY updated_at DESC, id"
                ),
                params![project_id, glob_to_like_pattern(pattern)],
                parse_entity_row,
            )
        })
    }

    fn list_entities(&self, project_id: i64) -> Result<Vec<Entity>> {
        self.read("list_entities", |conn| {
            query_rows(
                conn,
                "list_entities",
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE project_id = ?1 ORDER BY file_path"
                ),
                params![project_id],
                parse_entity_row,
            )
        })
    }

    fn file_states(&self, project_id: i64) -> Result<BTreeMap<String, FileState>> {
        self.read("file_states", |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT file_path, id, checksum FROM entities WHERE project_id = ?1")
                .map_err(|e| Error::operation("file_states", e))?;
            let rows = stmt
                .query_map(params![project_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        FileState {
                            id: EntityId::new(row.get(1)?),
                            checksum: row.get(2)?,
                        },
                    ))
                })
                .map_err(|e| Error::operation("file_states", e))?;
            rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
                .map_err(|e| Error::operation("file_states", e))
        })
    }

    fn recent_entities(&self, project_id: i64, since: DateTime<Utc>) -> Result<Vec<Entity>> {
        self.read("recent_entities", |conn| {
            query_rows(
                conn,
                "recent_entities",
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE project_id = ?1 AND updated_at >= ?2
                     ORDER BY updated_at DESC, id"
                ),
                params![project_id, to_millis(since)],
                parse_entity_row,
            )
        })
    }

    fn observations_for(&self, ids: &[EntityId]) -> Result<Vec<Observation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read("observations_for", |conn| {
            query_rows(
                conn,
                "observations_for",
                &format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM observations
                     WHERE entity_id IN (SELECT value FROM json_each(?1))
                     ORDER BY entity_id, id"
                ),
                params![ids_json(ids)],
                parse_observation_row,
            )
        })
    }

    fn recent_observations(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        self.read("recent_observations", |conn| {
            query_rows(
                conn,
                "recent_observations",
                &format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM observations
                     WHERE project_id = ?1 AND created_at >= ?2
                     ORDER BY created_at DESC, id"
                ),
                params![project_id, to_millis(since)],
                parse_observation_row,
            )
        })
    }

    fn relations_touching(
        &self,
        ids: &[EntityId],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Relation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read("relations_touching", |conn| {
            query_rows(
                conn,
                "relations_touching",
                &format!(
                    "SELECT {RELATION_COLUMNS} FROM relations
                     WHERE (from_id IN (SELECT value FROM json_each(?1))
                            OR to_id IN (SELECT value FROM json_each(?1)))
                       AND (?2 IS NULL OR updated_at >= ?2)
                     ORDER BY updated_at DESC, id"
                ),
                params![ids_json(ids), since.map(to_millis)],
                parse_relation_row,
            )
        })
    }

    fn outgoing_relations(&self, id: EntityId) -> Result<Vec<Relation>> {
        self.read("outgoing_relations", |conn| {
            query_rows(
                conn,
                "outgoing_relations",
                &format!("SELECT {RELATION_COLUMNS} FROM relations WHERE from_id = ?1 ORDER BY id"),
                params![id.get()],
                parse_relation_row,
            )
        })
    }

    fn unresolved_relations(&self, project_id: i64) -> Result<Vec<Relation>> {
        self.read("unresolved_relations", |conn| {
            query_rows(
                conn,
                "unresolved_relations",
                &format!(
                    "SELECT {RELATION_COLUMNS} FROM relations
                     WHERE project_id = ?1 AND to_id IS NULL ORDER BY id"
                ),
                params![project_id],
                parse_relation_row,
            )
        })
    }

    #[instrument(skip(self), fields(operation = "resolve_relation"))]
    fn resolve_relation(&self, relation_id: i64, to_id: EntityId) -> Result<bool> {
        self.transact("resolve_relation", |conn| {
            let changed = conn
                .execute(
                    "UPDATE OR IGNORE relations SET to_id = ?2, updated_at = ?3
                     WHERE id = ?1 AND to_id IS NULL",
                    params![relation_id, to_id.get(), to_millis(now_millis())],
                )
                .map_err(|e| Error::operation("resolve_relation", e))?;
            if changed > 0 {
                return Ok(true);
            }
            conn.execute(
                "DELETE FROM relations WHERE id = ?1 AND to_id IS NULL",
                params![relation_id],
            )
            .map_err(|e| Error::operation("drop_duplicate_relation", e))?;
            Ok(false)
        })
    }

    fn recent_relations(&self, project_id: i64, since: DateTime<Utc>) -> Result<Vec<Relation>> {
        self.read("recent_relations", |conn| {
            query_rows(
                conn,
                "recent_relations",
                &format!(
                    "SELECT {RELATION_COLUMNS} FROM relations
                     WHERE project_id = ?1 AND updated_at >= ?2
                     ORDER BY updated_at DESC, id"
                ),
                params![project_id, to_millis(since)],
                parse_relation_row,
            )
        })
    }
}
