//! `SQLite` schema migrations.
//!
//! Each component keeps an ordered list of numbered migrations compiled into
//! the binary. On open, pending migrations are applied in order, each in its
//! own transaction together with its row in `{component}_schema_migrations`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use notegraph::storage::migrations::{Migration, MigrationRunner};
//!
//! const MIGRATIONS: &[Migration] = &[Migration {
//!     version: 1,
//!     description: "Initial table",
//!     sql: "CREATE TABLE IF NOT EXISTS things (id INTEGER PRIMARY KEY);",
//! }];
//!
//! MigrationRunner::new("things").run(&mut conn, MIGRATIONS)?;
//! ```

use crate::{Error, Result};
use rusqlite::{Connection, params};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply; may contain several statements.
    pub sql: &'static str,
}

/// Applies migrations for one component of the database.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    component: String,
}

impl MigrationRunner {
    /// Creates a runner; `component` prefixes the tracking table.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Returns the name of the migrations tracking table.
    #[must_use]
    pub fn migrations_table(&self) -> String {
        format!("{}_schema_migrations", self.component)
    }

    /// Applies every migration newer than the recorded version.
    ///
    /// Returns the number of migrations applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] naming the failing version. Earlier
    /// migrations stay applied; the failing one is rolled back.
    pub fn run(&self, conn: &mut Connection, migrations: &[Migration]) -> Result<usize> {
        self.ensure_migrations_table(conn)?;
        let current = self.current_version(conn)?;

        let mut pending: Vec<&Migration> =
            migrations.iter().filter(|m| m.version > current).collect();
        pending.sort_by_key(|m| m.version);

        for migration in &pending {
            self.apply(conn, migration)?;
        }
        Ok(pending.len())
    }

    /// Returns the highest applied version, or 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the tracking table cannot be read.
    pub fn current_version(&self, conn: &Connection) -> Result<i32> {
        let table = self.migrations_table();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| Error::operation("read_migration_version", e))?;
        if !exists {
            return Ok(0);
        }
        conn.query_row(
            &format!("SELECT COALESCE(MAX(version), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::operation("read_migration_version", e))
    }

    fn ensure_migrations_table(&self, conn: &Connection) -> Result<()> {
        let table = self.migrations_table();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )"
        ))
        .map_err(|e| Error::operation("create_migrations_table", e))
    }

    fn apply(&self, conn: &mut Connection, migration: &Migration) -> Result<()> {
        let fail = |cause: String| Error::Migration {
            version: migration.version,
            cause,
        };
        let tx = conn.transaction().map_err(|e| fail(e.to_string()))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| fail(format!("{}: {e}", migration.description)))?;
        tx.execute(
            &format!(
                "INSERT INTO {} (version, description, applied_at) VALUES (?1, ?2, ?3)",
                self.migrations_table()
            ),
            params![
                migration.version,
                migration.description,
                crate::now_millis().timestamp_millis()
            ],
        )
        .map_err(|e| fail(e.to_string()))?;
        tx.commit().map_err(|e| fail(e.to_string()))?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            component = %self.component,
            "Applied migration"
        );
        Ok(())
    }
}

/// Maximum version across a set of migrations.
#[must_use]
pub fn max_version(migrations: &[Migration]) -> i32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}
