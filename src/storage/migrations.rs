//! Schema migrations.
//!
//! Applied versions are recorded in `_schema_versions`. Pending migrations run
//! in one transaction, so a store is either fully upgraded or left as it was.

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

use super::schema::{self, Migration};

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration statement failed.
    #[error("Migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        version: u32,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The store was written by a newer build.
    #[error("Store is at schema version {found}, newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Applies [`schema::MIGRATIONS`] to a pool.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies every migration newer than the store's current version.
    /// Returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.ensure_versions_table().await?;

        let current = self.current_version().await?;
        let supported = schema::latest_version();
        if current > supported {
            return Err(MigrationError::UnsupportedVersion {
                found: current,
                supported,
            });
        }

        let pending: Vec<&Migration> = schema::MIGRATIONS
            .iter()
            .filter(|m| m.version > current)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for migration in &pending {
            for statement in migration.statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| MigrationError::MigrationFailed {
                        version: migration.version,
                        name: migration.name,
                        source,
                    })?;
            }
            sqlx::query("INSERT INTO _schema_versions (version, name) VALUES (?1, ?2)")
                .bind(i64::from(migration.version))
                .bind(migration.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            from = current,
            to = supported,
            applied = pending.len(),
            "Applied schema migrations"
        );
        Ok(pending.len())
    }

    /// Highest applied version, 0 for a fresh store.
    pub async fn current_version(&self) -> Result<u32, MigrationError> {
        self.ensure_versions_table().await?;
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _schema_versions")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0).max(0) as u32)
    }

    /// Returns the applied migrations, oldest first.
    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_versions_table().await?;

        let rows = sqlx::query(
            "SELECT version, name, applied_at FROM _schema_versions ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut applied = Vec::with_capacity(rows.len());
        for row in rows {
            applied.push(AppliedMigration {
                version: row.try_get::<i64, _>("version")?.max(0) as u32,
                name: row.try_get("name")?,
                applied_at: row.try_get("applied_at")?,
            });
        }
        Ok(applied)
    }

    async fn ensure_versions_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _schema_versions (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    /// SQLite `datetime('now')` text.
    pub applied_at: String,
}
