//! SQLite schema migrations.
//!
//! Migrations are forward-only and sentinel-driven: each migration names a
//! [`Sentinel`] condition (a missing table or column) and is applied only
//! if that condition holds, so running the full set twice against an
//! already-migrated database is a no-op. A `schema_migrations` table is
//! still kept, but purely as an audit trail — the sentinel check, not the
//! version row, is what gates application.

use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to execute migration {version} ({description}): {source}")]
    ExecutionError {
        version: i64,
        description: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to inspect schema: {0}")]
    InspectionError(#[source] sqlx::Error),
}

/// The condition that determines whether a migration still needs applying.
#[derive(Debug, Clone, Copy)]
pub enum Sentinel {
    TableMissing(&'static str),
    ColumnMissing { table: &'static str, column: &'static str },
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sentinel: Sentinel,
    pub sql: &'static str,
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply every migration whose sentinel condition is unmet, in order.
    /// Safe to call repeatedly: idempotent migration.
    pub async fn run_embedded_migrations(
        &self,
        migrations: Vec<Migration>,
    ) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;

        let mut applied = 0;
        for migration in &migrations {
            if self.sentinel_unmet(migration.sentinel).await? {
                self.apply_migration(migration).await?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MigrationError::ExecutionError {
            version: 0,
            description: "ensure_migrations_table".to_string(),
            source: e,
        })?;
        Ok(())
    }

    async fn sentinel_unmet(&self, sentinel: Sentinel) -> Result<bool, MigrationError> {
        match sentinel {
            Sentinel::TableMissing(table) => {
                let row = sqlx::query(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                )
                .bind(table)
                .fetch_optional(&self.pool)
                .await
                .map_err(MigrationError::InspectionError)?;
                Ok(row.is_none())
            }
            Sentinel::ColumnMissing { table, column } => {
                // PRAGMA table_info doesn't support bind parameters; the
                // table name is always a compile-time constant here.
                let query = format!("PRAGMA table_info({table})");
                let rows = sqlx::query(&query)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(MigrationError::InspectionError)?;
                let has_column = rows
                    .iter()
                    .any(|row| row.get::<String, _>("name") == column);
                Ok(!has_column)
            }
        }
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        sqlx::raw_sql(migration.sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::ExecutionError {
                version: migration.version,
                description: migration.description.to_string(),
                source: e,
            })?;

        sqlx::query("INSERT OR IGNORE INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::ExecutionError {
                version: migration.version,
                description: migration.description.to_string(),
                source: e,
            })?;

        Ok(())
    }
}

pub fn all_embedded_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "initial schema: tasks, invocations, budget_events",
        sentinel: Sentinel::TableMissing("tasks"),
        sql: include_str!("../../../migrations/001_init.sql"),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool.clone());
        let first = migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn creates_expected_tables() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool.clone());
        migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .unwrap();

        for table in ["tasks", "invocations", "budget_events"] {
            let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&pool)
                .await
                .unwrap();
            assert!(row.is_some(), "missing table {table}");
        }
    }
}
