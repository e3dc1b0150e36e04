//! Migration runner guarded by a PostgreSQL advisory lock.
//!
//! Several processes may start against the same database; the lock makes
//! exactly one of them apply pending migrations while the others wait.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use stepflow_core::error::{Result, StepflowError};

/// "STEPFLOW" in ASCII, truncated to fit an i64.
const MIGRATION_LOCK_ID: i64 = 0x5354_4550_464C_4F;

const CORE_SQL: &str = include_str!("../../migrations/0001_stepflow_core.sql");

/// A single migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. `0001_stepflow_core`.
    pub name: String,
    /// SQL to execute.
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Migrations shipped with the runtime, in application order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0001_stepflow_core", CORE_SQL)]
}

/// Applies pending migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every built-in migration that has not been applied yet.
    pub async fn run(&self) -> Result<()> {
        self.acquire_lock().await?;

        let result = self.run_inner(builtin_migrations()).await;

        if let Err(e) = self.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    async fn run_inner(&self, migrations: Vec<Migration>) -> Result<()> {
        self.ensure_migrations_table().await?;

        let applied = self.applied_migrations().await?;
        debug!("Already applied migrations: {:?}", applied);

        for migration in migrations {
            if !applied.contains(&migration.name) {
                self.apply(&migration).await?;
            }
        }

        Ok(())
    }

    async fn acquire_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StepflowError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;
        debug!("Migration lock acquired");
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StepflowError::Database(format!("Failed to release migration lock: {}", e))
            })?;
        debug!("Migration lock released");
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stepflow_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StepflowError::Database(format!("Failed to create migrations table: {}", e))
        })?;
        Ok(())
    }

    async fn applied_migrations(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM stepflow_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StepflowError::Database(format!("Failed to read applied migrations: {}", e))
            })?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        info!("Applying migration: {}", migration.name);

        let mut tx = self.pool.begin().await?;
        for statement in split_sql_statements(&migration.sql) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    StepflowError::Database(format!(
                        "Failed to apply migration '{}': {}",
                        migration.name, e
                    ))
                })?;
        }

        sqlx::query("INSERT INTO stepflow_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Migration applied: {}", migration.name);
        Ok(())
    }
}

/// Split SQL into statements on `;`, dropping `--` comment lines.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let without_comments: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_migrations() {
        let migrations = builtin_migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name, "0001_stepflow_core");

        let sql = &migrations[0].sql;
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS stepflow_events"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS stepflow_runs"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS stepflow_steps"));
        assert!(sql.contains("UNIQUE (workflow_id, event_id)"));
    }

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_sql_statements("SELECT 1; SELECT 2;\nSELECT 3");
        assert_eq!(stmts, ["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_split_drops_comments() {
        let sql = "-- header; with a semicolon\nCREATE TABLE t (id INT);\n\n-- trailing\n";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts, ["CREATE TABLE t (id INT)"]);
    }

    #[test]
    fn test_core_migration_splits_cleanly() {
        let stmts = split_sql_statements(CORE_SQL);
        assert!(stmts.iter().all(|s| !s.starts_with("--")));
        assert!(stmts.len() >= 3);
    }
}
