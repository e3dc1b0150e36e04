//! PostgreSQL access for store tests.
//!
//! Database tests only run when `TEST_DATABASE_URL` is set. `DATABASE_URL`
//! is never read here. Each test gets its own freshly migrated database,
//! dropped again by [`IsolatedDatabase::cleanup`].

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::migrations::MigrationRunner;
use stepflow_core::{Result, StepflowError};

/// A migrated database that lives for one test.
pub struct IsolatedDatabase {
    pool: PgPool,
    db_name: String,
    base_url: String,
}

impl IsolatedDatabase {
    /// Create a database for `test_name`, or `None` when `TEST_DATABASE_URL` is unset.
    pub async fn from_env(test_name: &str) -> Result<Option<Self>> {
        let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("skipping {test_name}: TEST_DATABASE_URL not set");
            return Ok(None);
        };

        let db_name = format!(
            "stepflow_test_{}_{}",
            sanitize_db_name(test_name),
            uuid::Uuid::new_v4().simple()
        );

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await?;
        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name))
            .execute(&admin)
            .await?;
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&replace_db_name(&base_url, &db_name))
            .await?;
        MigrationRunner::new(pool.clone()).run().await?;

        Ok(Some(Self {
            pool,
            db_name,
            base_url,
        }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drop the database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.db_name))
            .execute(&admin)
            .await
            .map_err(|e| StepflowError::Database(format!("drop {}: {}", self.db_name, e)))?;
        Ok(())
    }
}

fn sanitize_db_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(32)
        .collect()
}

/// Swap the database component of a connection URL, keeping query parameters.
fn replace_db_name(url: &str, db_name: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let authority = base.find("://").map(|i| i + 3).unwrap_or(0);
    let prefix = match base[authority..].find('/') {
        Some(idx) => &base[..authority + idx],
        None => base,
    };

    match query {
        Some(query) => format!("{}/{}?{}", prefix, db_name, query),
        None => format!("{}/{}", prefix, db_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_db_name() {
        assert_eq!(sanitize_db_name("cas-wins once"), "cas_wins_once");
        assert_eq!(sanitize_db_name("store::tests"), "store__tests");
    }

    #[test]
    fn test_replace_db_name() {
        assert_eq!(
            replace_db_name("postgres://u:p@localhost:5432/postgres", "t1"),
            "postgres://u:p@localhost:5432/t1"
        );
        assert_eq!(
            replace_db_name("postgres://localhost/postgres?sslmode=disable", "t1"),
            "postgres://localhost/t1?sslmode=disable"
        );
        assert_eq!(
            replace_db_name("postgres://localhost:5432", "t1"),
            "postgres://localhost:5432/t1"
        );
    }
}
