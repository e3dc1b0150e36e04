use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};

use stepflow_core::config::DatabaseConfig;
use stepflow_core::error::{Result, StepflowError};

/// Database connection wrapper providing connection pooling.
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
}

impl Database {
    /// Connect using the database configuration.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if !config.is_persistent() {
            return Err(StepflowError::Config("database.url is empty".into()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.pool_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| StepflowError::Database(format!("Failed to connect: {}", e)))?;

        tracing::info!(pool_size = config.pool_size, "Connected to PostgreSQL");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| StepflowError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
