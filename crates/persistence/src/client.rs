//! Postgres client and connection management

use sqlx::postgres::{PgPool, PgPoolOptions};

use outdial_config::PersistenceConfig;

use crate::error::PersistenceError;
use crate::schema;

/// Connection pool wrapper
#[derive(Clone)]
pub struct PgClient {
    pool: PgPool,
}

impl PgClient {
    /// Connect to the configured database
    pub async fn connect(config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        tracing::info!(pool_size = config.pool_size, "Connecting to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Ensure all tables exist
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        schema::create_tables(&self.pool).await?;
        tracing::info!("Schema ensured");
        Ok(())
    }

    /// Cheap connectivity probe for readiness checks
    pub async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
