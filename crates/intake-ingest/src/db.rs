//! Connection pool for the destination database

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::IngestResult;

pub async fn create_pool(config: &DatabaseConfig) -> IngestResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> IngestResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending schema migrations
pub async fn migrate(pool: &PgPool) -> IngestResult<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(sqlx::Error::from)?;
    tracing::info!("Database migrations applied");
    Ok(())
}
