//! Database adapters (connection pool and migrations wiring).

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use crate::config::Settings;
use crate::jobs::StoreError;
use crate::jobs::postgres::map_sqlx_error;

/// Schema the batch-changes queues expect.
pub const MIGRATION: &str = include_str!("../migrations/0001_batch_changes.sql");

/// Open the shared pool and verify the database answers.
#[instrument(skip(settings), fields(max_connections = settings.db_max_connections), err)]
pub async fn connect(settings: &Settings) -> Result<Arc<PgPool>, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    health_check(&pool).await?;
    info!("database pool ready");
    Ok(Arc::new(pool))
}

pub async fn health_check(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("health_check", e))?;
    Ok(())
}

/// Apply the bundled schema. Statements are idempotent.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}
