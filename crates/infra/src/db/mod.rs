//! Postgres pool and schema wiring.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;

const LEDGER_SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    info!(max_connections = config.max_connections, "database pool ready");
    Ok(pool)
}

/// Create missing tables and indexes.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(LEDGER_SCHEMA).execute(pool).await?;
    info!("ledger schema applied");
    Ok(())
}
