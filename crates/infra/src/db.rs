//! Postgres pool construction and schema bootstrap.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("../migrations/0001_ledger.sql");

/// Build the shared pool. Called once at startup; the pool is closed on shutdown.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .max_lifetime(config.max_lifetime)
        .connect(&config.url)
        .await?;

    info!(
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        "connected to postgres"
    );
    Ok(pool)
}

/// Create the ledger tables if they do not exist yet.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("ledger schema is up to date");
    Ok(())
}
