//! Shared infrastructure for the Wildpatch workspace.
//!
//! Database pool creation, migrations and environment helpers used by the
//! api and worker binaries.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Create a connection pool against the given Postgres URL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, SharedError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    tracing::info!("Database pool created");
    Ok(pool)
}

/// Run the workspace migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), SharedError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Migrations up to date");
    Ok(())
}

/// Read a required environment variable.
pub fn require_env(name: &'static str) -> Result<String, SharedError> {
    std::env::var(name).map_err(|_| SharedError::MissingEnv(name))
}

/// Read an environment variable with a fallback.
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
