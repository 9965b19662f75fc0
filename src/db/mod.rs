//! Postgres persistence for jobs and per-backend answers.

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod queries;
pub mod store;

pub use queries::PgJobStore;
pub use store::{JobStore, StoreError};

/// Open the connection pool. The pipeline holds a connection only for single
/// statements, so `max_connections` mostly bounds concurrent answer upserts.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(2))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Apply `migrations/` (jobs and answers tables).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
