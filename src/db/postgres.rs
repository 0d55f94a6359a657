use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

/// Opens the Postgres pool shared by reads and batch commits
///
/// Size it to the per-chunk user concurrency; a ranking task waiting on a
/// connection still counts against its call timeout.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Applies the migrations embedded from `./migrations`
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
