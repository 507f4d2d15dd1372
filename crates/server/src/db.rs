use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create the PostgreSQL connection pool and run migrations.
pub async fn init_pg_pool(config: &choreo_core::config::DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    info!("PostgreSQL connected");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Database migrations applied successfully");

    Ok(pool)
}
