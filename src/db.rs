use crate::config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url)
        .await?;

    info!(max_connections = config.max_connections, "Database pool ready");
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
