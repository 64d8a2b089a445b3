use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Connection pool shared by the outbox, idempotency and webhook stores.
/// Keep `DB_MAX_CONNECTIONS` low (1-2) when many relays run against one test database.
pub async fn init_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations").run(pool).await
}
