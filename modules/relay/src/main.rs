use idempotency::{IdempotencyService, IdempotencyTracker, InMemoryHashCache, PgIdempotencyStore};
use outbox::PgOutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhooks_rs::PgWebhookRepo;

use relay_rs::{
    bus::connect_bus,
    config::Config,
    db::{init_pool, run_migrations},
    retention::spawn_retention,
    router, start_pipeline, AppState, Components, RelayMetrics,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = ?config.bus_type,
        webhook_subjects = ?config.webhook_subjects,
        "Configuration loaded"
    );

    let pool = init_pool(
        &config.database_url,
        config.db_max_connections,
        config.db_acquire_timeout,
    )
    .await?;
    run_migrations(&pool).await?;
    tracing::info!("Database connected, migrations applied");

    let bus = connect_bus(&config).await?;
    let metrics = RelayMetrics::new()?;

    let outbox = Arc::new(PgOutboxStore::new(pool.clone()));
    let tracker = Arc::new(IdempotencyTracker::new(config.handler_dedup_ttl));
    let idempotency = Arc::new(IdempotencyService::new(
        Arc::new(PgIdempotencyStore::new(pool.clone())),
        Arc::new(InMemoryHashCache::new(config.idempotency_cache_capacity)),
        config.idempotency,
    ));

    let cancel = CancellationToken::new();
    let pipeline = start_pipeline(
        &config,
        Components {
            bus: bus.clone(),
            outbox: outbox.clone(),
            webhooks: Arc::new(PgWebhookRepo::new(pool.clone())),
            tracker: tracker.clone(),
            metrics: Some(metrics.clone()),
        },
        cancel.clone(),
    )
    .await?;
    let sweeper = tracker.spawn_cleanup(Duration::from_secs(60));

    let retention = spawn_retention(
        outbox.clone(),
        idempotency.clone(),
        config.outbox_retention,
        config.maintenance_interval,
        cancel.clone(),
    );

    let app = router(Arc::new(AppState { outbox, metrics }), idempotency);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Relay listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    tracker.stop();
    pipeline.join().await;
    let _ = sweeper.await;
    let _ = retention.await;
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "Failed to close event bus");
    }

    tracing::info!("Relay stopped");
    Ok(())
}
