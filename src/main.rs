use anyhow::Context;
use std::sync::Arc;
use storefront_realtime::{
    config::Config, db, logging, reconnect::ReconnectSupervisor, state::AppState, StreamKind,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let pool = db::init_pool(&cfg.database)
        .await
        .context("failed to initialize database")?;

    let state = AppState::with_postgres(cfg.clone(), pool);

    let products = state
        .realtime
        .subscribe(StreamKind::ProductUpdates, None, |event| {
            tracing::info!(
                table = %event.table,
                event_type = %event.event_type,
                "Catalogue change"
            );
        })
        .await
        .context("failed to subscribe to product updates")?;
    tracing::info!(channel = %products.channel(), "Listening for realtime changes");

    let supervisor = ReconnectSupervisor::spawn(state.realtime.clone(), cfg.reconnect.check_interval());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    supervisor.shutdown().await;
    let closed = state.realtime.unsubscribe_all().await?;
    tracing::info!(closed, "Realtime channels closed");

    Ok(())
}
