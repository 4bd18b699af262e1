use crate::config::Config;
use crate::multiplexer::SubscriptionMultiplexer;
use crate::repository::{PgStorefrontRepository, StorefrontRepository};
use crate::services::OutboundService;
use crate::transport::{PgTransport, RealtimeTransport};
use sqlx::PgPool;
use std::sync::Arc;

/// Services shared by every consumer, built once at startup and passed around
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub realtime: SubscriptionMultiplexer,
    pub outbound: OutboundService,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn RealtimeTransport>,
        repo: Arc<dyn StorefrontRepository>,
    ) -> Self {
        let realtime = SubscriptionMultiplexer::with_policy(transport, config.reconnect.policy());
        Self {
            config,
            realtime,
            outbound: OutboundService::new(repo),
        }
    }

    /// Wire the Postgres-backed transport and store
    pub fn with_postgres(config: Arc<Config>, pool: PgPool) -> Self {
        let transport = Arc::new(PgTransport::new(pool.clone()));
        let repo = Arc::new(PgStorefrontRepository::new(pool));
        Self::new(config, transport, repo)
    }
}
