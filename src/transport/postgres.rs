/// Postgres LISTEN/NOTIFY realtime transport
///
/// Each open channel owns a dedicated `PgListener` connection listening on
/// `realtime_<table>`. Rows are published by the `storefront_notify_change()`
/// trigger installed by the migrations; the channel filter is applied here
/// before dispatch.
///
/// NOTIFY payloads are limited to 8000 bytes, so very wide rows are dropped by
/// Postgres before they ever reach this transport.
use super::{ChannelHandle, Dispatcher, RealtimeTransport};
use crate::channel::{ChannelFilter, ChannelName};
use crate::error::{RealtimeError, RealtimeResult};
use crate::models::ChangeEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Postgres notification channel carrying changes of `table`
pub fn notify_channel(table: &str) -> String {
    format!("realtime_{table}")
}

pub struct PgTransport {
    pool: PgPool,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl PgTransport {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

async fn listen_loop(
    mut listener: PgListener,
    channel: ChannelName,
    filter: ChannelFilter,
    dispatcher: Dispatcher,
) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                let payload = notification.payload();
                let event = match ChangeEvent::from_json(payload) {
                    Ok(e) => e,
                    Err(e) => {
                        error!(error = ?e, channel = %channel, payload = %payload, "Failed to decode change event");
                        continue;
                    }
                };

                if !filter.matches(&event) {
                    continue;
                }

                debug!(
                    channel = %channel,
                    table = %event.table,
                    event_type = %event.event_type,
                    "Dispatching change event"
                );
                dispatcher.dispatch(event);
            }
            Ok(None) => {
                // Notifications sent while the connection was down are lost;
                // hand the channel back so it can be re-opened and resynced.
                warn!(channel = %channel, "Listener connection lost");
                dispatcher.closed("listener connection lost");
                return;
            }
            Err(e) => {
                error!(error = ?e, channel = %channel, "Listener failed");
                dispatcher.closed(e.to_string());
                return;
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for PgTransport {
    async fn open_channel(
        &self,
        channel: &ChannelName,
        filter: &ChannelFilter,
        dispatcher: Dispatcher,
    ) -> RealtimeResult<ChannelHandle> {
        let open_error = |e: sqlx::Error| RealtimeError::ChannelOpen {
            channel: channel.to_string(),
            reason: e.to_string(),
        };

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(open_error)?;
        let pg_channel = notify_channel(&filter.table);
        listener.listen(&pg_channel).await.map_err(open_error)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(listen_loop(
            listener,
            channel.clone(),
            filter.clone(),
            dispatcher,
        ));
        self.tasks.lock().insert(id, task);

        info!(
            channel = %channel,
            pg_channel = %pg_channel,
            event = %filter.event,
            row_filter = ?filter.row_filter.as_ref().map(|f| f.to_string()),
            "Realtime channel opened"
        );
        Ok(ChannelHandle::new(id, channel.clone()))
    }

    async fn close_channel(&self, handle: &ChannelHandle) -> RealtimeResult<()> {
        let task = self.tasks.lock().remove(&handle.id());
        if let Some(task) = task {
            // Dropping the listener inside the task closes its connection.
            task.abort();
            info!(channel = %handle.channel(), "Realtime channel closed");
        }
        Ok(())
    }
}

impl Drop for PgTransport {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}
