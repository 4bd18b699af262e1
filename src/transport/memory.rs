/// In-process realtime transport
///
/// Behaves like the hosted backend from the multiplexer's point of view:
/// every `emit` is matched against each open channel's filter and delivered
/// synchronously, with hooks to drop channels and fail opens on demand.
use super::{ChannelHandle, Dispatcher, RealtimeTransport};
use crate::channel::{ChannelFilter, ChannelName};
use crate::error::{RealtimeError, RealtimeResult};
use crate::models::ChangeEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct OpenChannel {
    channel: ChannelName,
    filter: ChannelFilter,
    dispatcher: Dispatcher,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    open: HashMap<u64, OpenChannel>,
    open_calls: Vec<ChannelName>,
    close_calls: Vec<ChannelName>,
    failing_opens: u32,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every open channel whose filter matches.
    ///
    /// Returns the number of channels the event was dispatched to.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        // Dispatch outside the lock: listeners may call back into the transport.
        let targets: Vec<Dispatcher> = {
            let state = self.state.lock();
            state
                .open
                .values()
                .filter(|c| c.filter.matches(&event))
                .map(|c| c.dispatcher.clone())
                .collect()
        };

        for dispatcher in &targets {
            dispatcher.dispatch(event.clone());
        }
        targets.len()
    }

    /// Simulate the backend dropping every open channel for `channel`
    pub fn drop_channel(&self, channel: &ChannelName, reason: &str) -> usize {
        let dropped: Vec<OpenChannel> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .open
                .iter()
                .filter(|(_, c)| &c.channel == channel)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.open.remove(&id))
                .collect()
        };

        for open in &dropped {
            open.dispatcher.closed(reason);
        }
        dropped.len()
    }

    /// Make the next `count` open attempts fail
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    pub fn open_calls(&self, channel: &ChannelName) -> usize {
        let state = self.state.lock();
        state.open_calls.iter().filter(|c| *c == channel).count()
    }

    pub fn total_open_calls(&self) -> usize {
        self.state.lock().open_calls.len()
    }

    pub fn close_calls(&self, channel: &ChannelName) -> usize {
        let state = self.state.lock();
        state.close_calls.iter().filter(|c| *c == channel).count()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn is_open(&self, channel: &ChannelName) -> bool {
        let state = self.state.lock();
        state.open.values().any(|c| &c.channel == channel)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn open_channel(
        &self,
        channel: &ChannelName,
        filter: &ChannelFilter,
        dispatcher: Dispatcher,
    ) -> RealtimeResult<ChannelHandle> {
        let mut state = self.state.lock();
        state.open_calls.push(channel.clone());

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(RealtimeError::ChannelOpen {
                channel: channel.to_string(),
                reason: "backend unavailable".to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.open.insert(
            id,
            OpenChannel {
                channel: channel.clone(),
                filter: filter.clone(),
                dispatcher,
            },
        );

        debug!(channel = %channel, handle = id, "memory channel opened");
        Ok(ChannelHandle::new(id, channel.clone()))
    }

    async fn close_channel(&self, handle: &ChannelHandle) -> RealtimeResult<()> {
        let mut state = self.state.lock();
        state.close_calls.push(handle.channel().clone());
        state.open.remove(&handle.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSpec, StreamKind};
    use crate::models::ChangeType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_respects_filter() {
        let transport = MemoryTransport::new();
        let spec = ChannelSpec::resolve(StreamKind::Chat, Some("c1")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        transport
            .open_channel(
                &spec.name,
                &spec.filter,
                Dispatcher::new(
                    move |_| {
                        hits_clone.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                ),
            )
            .await
            .unwrap();

        let mine = ChangeEvent::new("chat_messages", ChangeType::Insert, json!({"chat_id": "c1"}));
        let other = ChangeEvent::new("chat_messages", ChangeType::Insert, json!({"chat_id": "c2"}));

        assert_eq!(transport.emit(mine), 1);
        assert_eq!(transport.emit(other), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_open_is_counted() {
        let transport = MemoryTransport::new();
        let spec = ChannelSpec::resolve(StreamKind::ProductUpdates, None).unwrap();
        transport.fail_next_opens(1);

        let first = transport
            .open_channel(&spec.name, &spec.filter, Dispatcher::new(|_| {}, |_| {}))
            .await;
        let second = transport
            .open_channel(&spec.name, &spec.filter, Dispatcher::new(|_| {}, |_| {}))
            .await;

        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(transport.open_calls(&spec.name), 2);
        assert_eq!(transport.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_drop_channel_reports_closed() {
        let transport = MemoryTransport::new();
        let spec = ChannelSpec::resolve(StreamKind::ProductUpdates, None).unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();

        transport
            .open_channel(
                &spec.name,
                &spec.filter,
                Dispatcher::new(
                    |_| {},
                    move |_| {
                        closed_clone.fetch_add(1, Ordering::SeqCst);
                    },
                ),
            )
            .await
            .unwrap();

        assert_eq!(transport.drop_channel(&spec.name, "socket reset"), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!transport.is_open(&spec.name));
    }
}
