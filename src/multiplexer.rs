use crate::channel::{ChannelName, ChannelSpec, StreamKind};
use crate::error::RealtimeResult;
use crate::models::ChangeEvent;
use crate::reconnect::{with_backoff, ReconnectPolicy};
use crate::transport::{ChannelHandle, Dispatcher, RealtimeTransport};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback receiving every event of one channel
pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Unique identifier for one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by `subscribe`; identifies exactly one listener registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    channel: ChannelName,
    listener: ListenerId,
}

impl SubscriptionToken {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected { channels: Vec<ChannelName> },
}

/// One active backend channel together with its listener set.
///
/// Keeping both in one entry makes "listener set exists iff subscription
/// exists" structural.
struct Subscription {
    spec: ChannelSpec,
    handle: Option<ChannelHandle>,
    /// Bumped on every (re)open; events and close reports from older opens are ignored
    generation: u64,
    connected: bool,
    listeners: Vec<(ListenerId, Listener)>,
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    registry: RwLock<HashMap<ChannelName, Subscription>>,
    /// Serializes backend open/close so one name never gets two channels
    lifecycle: Mutex<()>,
    /// Keeps reconnect runs from interleaving
    reconnect_lock: Mutex<()>,
    next_generation: AtomicU64,
    reconnecting: AtomicBool,
}

/// Realtime subscription multiplexer
///
/// Collapses every local listener interested in the same `(kind, scope)`
/// stream onto a single backend channel and fans backend events out to them.
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<Inner>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self::with_policy(transport, ReconnectPolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn RealtimeTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                registry: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(()),
                reconnect_lock: Mutex::new(()),
                next_generation: AtomicU64::new(1),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Register `listener` for the `(kind, scope)` stream.
    ///
    /// Opens a backend channel only if none is active for the resolved name;
    /// otherwise the listener joins the existing set.
    ///
    /// # Errors
    ///
    /// * `InvalidScope` - a scoped kind was given no scope id
    /// * `ChannelOpen` - the backend channel could not be opened; nothing is registered
    pub async fn subscribe<F>(
        &self,
        kind: StreamKind,
        scope: Option<&str>,
        listener: F,
    ) -> RealtimeResult<SubscriptionToken>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let spec = ChannelSpec::resolve(kind, scope)?;
        let name = spec.name.clone();
        let listener_id = ListenerId::new();
        let listener: Listener = Arc::new(listener);
        let token = SubscriptionToken {
            channel: name.clone(),
            listener: listener_id,
        };

        let _lifecycle = self.inner.lifecycle.lock().await;
        let generation = self.next_generation();

        {
            let mut registry = self.inner.registry.write();
            if let Some(subscription) = registry.get_mut(&name) {
                subscription.listeners.push((listener_id, listener));
                debug!(
                    channel = %name,
                    listeners = subscription.listeners.len(),
                    "Joined existing channel"
                );
                return Ok(token);
            }

            // Registered before the open so events racing the open are not lost.
            registry.insert(
                name.clone(),
                Subscription {
                    spec: spec.clone(),
                    handle: None,
                    generation,
                    connected: true,
                    listeners: vec![(listener_id, listener)],
                },
            );
        }

        match self.open(&spec, generation).await {
            Ok(handle) => {
                if let Some(subscription) = self.inner.registry.write().get_mut(&name) {
                    subscription.handle = Some(handle);
                }
                info!(channel = %name, kind = %kind, "Subscribed to realtime channel");
                Ok(token)
            }
            Err(e) => {
                self.inner.registry.write().remove(&name);
                error!(channel = %name, error = %e, "Failed to open realtime channel");
                Err(e)
            }
        }
    }

    /// Deliver `event` to every listener of `channel`, in registration order.
    ///
    /// Runs on the caller. A panicking listener is logged and skipped.
    /// Returns the number of listeners that completed.
    pub fn notify(&self, channel: &ChannelName, event: &ChangeEvent) -> usize {
        self.deliver(channel, None, event)
    }

    /// Remove exactly the listener behind `token`. The backend channel stays open.
    pub fn unregister(&self, token: &SubscriptionToken) -> bool {
        let mut registry = self.inner.registry.write();
        let Some(subscription) = registry.get_mut(&token.channel) else {
            return false;
        };

        let before = subscription.listeners.len();
        subscription.listeners.retain(|(id, _)| *id != token.listener);
        let removed = subscription.listeners.len() != before;

        if removed {
            debug!(
                channel = %token.channel,
                remaining = subscription.listeners.len(),
                "Removed listener"
            );
        }
        removed
    }

    /// Close the backend channel for `channel` and drop all of its listeners.
    ///
    /// Unknown names are ignored. Bookkeeping is removed even when the
    /// backend close fails; the failure is still returned.
    pub async fn unsubscribe(&self, channel: &ChannelName) -> RealtimeResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let Some(subscription) = self.inner.registry.write().remove(channel) else {
            debug!(channel = %channel, "Unsubscribe for inactive channel ignored");
            return Ok(());
        };

        let result = self.close(subscription.handle.as_ref()).await;
        info!(
            channel = %channel,
            listeners = subscription.listeners.len(),
            "Unsubscribed from realtime channel"
        );
        result
    }

    /// Close every active channel and clear all bookkeeping.
    ///
    /// Returns the number of channels torn down, or the first close failure
    /// once everything has been cleared.
    pub async fn unsubscribe_all(&self) -> RealtimeResult<usize> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let drained: Vec<(ChannelName, Subscription)> =
            self.inner.registry.write().drain().collect();
        let count = drained.len();

        let mut first_error = None;
        for (name, subscription) in drained {
            if let Err(e) = self.close(subscription.handle.as_ref()).await {
                warn!(channel = %name, error = %e, "Failed to close channel during teardown");
                first_error.get_or_insert(e);
            }
        }

        info!(count, "Unsubscribed from all realtime channels");
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Re-open every active channel, keeping its listeners.
    ///
    /// Each channel is retried under the reconnect policy. The lifecycle lock
    /// is only held to detach the old handle and never across backoff sleeps,
    /// so teardown can proceed while a retry is pending. Channels that could
    /// not be re-opened, or whose reconnect was cancelled, stay marked
    /// disconnected.
    pub async fn reconnect(&self) -> RealtimeResult<usize> {
        let _reconnect = self.inner.reconnect_lock.lock().await;
        let _flag = ReconnectingFlag::raise(&self.inner.reconnecting);

        let active: Vec<ChannelSpec> = self
            .inner
            .registry
            .read()
            .values()
            .map(|s| s.spec.clone())
            .collect();

        let mut reopened = 0;
        let mut last_error = None;

        for spec in active {
            let Some(generation) = self.detach(&spec.name).await else {
                continue;
            };

            let result = with_backoff(&self.inner.policy, || self.open(&spec, generation)).await;
            match result {
                Ok(handle) => match self.attach(&spec.name, generation, handle) {
                    Ok(()) => reopened += 1,
                    Err(orphan) => {
                        debug!(channel = %spec.name, "Channel torn down while re-opening");
                        if let Err(e) = self.close(Some(&orphan)).await {
                            debug!(channel = %spec.name, error = %e, "Closing orphaned channel failed");
                        }
                    }
                },
                Err(e) => {
                    error!(channel = %spec.name, error = %e, "Failed to re-open realtime channel");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => {
                info!(reopened, "Realtime channels re-opened");
                Ok(reopened)
            }
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if self.inner.reconnecting.load(Ordering::SeqCst) {
            return ConnectionStatus::Reconnecting;
        }

        let registry = self.inner.registry.read();
        let mut channels: Vec<ChannelName> = registry
            .iter()
            .filter(|(_, s)| !s.connected)
            .map(|(name, _)| name.clone())
            .collect();

        if channels.is_empty() {
            ConnectionStatus::Connected
        } else {
            channels.sort();
            ConnectionStatus::Disconnected { channels }
        }
    }

    pub fn is_active(&self, channel: &ChannelName) -> bool {
        self.inner.registry.read().contains_key(channel)
    }

    pub fn active_channels(&self) -> Vec<ChannelName> {
        let mut names: Vec<ChannelName> = self.inner.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn listener_count(&self, channel: &ChannelName) -> usize {
        self.inner
            .registry
            .read()
            .get(channel)
            .map(|s| s.listeners.len())
            .unwrap_or(0)
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark `channel` disconnected under a fresh generation and close its old handle.
    ///
    /// Returns `None` if the channel was unsubscribed in the meantime.
    async fn detach(&self, channel: &ChannelName) -> Option<u64> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let (generation, old_handle) = {
            let mut registry = self.inner.registry.write();
            let subscription = registry.get_mut(channel)?;
            let generation = self.next_generation();
            subscription.generation = generation;
            subscription.connected = false;
            (generation, subscription.handle.take())
        };

        if let Err(e) = self.close(old_handle.as_ref()).await {
            debug!(channel = %channel, error = %e, "Closing stale channel failed");
        }
        Some(generation)
    }

    /// Install a re-opened handle if `channel` is still on `generation`.
    ///
    /// Hands the handle back when the channel was torn down or re-subscribed
    /// while the open was in flight.
    fn attach(
        &self,
        channel: &ChannelName,
        generation: u64,
        handle: ChannelHandle,
    ) -> Result<(), ChannelHandle> {
        let mut registry = self.inner.registry.write();
        match registry.get_mut(channel) {
            Some(subscription) if subscription.generation == generation => {
                subscription.handle = Some(handle);
                subscription.connected = true;
                Ok(())
            }
            _ => Err(handle),
        }
    }

    #[cfg(test)]
    fn generation_of(&self, channel: &ChannelName) -> Option<u64> {
        self.inner
            .registry
            .read()
            .get(channel)
            .map(|s| s.generation)
    }

    async fn open(&self, spec: &ChannelSpec, generation: u64) -> RealtimeResult<ChannelHandle> {
        let dispatcher = dispatcher_for(Arc::downgrade(&self.inner), spec.name.clone(), generation);
        self.inner
            .transport
            .open_channel(&spec.name, &spec.filter, dispatcher)
            .await
    }

    async fn close(&self, handle: Option<&ChannelHandle>) -> RealtimeResult<()> {
        match handle {
            Some(handle) => self.inner.transport.close_channel(handle).await,
            None => Ok(()),
        }
    }

    fn deliver(&self, channel: &ChannelName, generation: Option<u64>, event: &ChangeEvent) -> usize {
        deliver(&self.inner, channel, generation, event)
    }
}

/// Raised for the duration of one `reconnect`, lowered on drop so a cancelled
/// run does not leave the status stuck on `Reconnecting`.
struct ReconnectingFlag<'a>(&'a AtomicBool);

impl<'a> ReconnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReconnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Build the dispatcher handed to the transport for one open.
///
/// Holds only a weak reference so the transport never keeps the registry alive.
fn dispatcher_for(inner: Weak<Inner>, channel: ChannelName, generation: u64) -> Dispatcher {
    let event_inner = inner.clone();
    let event_channel = channel.clone();

    Dispatcher::new(
        move |event| {
            if let Some(inner) = event_inner.upgrade() {
                deliver(&inner, &event_channel, Some(generation), &event);
            }
        },
        move |reason| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut registry = inner.registry.write();
            if let Some(subscription) = registry.get_mut(&channel) {
                if subscription.generation == generation {
                    subscription.connected = false;
                    warn!(channel = %channel, reason = %reason, "Realtime channel disconnected");
                }
            }
        },
    )
}

fn deliver(
    inner: &Inner,
    channel: &ChannelName,
    generation: Option<u64>,
    event: &ChangeEvent,
) -> usize {
    // Snapshot so listeners run without the lock and may call back into the multiplexer.
    let listeners: Vec<(ListenerId, Listener)> = {
        let registry = inner.registry.read();
        match registry.get(channel) {
            Some(s) if generation.map_or(true, |g| g == s.generation) => s.listeners.clone(),
            _ => return 0,
        }
    };

    let mut delivered = 0;
    for (id, listener) in &listeners {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(()) => delivered += 1,
            Err(_) => {
                error!(channel = %channel, listener = ?id, "Listener panicked while handling event");
            }
        }
    }

    debug!(channel = %channel, delivered, total = listeners.len(), "Event delivered");
    delivered
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("active_channels", &self.active_channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_failed_open_leaves_no_bookkeeping() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(1);
        let mux = SubscriptionMultiplexer::new(Arc::new(transport.clone()));

        let result = mux.subscribe(StreamKind::Chat, Some("c1"), |_| {}).await;

        assert!(matches!(result, Err(RealtimeError::ChannelOpen { .. })));
        assert!(mux.active_channels().is_empty());
        assert_eq!(mux.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_invalid_scope_opens_nothing() {
        let transport = MemoryTransport::new();
        let mux = SubscriptionMultiplexer::new(Arc::new(transport.clone()));

        let result = mux.subscribe(StreamKind::OrderUpdates, None, |_| {}).await;

        assert!(matches!(result, Err(RealtimeError::InvalidScope { .. })));
        assert_eq!(transport.total_open_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let transport = MemoryTransport::new();
        let mux = SubscriptionMultiplexer::new(Arc::new(transport));
        let token = mux
            .subscribe(StreamKind::ProductUpdates, None, |_| {})
            .await
            .unwrap();

        let current = mux.generation_of(token.channel()).unwrap();
        let event = ChangeEvent::new(
            "products",
            crate::models::ChangeType::Update,
            serde_json::json!({"id": "p1"}),
        );

        assert_eq!(mux.deliver(token.channel(), Some(current), &event), 1);
        assert_eq!(mux.deliver(token.channel(), Some(current + 100), &event), 0);
    }
}
