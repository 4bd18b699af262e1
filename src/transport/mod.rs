//! Realtime transport seam.
//!
//! A transport opens one backend channel per channel name and pushes every
//! matching change event into the [`Dispatcher`] it was given. It owns the
//! connection; callers only keep the [`ChannelHandle`] needed to close it.

use crate::channel::{ChannelFilter, ChannelName};
use crate::error::RealtimeResult;
use crate::models::ChangeEvent;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTransport;
pub use postgres::PgTransport;

type EventFn = dyn Fn(ChangeEvent) + Send + Sync;
type ClosedFn = dyn Fn(String) + Send + Sync;

/// Callbacks a transport invokes for one open channel
#[derive(Clone)]
pub struct Dispatcher {
    on_event: Arc<EventFn>,
    on_closed: Arc<ClosedFn>,
}

impl Dispatcher {
    pub fn new<E, C>(on_event: E, on_closed: C) -> Self
    where
        E: Fn(ChangeEvent) + Send + Sync + 'static,
        C: Fn(String) + Send + Sync + 'static,
    {
        Self {
            on_event: Arc::new(on_event),
            on_closed: Arc::new(on_closed),
        }
    }

    /// Forward one backend event
    pub fn dispatch(&self, event: ChangeEvent) {
        (self.on_event)(event)
    }

    /// Report that the backend channel died without being closed by us
    pub fn closed(&self, reason: impl Into<String>) {
        (self.on_closed)(reason.into())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Opaque handle to one open backend channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: u64,
    channel: ChannelName,
}

impl ChannelHandle {
    pub fn new(id: u64, channel: ChannelName) -> Self {
        Self { id, channel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a backend channel delivering events that match `filter`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelOpen` if the backend refuses or cannot be reached.
    async fn open_channel(
        &self,
        channel: &ChannelName,
        filter: &ChannelFilter,
        dispatcher: Dispatcher,
    ) -> RealtimeResult<ChannelHandle>;

    /// Close a channel. Closing an unknown or already closed handle is a no-op.
    async fn close_channel(&self, handle: &ChannelHandle) -> RealtimeResult<()>;
}
