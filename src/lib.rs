pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod multiplexer;
pub mod reconnect;
pub mod repository;
pub mod services;
pub mod state;
pub mod transport;

pub use channel::{ChannelName, ChannelSpec, StreamKind};
pub use error::{RealtimeError, RealtimeResult};
pub use multiplexer::{ConnectionStatus, SubscriptionMultiplexer, SubscriptionToken};
