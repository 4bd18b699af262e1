use thiserror::Error;
use uuid::Uuid;

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[derive(Debug, Error, Clone)]
pub enum RealtimeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("stream kind {kind} requires a scope id")]
    InvalidScope { kind: &'static str },

    #[error("failed to open channel {channel}: {reason}")]
    ChannelOpen { channel: String, reason: String },

    #[error("backend read failed: {0}")]
    BackendRead(String),

    #[error("backend write failed: {0}")]
    BackendWrite(String),

    #[error("update failed: {0}")]
    Update(String),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

impl RealtimeError {
    /// Whether retrying the same call has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::ChannelOpen { .. })
    }
}
