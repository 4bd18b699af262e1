use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification type enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Order status changed
    OrderUpdate,
    /// New chat message from support
    Chat,
    /// Product restocked or price changed
    Product,
    /// Everything else
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderUpdate => "order_update",
            NotificationKind::Chat => "chat",
            NotificationKind::Product => "product",
            NotificationKind::System => "system",
        }
    }
}

/// Row of the `notifications` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Row of the `chat_messages` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(chat_id: Uuid, sender_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
