/// Outbound writes: notifications, chat messages and order status changes
///
/// Every call issues its own store writes; nothing here is multiplexed.
/// Subscribers see the results through the realtime channels once the
/// store publishes the row changes.
use crate::error::{RealtimeError, RealtimeResult};
use crate::models::{
    ChatMessage, Notification, NotificationKind, OrderStatus, OrderStatusChange,
};
use crate::repository::StorefrontRepository;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Row to publish through the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Notification {
        user_id: Uuid,
        title: String,
        message: String,
        kind: NotificationKind,
    },
    Chat {
        chat_id: Uuid,
        sender_id: Uuid,
        message: String,
    },
}

#[derive(Clone)]
pub struct OutboundService {
    repo: Arc<dyn StorefrontRepository>,
}

impl OutboundService {
    pub fn new(repo: Arc<dyn StorefrontRepository>) -> Self {
        Self { repo }
    }

    pub async fn publish(&self, message: OutboundMessage) -> RealtimeResult<()> {
        match message {
            OutboundMessage::Notification {
                user_id,
                title,
                message,
                kind,
            } => self
                .send_notification(user_id, &title, &message, kind)
                .await
                .map(|_| ()),
            OutboundMessage::Chat {
                chat_id,
                sender_id,
                message,
            } => self
                .send_chat_message(chat_id, sender_id, &message)
                .await
                .map(|_| ()),
        }
    }

    /// Insert a notification for `user_id`
    ///
    /// # Errors
    ///
    /// `BackendWrite` when the store rejects the insert; the failure is logged.
    pub async fn send_notification(
        &self,
        user_id: Uuid,
        title: &str,
        message: &str,
        kind: NotificationKind,
    ) -> RealtimeResult<Notification> {
        let notification = Notification::new(user_id, title, message, kind);

        if let Err(e) = self.repo.insert_notification(&notification).await {
            error!(user_id = %user_id, error = %e, "Failed to send notification");
            return Err(e);
        }

        info!(notification_id = %notification.id, user_id = %user_id, kind = kind.as_str(), "Notification sent");
        Ok(notification)
    }

    /// Insert a chat message into `chat_id`
    pub async fn send_chat_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        message: &str,
    ) -> RealtimeResult<ChatMessage> {
        let chat_message = ChatMessage::new(chat_id, sender_id, message);

        if let Err(e) = self.repo.insert_chat_message(&chat_message).await {
            error!(chat_id = %chat_id, sender_id = %sender_id, error = %e, "Failed to send chat message");
            return Err(e);
        }

        info!(message_id = %chat_message.id, chat_id = %chat_id, "Chat message sent");
        Ok(chat_message)
    }

    /// Move an order to `new_status`, record the change, and tell the customer.
    ///
    /// Steps run in order without a transaction: read, update, audit, notify.
    /// A failed read stops before any write; a failed update stops before the
    /// audit. The customer notification is best effort and never fails the call.
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor_id: Uuid,
    ) -> RealtimeResult<OrderStatusChange> {
        let order = self
            .repo
            .fetch_order(order_id)
            .await?
            .ok_or(RealtimeError::OrderNotFound(order_id))?;

        let now = Utc::now();
        self.repo
            .update_order_status(order_id, new_status, now)
            .await?;

        let change = OrderStatusChange {
            order_id,
            old_status: order.status,
            new_status,
            changed_by: actor_id,
            created_at: now,
        };
        self.repo.insert_status_change(&change).await?;

        info!(
            order_id = %order_id,
            order_number = %order.order_number,
            old_status = %order.status,
            new_status = %new_status,
            actor_id = %actor_id,
            "Order status updated"
        );

        let message = format!(
            "Your order {} is now {}.",
            order.order_number,
            new_status.label()
        );
        if let Err(e) = self
            .send_notification(
                order.user_id,
                "Order Status Updated",
                &message,
                NotificationKind::OrderUpdate,
            )
            .await
        {
            warn!(order_id = %order_id, error = %e, "Order status notification not delivered");
        }

        Ok(change)
    }
}
