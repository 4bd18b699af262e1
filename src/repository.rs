//! Relational store behind the outbound writes.

use crate::error::{RealtimeError, RealtimeResult};
use crate::models::{ChatMessage, Notification, Order, OrderStatus, OrderStatusChange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// Store operations used by the outbound service.
///
/// Implementations map failures onto the outbound error taxonomy:
/// reads fail with `BackendRead`, the status write with `Update` and
/// inserts with `BackendWrite`.
#[async_trait]
pub trait StorefrontRepository: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> RealtimeResult<()>;

    async fn insert_chat_message(&self, message: &ChatMessage) -> RealtimeResult<()>;

    /// `Ok(None)` when no order has this id
    async fn fetch_order(&self, order_id: Uuid) -> RealtimeResult<Option<Order>>;

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> RealtimeResult<()>;

    async fn insert_status_change(&self, change: &OrderStatusChange) -> RealtimeResult<()>;
}

pub struct PgStorefrontRepository {
    pool: PgPool,
}

impl PgStorefrontRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorefrontRepository for PgStorefrontRepository {
    async fn insert_notification(&self, notification: &Notification) -> RealtimeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, message, kind, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.as_str())
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RealtimeError::BackendWrite(format!("insert notification: {e}")))?;

        debug!(notification_id = %notification.id, user_id = %notification.user_id, "Notification inserted");
        Ok(())
    }

    async fn insert_chat_message(&self, message: &ChatMessage) -> RealtimeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, chat_id, sender_id, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id)
        .bind(message.chat_id)
        .bind(message.sender_id)
        .bind(&message.message)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RealtimeError::BackendWrite(format!("insert chat message: {e}")))?;

        debug!(message_id = %message.id, chat_id = %message.chat_id, "Chat message inserted");
        Ok(())
    }

    async fn fetch_order(&self, order_id: Uuid) -> RealtimeResult<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, order_number, status, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RealtimeError::BackendRead(format!("fetch order {order_id}: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read_err = |e: sqlx::Error| RealtimeError::BackendRead(format!("decode order: {e}"));
        let status: String = row.try_get("status").map_err(read_err)?;

        Ok(Some(Order {
            id: row.try_get("id").map_err(read_err)?,
            user_id: row.try_get("user_id").map_err(read_err)?,
            order_number: row.try_get("order_number").map_err(read_err)?,
            status: status.parse().map_err(RealtimeError::BackendRead)?,
            updated_at: row.try_get("updated_at").map_err(read_err)?,
        }))
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> RealtimeResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RealtimeError::Update(format!("update order {order_id}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(RealtimeError::OrderNotFound(order_id));
        }
        Ok(())
    }

    async fn insert_status_change(&self, change: &OrderStatusChange) -> RealtimeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_status_history (order_id, old_status, new_status, changed_by, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(change.order_id)
        .bind(change.old_status.as_str())
        .bind(change.new_status.as_str())
        .bind(change.changed_by)
        .bind(change.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RealtimeError::BackendWrite(format!("insert status history: {e}")))?;

        Ok(())
    }
}
