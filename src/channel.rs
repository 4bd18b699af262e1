//! Logical channel naming and per-stream backend filters.
//!
//! A channel name is derived only from `(kind, scope)`, so every consumer that
//! asks for the same stream lands on the same backend channel.

use crate::error::{RealtimeError, RealtimeResult};
use crate::models::{ChangeEvent, ChangeType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Logical stream a consumer can subscribe to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Changes to one customer's orders, scoped by user id
    OrderUpdates,
    /// New messages in one chat, scoped by chat id
    Chat,
    /// Catalogue changes, unscoped
    ProductUpdates,
    /// New notifications for one customer, scoped by user id
    Notifications,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::OrderUpdates => "order_updates",
            StreamKind::Chat => "chat",
            StreamKind::ProductUpdates => "product_updates",
            StreamKind::Notifications => "notifications",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            StreamKind::OrderUpdates => "orders",
            StreamKind::Chat => "chat_messages",
            StreamKind::ProductUpdates => "products",
            StreamKind::Notifications => "notifications",
        }
    }

    fn event(&self) -> EventFilter {
        match self {
            StreamKind::OrderUpdates | StreamKind::ProductUpdates => EventFilter::All,
            StreamKind::Chat | StreamKind::Notifications => EventFilter::Only(ChangeType::Insert),
        }
    }

    fn scope_column(&self) -> Option<&'static str> {
        match self {
            StreamKind::OrderUpdates | StreamKind::Notifications => Some("user_id"),
            StreamKind::Chat => Some("chat_id"),
            StreamKind::ProductUpdates => None,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key of one backend channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which change types a channel receives (`*` or a single type)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(ChangeType),
}

impl EventFilter {
    pub fn accepts(&self, event_type: ChangeType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(expected) => *expected == event_type,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => f.write_str("*"),
            EventFilter::Only(t) => write!(f, "{t}"),
        }
    }
}

/// Equality filter on one column of the changed row (`column = value`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &JsonValue) -> bool {
        match row.get(&self.column) {
            Some(JsonValue::String(s)) => *s == self.value,
            Some(JsonValue::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What the backend should deliver on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub row_filter: Option<RowFilter>,
}

impl ChannelFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.schema != self.schema || event.table != self.table {
            return false;
        }
        if !self.event.accepts(event.event_type) {
            return false;
        }
        match (&self.row_filter, event.row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Resolved channel: its registry name plus the backend filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub kind: StreamKind,
    pub name: ChannelName,
    pub filter: ChannelFilter,
}

impl ChannelSpec {
    pub fn resolve(kind: StreamKind, scope: Option<&str>) -> RealtimeResult<Self> {
        let scope = scope
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_scope);

        let (name, row_filter) = match (kind.scope_column(), scope) {
            (None, _) => (kind.as_str().to_string(), None),
            (Some(column), Some(id)) => (
                format!("{}_{}", kind.as_str(), id),
                Some(RowFilter::equals(column, id)),
            ),
            (Some(_), None) => {
                return Err(RealtimeError::InvalidScope {
                    kind: kind.as_str(),
                })
            }
        };

        Ok(Self {
            kind,
            name: ChannelName(name),
            filter: ChannelFilter {
                schema: "public".to_string(),
                table: kind.table().to_string(),
                event: kind.event(),
                row_filter,
            },
        })
    }
}

/// Postgres renders uuids lower-case and hyphenated; other ids pass through.
fn normalize_scope(scope: &str) -> String {
    match Uuid::parse_str(scope) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => scope.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_scope_resolves_to_same_name() {
        let a = ChannelSpec::resolve(StreamKind::OrderUpdates, Some("u1")).unwrap();
        let b = ChannelSpec::resolve(StreamKind::OrderUpdates, Some("u1")).unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.name.as_str(), "order_updates_u1");
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let orders = ChannelSpec::resolve(StreamKind::OrderUpdates, Some("u1")).unwrap();
        let notes = ChannelSpec::resolve(StreamKind::Notifications, Some("u1")).unwrap();
        assert_ne!(orders.name, notes.name);
    }

    #[test]
    fn test_product_updates_ignore_scope() {
        let a = ChannelSpec::resolve(StreamKind::ProductUpdates, None).unwrap();
        let b = ChannelSpec::resolve(StreamKind::ProductUpdates, Some("x")).unwrap();
        assert_eq!(a.name.as_str(), "product_updates");
        assert_eq!(a.name, b.name);
        assert!(a.filter.row_filter.is_none());
    }

    #[test]
    fn test_scoped_kind_requires_scope() {
        let err = ChannelSpec::resolve(StreamKind::Chat, None).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidScope { kind: "chat" }));
        assert!(ChannelSpec::resolve(StreamKind::Chat, Some("  ")).is_err());
    }

    #[test]
    fn test_chat_filter_only_inserts() {
        let spec = ChannelSpec::resolve(StreamKind::Chat, Some("c1")).unwrap();
        assert_eq!(spec.filter.table, "chat_messages");
        assert_eq!(spec.filter.event.to_string(), "INSERT");
        assert_eq!(spec.filter.row_filter.as_ref().unwrap().to_string(), "chat_id=eq.c1");

        let insert = ChangeEvent::new("chat_messages", ChangeType::Insert, json!({"chat_id": "c1"}));
        let update = ChangeEvent::new("chat_messages", ChangeType::Update, json!({"chat_id": "c1"}));
        let other_chat =
            ChangeEvent::new("chat_messages", ChangeType::Insert, json!({"chat_id": "c2"}));

        assert!(spec.filter.matches(&insert));
        assert!(!spec.filter.matches(&update));
        assert!(!spec.filter.matches(&other_chat));
    }

    #[test]
    fn test_order_filter_accepts_any_event_for_owner() {
        let spec = ChannelSpec::resolve(StreamKind::OrderUpdates, Some("u1")).unwrap();
        let update = ChangeEvent::new("orders", ChangeType::Update, json!({"user_id": "u1"}));
        let wrong_table = ChangeEvent::new("products", ChangeType::Update, json!({"user_id": "u1"}));

        assert!(spec.filter.matches(&update));
        assert!(!spec.filter.matches(&wrong_table));
    }

    #[test]
    fn test_uuid_scope_is_case_insensitive() {
        let upper = ChannelSpec::resolve(
            StreamKind::OrderUpdates,
            Some("6F9619FF-8B86-D011-B42D-00C04FC964FF"),
        )
        .unwrap();
        let lower = ChannelSpec::resolve(
            StreamKind::OrderUpdates,
            Some("6f9619ff-8b86-d011-b42d-00c04fc964ff"),
        )
        .unwrap();

        assert_eq!(upper.name, lower.name);
        assert_eq!(
            upper.name.as_str(),
            "order_updates_6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );

        let row = ChangeEvent::new(
            "orders",
            ChangeType::Update,
            json!({"user_id": "6f9619ff-8b86-d011-b42d-00c04fc964ff"}),
        );
        assert!(upper.filter.matches(&row));
    }

    #[test]
    fn test_non_uuid_scope_kept_verbatim() {
        let spec = ChannelSpec::resolve(StreamKind::Chat, Some("Lobby")).unwrap();
        assert_eq!(spec.name.as_str(), "chat_Lobby");
    }

    #[test]
    fn test_row_filter_compares_non_string_values() {
        let filter = RowFilter::equals("chat_id", "42");
        assert!(filter.matches(&json!({"chat_id": 42})));
        assert!(!filter.matches(&json!({"chat_id": null})));
        assert!(!filter.matches(&json!({})));
    }
}
