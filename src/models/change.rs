use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Kind of row change reported by the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw change record delivered by the realtime backend.
///
/// Listeners receive this envelope exactly as the transport decoded it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub event_type: ChangeType,
    #[serde(default)]
    pub record: Option<JsonValue>,
    #[serde(default)]
    pub old_record: Option<JsonValue>,
    pub commit_timestamp: DateTime<Utc>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, event_type: ChangeType, record: JsonValue) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            event_type,
            record: Some(record),
            old_record: None,
            commit_timestamp: Utc::now(),
        }
    }

    /// The row the change is about: the new row, or the old one for deletes
    pub fn row(&self) -> Option<&JsonValue> {
        match self.event_type {
            ChangeType::Delete => self.old_record.as_ref().or(self.record.as_ref()),
            _ => self.record.as_ref().or(self.old_record.as_ref()),
        }
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_trigger_payload() {
        let payload = r#"{
            "schema": "public",
            "table": "orders",
            "type": "UPDATE",
            "record": {"id": "o1", "status": "shipped"},
            "old_record": {"id": "o1", "status": "processing"},
            "commit_timestamp": "2026-01-05T10:00:00Z"
        }"#;

        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.table, "orders");
        assert_eq!(event.event_type, ChangeType::Update);
        assert_eq!(event.row().unwrap()["status"], "shipped");
    }

    #[test]
    fn test_delete_uses_old_record() {
        let event = ChangeEvent {
            schema: "public".into(),
            table: "products".into(),
            event_type: ChangeType::Delete,
            record: None,
            old_record: Some(json!({"id": "p9"})),
            commit_timestamp: Utc::now(),
        };
        assert_eq!(event.row().unwrap()["id"], "p9");
    }

    #[test]
    fn test_schema_defaults_to_public() {
        let payload = r#"{"table":"products","type":"INSERT","record":{},"commit_timestamp":"2026-01-05T10:00:00Z"}"#;
        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.schema, "public");
    }
}
