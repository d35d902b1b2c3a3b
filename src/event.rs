//! Normalized change events.
//!
//! Both ingestion surfaces produce the same record: the trigger path emits a
//! JSON payload over a notification channel, and the replication path emits
//! wal2json (format version 2) rows. Either way the engine sees a
//! [`ChangeEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TgOp {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "TRUNCATE")]
    Truncate,
}

impl std::fmt::Display for TgOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TgOp::Insert => write!(f, "INSERT"),
            TgOp::Update => write!(f, "UPDATE"),
            TgOp::Delete => write!(f, "DELETE"),
            TgOp::Truncate => write!(f, "TRUNCATE"),
        }
    }
}

/// One normalized row change.
///
/// `old` and `new` carry the primary-key and foreign-key columns only; the
/// synthesizer re-reads current row state, so full row content is never
/// required. For DELETE only `old` is set, for INSERT only `new`, for UPDATE
/// both. TRUNCATE carries no row payload and no transaction id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub tg_op: TgOp,
    pub schema: String,
    pub table: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub old: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub new: Map<String, Value>,
    /// Transaction id at which the change committed.
    #[serde(default)]
    pub xmin: Option<u64>,
    /// Target indexes whose trees contain the table; set by the trigger.
    #[serde(default)]
    pub indices: Vec<String>,
}

/// The trigger function emits `"old": null` for non-UPDATE operations.
fn nullable_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

impl ChangeEvent {
    /// The row identity payload for this operation: `new` for INSERT/UPDATE,
    /// `old` for DELETE.
    pub fn data(&self) -> &Map<String, Value> {
        match self.tg_op {
            TgOp::Delete => &self.old,
            _ => &self.new,
        }
    }

    /// Parse a trigger notification payload.
    pub fn from_notification(payload: &str) -> Result<ChangeEvent, SyncError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Normalize one wal2json (format version 2) record. Returns `None` for
    /// records that are not row changes (begin/commit/message frames).
    pub fn from_wal2json(record: &Value) -> Result<Option<ChangeEvent>, SyncError> {
        let action = record
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Serde(serde::de::Error::custom("missing wal2json action")))?;

        let tg_op = match action {
            "I" => TgOp::Insert,
            "U" => TgOp::Update,
            "D" => TgOp::Delete,
            "T" => TgOp::Truncate,
            // B, C and M frames carry no row change
            _ => return Ok(None),
        };

        let schema = record
            .get("schema")
            .and_then(Value::as_str)
            .unwrap_or("public")
            .to_string();
        let table = record
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Serde(serde::de::Error::custom("missing wal2json table")))?
            .to_string();
        let xmin = record.get("xid").and_then(Value::as_u64);

        let new = match tg_op {
            TgOp::Insert | TgOp::Update => columns_to_map(record.get("columns")),
            _ => Map::new(),
        };
        let old = match tg_op {
            TgOp::Update | TgOp::Delete => columns_to_map(record.get("identity")),
            _ => Map::new(),
        };

        Ok(Some(ChangeEvent {
            tg_op,
            schema,
            table,
            old,
            new,
            xmin,
            indices: Vec::new(),
        }))
    }

    /// Canonical string form of the given columns' values, in order. `None`
    /// when any value is absent or null (a null key cannot identify a row).
    pub fn key_values(source: &Map<String, Value>, columns: &[String]) -> Option<Vec<String>> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            match source.get(column) {
                Some(Value::Null) | None => return None,
                Some(value) => values.push(canonical_string(value)),
            }
        }
        Some(values)
    }
}

/// Canonical text form of a key value, matching Postgres `CAST(x AS text)`
/// for the types usable as keys.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn columns_to_map(columns: Option<&Value>) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(Value::Array(entries)) = columns {
        for entry in entries {
            if let (Some(name), Some(value)) = (
                entry.get("name").and_then(Value::as_str),
                entry.get("value"),
            ) {
                map.insert(name.to_string(), value.clone());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_roundtrip() {
        let payload = r#"{
            "tg_op": "UPDATE",
            "schema": "public",
            "table": "author",
            "old": {"id": 2},
            "new": {"id": 2},
            "xmin": 1234,
            "indices": ["bookstore"]
        }"#;
        let event = ChangeEvent::from_notification(payload).unwrap();
        assert_eq!(event.tg_op, TgOp::Update);
        assert_eq!(event.table, "author");
        assert_eq!(event.xmin, Some(1234));
        assert_eq!(event.data().get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_notification_null_old() {
        let payload = r#"{
            "tg_op": "INSERT", "schema": "public", "table": "book",
            "old": null, "new": {"isbn": "123"}, "xmin": 7, "indices": []
        }"#;
        let event = ChangeEvent::from_notification(payload).unwrap();
        assert!(event.old.is_empty());
        assert_eq!(event.data().get("isbn"), Some(&json!("123")));
    }

    #[test]
    fn test_wal2json_insert() {
        let record = json!({
            "action": "I",
            "xid": 5678,
            "schema": "public",
            "table": "book",
            "columns": [
                {"name": "isbn", "type": "character varying", "value": "9788374950978"},
                {"name": "title", "type": "character varying", "value": "Kafka on the Shore"}
            ]
        });
        let event = ChangeEvent::from_wal2json(&record).unwrap().unwrap();
        assert_eq!(event.tg_op, TgOp::Insert);
        assert_eq!(event.xmin, Some(5678));
        assert_eq!(event.new.get("isbn"), Some(&json!("9788374950978")));
        assert!(event.old.is_empty());
    }

    #[test]
    fn test_wal2json_delete_uses_identity() {
        let record = json!({
            "action": "D",
            "xid": 42,
            "schema": "public",
            "table": "book",
            "identity": [
                {"name": "isbn", "type": "character varying", "value": "9781471331435"}
            ]
        });
        let event = ChangeEvent::from_wal2json(&record).unwrap().unwrap();
        assert_eq!(event.tg_op, TgOp::Delete);
        assert_eq!(event.old.get("isbn"), Some(&json!("9781471331435")));
        assert_eq!(event.data().get("isbn"), Some(&json!("9781471331435")));
    }

    #[test]
    fn test_wal2json_transaction_frames_skipped() {
        assert!(ChangeEvent::from_wal2json(&json!({"action": "B", "xid": 1}))
            .unwrap()
            .is_none());
        assert!(ChangeEvent::from_wal2json(&json!({"action": "C", "xid": 1}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_key_values() {
        let mut map = Map::new();
        map.insert("isbn".to_string(), json!("123"));
        map.insert("n".to_string(), json!(5));
        assert_eq!(
            ChangeEvent::key_values(&map, &["isbn".to_string(), "n".to_string()]),
            Some(vec!["123".to_string(), "5".to_string()])
        );
        assert_eq!(
            ChangeEvent::key_values(&map, &["missing".to_string()]),
            None
        );
    }
}
