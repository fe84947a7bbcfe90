//! Payload model for the wal2json output plugin (format version 1).
//!
//! Each row read from the slot carries one transaction document:
//!
//! ```json
//! {"xid": 1042, "change": [{"kind": "insert", "schema": "public", ...}]}
//! ```

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use super::types::{ColumnDatum, SlotChange};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Wal2JsonTransaction {
    #[serde(default)]
    pub xid: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub change: Vec<RawChangeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    Insert,
    Update,
    Delete,
    /// Logical messages, truncates and anything newer plugin versions emit.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawChangeEvent {
    pub kind: RawKind,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Value>,
    #[serde(default)]
    pub oldkeys: Option<OldKeys>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OldKeys {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keytypes: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<Value>,
}

impl RawChangeEvent {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Parses the `data` column of one slot row.
pub fn parse_transaction(change: &SlotChange) -> Result<Wal2JsonTransaction> {
    let mut transaction: Wal2JsonTransaction =
        serde_json::from_str(&change.data).map_err(|e| Error::InvalidMessage {
            message: format!("wal2json payload at {}: {}", change.lsn, e),
        })?;

    // The slot row reports the xid even when include-xids is off.
    if transaction.xid.is_none() {
        transaction.xid = change.xid.parse().ok();
    }

    trace!(
        lsn = %change.lsn,
        xid = ?transaction.xid,
        events = transaction.change.len(),
        "Parsed wal2json transaction"
    );
    Ok(transaction)
}

/// Converts a plugin JSON scalar into its text form.
///
/// wal2json emits numbers and booleans unquoted and everything else as
/// strings; composite values are kept as their JSON text.
pub fn datum_from_json(value: &Value, type_name: &str) -> ColumnDatum {
    let text = match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    };
    ColumnDatum::new(text, type_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slot_change(data: &str) -> SlotChange {
        SlotChange {
            lsn: "0/16B3748".to_string(),
            xid: "571".to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_update_transaction() {
        let data = r#"{
            "xid": 571,
            "change": [{
                "kind": "update",
                "schema": "public",
                "table": "users",
                "columnnames": ["id", "login"],
                "columntypes": ["bigint", "character varying(128)"],
                "columnvalues": [620, "economist"],
                "oldkeys": {
                    "keynames": ["id", "login"],
                    "keytypes": ["bigint", "character varying(128)"],
                    "keyvalues": [3, "driver"]
                }
            }]
        }"#;

        let transaction = parse_transaction(&slot_change(data)).unwrap();
        assert_eq!(transaction.xid, Some(571));
        assert_eq!(transaction.change.len(), 1);

        let event = &transaction.change[0];
        assert_eq!(event.kind, RawKind::Update);
        assert_eq!(event.qualified_table(), "public.users");
        assert_eq!(event.columnvalues, vec![json!(620), json!("economist")]);
        assert_eq!(event.oldkeys.as_ref().unwrap().keyvalues[1], json!("driver"));
    }

    #[test]
    fn test_xid_falls_back_to_slot_row() {
        let transaction = parse_transaction(&slot_change(r#"{"change": []}"#)).unwrap();
        assert_eq!(transaction.xid, Some(571));
        assert!(transaction.change.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let data = r#"{"change": [{"kind": "message", "prefix": "audit", "content": "x"}]}"#;
        let transaction = parse_transaction(&slot_change(data)).unwrap();
        assert_eq!(transaction.change[0].kind, RawKind::Other);
    }

    #[test]
    fn test_malformed_payload_is_invalid_message() {
        let err = parse_transaction(&slot_change("{\"change\": [")).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
    }

    #[test]
    fn test_datum_from_json() {
        assert_eq!(datum_from_json(&json!(620), "bigint").value.as_deref(), Some("620"));
        assert_eq!(datum_from_json(&json!(true), "boolean").value.as_deref(), Some("true"));
        assert_eq!(datum_from_json(&json!(null), "text").value, None);
        assert_eq!(datum_from_json(&json!("a"), "text").type_name, "text");
    }
}
