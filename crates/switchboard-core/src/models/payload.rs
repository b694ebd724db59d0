//! Versioned JSON payloads.
//!
//! Task payloads and results, approval content and workflow context are all
//! stored as a JSON document tagged with a schema version. Consumers decode
//! only the shapes they produce or understand via [`Payload::decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Schema version stamped on every payload written by this crate.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: u32,
    pub data: Value,
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl Payload {
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn new(data: Value) -> Self {
        Self {
            version: PAYLOAD_SCHEMA_VERSION,
            data,
        }
    }

    /// Encode a typed value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, CoreError> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Decode the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CoreError::BadRequest(format!(
                "Payload (schema v{}) does not match expected shape: {}",
                self.version, e
            ))
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|m| m.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Return a copy with `overlay`'s keys written over this payload's keys.
    /// A non-object payload is treated as empty.
    pub fn merged(&self, overlay: Map<String, Value>) -> Self {
        let mut base = match &self.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        base.extend(overlay);
        Self::new(Value::Object(base))
    }

    /// Serialized column form: `{"version":1,"data":{...}}`.
    pub fn to_column(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the column form. Bare JSON documents written before versioning
    /// are read as schema version 0; anything unparseable reads as empty.
    pub fn from_column(raw: &str) -> Self {
        if let Ok(payload) = serde_json::from_str::<Payload>(raw) {
            return payload;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(data) => Self { version: 0, data },
            Err(e) => {
                tracing::warn!(
                    raw_len = raw.len(),
                    "[Payload] Unreadable payload column ({} bytes), reading as empty: {}",
                    raw.len(),
                    e
                );
                Self::empty()
            }
        }
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Brief {
        keyword: String,
        words: u32,
    }

    #[test]
    fn test_decode_typed_view() {
        let payload = Payload::new(json!({ "keyword": "rust crm", "words": 1200, "extra": true }));
        let brief: Brief = payload.decode().unwrap();
        assert_eq!(brief.keyword, "rust crm");
        assert_eq!(brief.words, 1200);
    }

    #[test]
    fn test_decode_mismatch_is_bad_request() {
        let payload = Payload::new(json!({ "keyword": 7 }));
        let err = payload.decode::<Brief>().unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[test]
    fn test_merged_overlay_wins() {
        let payload = Payload::new(json!({ "tone": "casual", "workflow_id": "stale" }));
        let mut overlay = Map::new();
        overlay.insert("workflow_id".into(), json!("wf-1"));
        let merged = payload.merged(overlay);
        assert_eq!(merged.get_str("tone"), Some("casual"));
        assert_eq!(merged.get_str("workflow_id"), Some("wf-1"));
    }

    #[test]
    fn test_legacy_column_reads_as_version_zero() {
        let payload = Payload::from_column(r#"{"workflow_id":"wf-9"}"#);
        assert_eq!(payload.version, 0);
        assert_eq!(payload.get_str("workflow_id"), Some("wf-9"));

        let current = Payload::from_column(&Payload::new(json!({ "a": 1 })).to_column());
        assert_eq!(current.version, PAYLOAD_SCHEMA_VERSION);
        assert_eq!(current.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_corrupt_column_reads_as_empty() {
        let payload = Payload::from_column("{\"version\":1,\"data\":{\"topic\"");
        assert_eq!(payload.version, PAYLOAD_SCHEMA_VERSION);
        assert_eq!(payload.data, json!({}));
    }
}
