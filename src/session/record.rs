//! Persisted TTL record layout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::errors::SessionResult;

/// A stored value with its absolute expiry.
///
/// Serialized as `{"value": <json|null>, "expiry": <epoch-ms>}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Stored value; `null` means "no value".
    pub value: Value,
    /// Expiry as epoch milliseconds.
    pub expiry: i64,
}

impl SessionRecord {
    /// Build a record expiring `ttl_ms` after `now_ms`.
    #[must_use]
    pub const fn new(value: Value, now_ms: i64, ttl_ms: i64) -> Self {
        Self {
            value,
            expiry: now_ms.saturating_add(ttl_ms),
        }
    }

    /// A record is dead once `now > expiry`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expiry
    }

    /// Parse a raw stored string.
    ///
    /// Returns `None` for anything that is not an object with a numeric `expiry`.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        let parsed: Value = serde_json::from_str(raw).ok()?;
        let object = parsed.as_object()?;
        let expiry = object.get("expiry")?;
        let expiry = expiry
            .as_i64()
            .or_else(|| expiry.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
        let value = object.get("value").cloned().unwrap_or(Value::Null);
        Some(Self { value, expiry })
    }

    /// Serialize for storage.
    ///
    /// # Errors
    /// Returns an error if the value cannot be serialized.
    pub fn encode(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_is_exclusive() {
        let record = SessionRecord::new(json!("abc"), 1_000, 500);
        assert!(!record.is_expired(1_500));
        assert!(record.is_expired(1_501));
    }

    #[test]
    fn test_decode_roundtrips_encoded_record() {
        let record = SessionRecord::new(json!("abc"), 0, 10);
        let raw = record.encode().unwrap();
        assert_eq!(SessionRecord::decode(&raw), Some(record));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(SessionRecord::decode("not json").is_none());
        assert!(SessionRecord::decode("\"plain\"").is_none());
        assert!(SessionRecord::decode(r#"{"value":"x"}"#).is_none());
        assert!(SessionRecord::decode(r#"{"value":"x","expiry":"soon"}"#).is_none());
    }

    #[test]
    fn test_decode_missing_value_is_null() {
        let record = SessionRecord::decode(r#"{"expiry": 42}"#).unwrap();
        assert_eq!(record.value, Value::Null);
        assert_eq!(record.expiry, 42);
    }
}
