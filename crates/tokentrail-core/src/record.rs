//! Immutable token records and millisecond clock helpers.
//!
//! A [`TokenRecord`] pairs an opaque token string with its insertion
//! timestamp. Ordering throughout the crate is strictly by insertion order
//! (queue order), never by comparing timestamp values, although in practice
//! the two coincide.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single issued token and the moment it entered the queue.
///
/// Serializes with the wire field name `timeMillis` for the timestamp, so
/// persisted contents look like `{"token":"t1","timeMillis":1692186615000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Opaque token value (e.g. an idempotency key or rate-limit marker).
    pub token: String,
    /// Insertion time, milliseconds since the Unix epoch.
    #[serde(rename = "timeMillis")]
    pub inserted_at_millis: i64,
}

impl TokenRecord {
    /// Create a record inserted at the given timestamp.
    pub fn new(token: impl Into<String>, inserted_at_millis: i64) -> Self {
        Self {
            token: token.into(),
            inserted_at_millis,
        }
    }

    /// Age of the record relative to `now_millis`.
    ///
    /// Saturating: a record stamped in the future (clock skew) reports a
    /// negative age rather than wrapping.
    #[must_use]
    pub const fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.inserted_at_millis)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_is_now_minus_inserted() {
        let rec = TokenRecord::new("t1", 1_000);
        assert_eq!(rec.age_millis(1_500), 500);
        assert_eq!(rec.age_millis(1_000), 0);
    }

    #[test]
    fn future_record_has_negative_age() {
        let rec = TokenRecord::new("t1", 2_000);
        assert_eq!(rec.age_millis(1_500), -500);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let rec = TokenRecord::new("t1", 1_692_186_615_000);
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(json, r#"{"token":"t1","timeMillis":1692186615000}"#);
    }

    #[test]
    fn deserializes_wire_form() {
        let rec: TokenRecord =
            serde_json::from_str(r#"{"token":"abc","timeMillis":42}"#).unwrap();
        assert_eq!(rec.token, "abc");
        assert_eq!(rec.inserted_at_millis, 42);
    }

    #[test]
    fn now_millis_is_recent() {
        let now = now_millis();
        // Sanity bound: after 2020-01-01 and before 2100-01-01.
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }
}
