//! Cache Entry Types
//!
//! Defines the local-tier entry and the payload envelope written to the
//! distributed tier.

use crate::cache::clock;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Cache Entry
// =============================================================================

/// A value held by the local tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub value: Value,
    /// Wall-clock creation time (for reporting)
    pub created_at: DateTime<Utc>,
    /// Monotonic time the entry expires (None = never expires via time)
    pub expires_at: Option<Instant>,
    /// Time-to-live in seconds (None = never expires)
    pub ttl_seconds: Option<u64>,
    /// Monotonic time of last access
    pub last_accessed: Instant,
    /// Number of times this entry has been read
    pub access_count: u64,
    /// Rough in-memory footprint of key and value
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Create a new entry, expiring `ttl` from now when given
    pub fn new(key: &str, value: Value, ttl: Option<Duration>) -> Self {
        let now = clock::now();
        let size_bytes = key.len() as u64 + estimate_size(&value);
        Self {
            value,
            created_at: Utc::now(),
            expires_at: ttl.map(|t| now + t),
            ttl_seconds: ttl.map(|t| t.as_secs()),
            last_accessed: now,
            access_count: 0,
            size_bytes,
        }
    }

    /// Check if the entry has expired at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(clock::now())
    }

    /// Record an access to this entry
    pub fn record_access(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    /// Time left before expiry (None = never expires)
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(clock::now()))
    }
}

/// Approximate heap footprint of a JSON value
pub fn estimate_size(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() as u64 + 24,
        Value::Array(items) => 24 + items.iter().map(estimate_size).sum::<u64>(),
        Value::Object(map) => {
            48 + map
                .iter()
                .map(|(k, v)| k.len() as u64 + 24 + estimate_size(v))
                .sum::<u64>()
        }
    }
}

// =============================================================================
// Distributed Payload
// =============================================================================

/// Envelope stored in the distributed tier.
///
/// Embeds the time the value was cached so readers can apply a freshness
/// threshold on top of the store's own TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPayload {
    /// The cached value
    pub value: Value,
    /// Unix millis at which the value was written
    pub cached_at: u64,
    /// TTL the value was written with
    pub ttl_seconds: u64,
}

impl StoredPayload {
    /// Wrap a value stamped with the current time
    pub fn new(value: Value, ttl_seconds: u64) -> Self {
        Self {
            value,
            cached_at: clock::unix_millis(),
            ttl_seconds,
        }
    }

    /// Age of the payload in seconds
    pub fn age(&self) -> Duration {
        Duration::from_millis(clock::unix_millis().saturating_sub(self.cached_at))
    }

    /// Whether the payload is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let entry = CacheEntry::new("k", json!({"buy": 9000}), Some(Duration::from_secs(10)));
        assert!(!entry.is_expired());
        assert_eq!(entry.ttl_seconds, Some(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!entry.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(entry.is_expired());
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = CacheEntry::new("k", json!(1), None);
        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl().is_none());
    }

    #[test]
    fn test_size_estimate_grows_with_content() {
        let small = estimate_size(&json!({"a": 1}));
        let large = estimate_size(&json!({"a": 1, "name": "Low Temperature Diamonds"}));
        assert!(large > small);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_staleness() {
        let payload = StoredPayload::new(json!({"sell": 9500}), 300);
        let decoded = StoredPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);

        assert!(!payload.is_stale(Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(payload.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_payload_wire_fields() {
        let payload = StoredPayload::new(json!([1, 2]), 300);
        let wire: Value = serde_json::from_slice(&payload.encode().unwrap()).unwrap();
        let mut fields: Vec<&str> = wire.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        fields.sort();
        assert_eq!(fields, vec!["cached_at", "ttl_seconds", "value"]);
        assert_eq!(wire["ttl_seconds"], json!(300));
        assert_eq!(wire["value"], json!([1, 2]));
    }
}
