//! L2 Distributed Tier
//!
//! Client side of the shared key/value store. Every operation is a network
//! round-trip bounded by an operation timeout; failures are counted, logged
//! and converted into soft results so callers never see them.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::cache::entry::StoredPayload;
use crate::cache::health::HealthStatus;
use crate::cache::key::KeyPattern;
use crate::cache::metrics::{TierMetrics, TierMetricsSnapshot};
use crate::config::{DistributedConfig, FreshnessPolicy};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffer of the channel carrying subscription messages to the engine
pub const SUBSCRIPTION_BUFFER: usize = 256;

// =============================================================================
// Store Trait
// =============================================================================

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub channel: String,
    pub payload: String,
}

/// Raw operations of a Redis-compatible store.
///
/// Implementations return errors freely; the [`DistributedTier`] wrapping
/// them owns timeouts, soft-failure and accounting.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Short name for logs and health reports
    fn name(&self) -> &'static str;

    /// Fetch raw bytes
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes with a TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob; returns the number removed
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64>;

    /// Broadcast a message
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Start a standing subscription; messages arrive on the returned channel
    async fn subscribe(&self, channels: &[&'static str]) -> Result<mpsc::Receiver<RemoteMessage>>;

    /// Round-trip check
    async fn ping(&self) -> Result<()>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn DistributedStore>;

/// Connect to the store selected by the configured URL
pub async fn connect(config: &DistributedConfig) -> Result<SharedStore> {
    if config.is_in_memory() {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(config).await?;
    Ok(Arc::new(store))
}

// =============================================================================
// Distributed Tier
// =============================================================================

/// Outcome of a distributed lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// A fresh value was found
    Hit(Value),
    /// Nothing (or only a stale value) was found
    Miss,
    /// The store could not be reached
    Failed,
}

/// L2 tier wrapping a store with timeouts and soft-failure
pub struct DistributedTier {
    store: SharedStore,
    config: DistributedConfig,
    freshness: FreshnessPolicy,
    metrics: TierMetrics,
}

impl DistributedTier {
    pub fn new(store: SharedStore, config: DistributedConfig, freshness: FreshnessPolicy) -> Self {
        Self {
            store,
            config,
            freshness,
            metrics: TierMetrics::new(),
        }
    }

    /// Ping within the connect timeout; used once at startup
    pub async fn verify(&self) -> Result<()> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout {
                operation: "connect",
                timeout,
            }),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        if self.config.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.config.key_prefix, key)
        }
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout { operation, timeout }),
        }
    }

    fn soft_fail(&self, operation: &'static str, key: &str, err: &Error) {
        self.metrics.record_error();
        warn!(
            store = self.store.name(),
            operation,
            key = %key,
            error = %err,
            "distributed tier operation failed"
        );
    }

    /// Look up a key, distinguishing a miss from a failure
    pub async fn lookup(&self, key: &str) -> Lookup {
        let storage_key = self.storage_key(key);
        let bytes = match self.timed("get", self.store.get(&storage_key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.metrics.record_miss();
                return Lookup::Miss;
            }
            Err(e) => {
                self.soft_fail("get", key, &e);
                return Lookup::Failed;
            }
        };

        let payload = match StoredPayload::decode(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                self.soft_fail("decode", key, &e);
                return Lookup::Failed;
            }
        };

        if let Some(max_age) = self.freshness.max_age_for(key) {
            if payload.is_stale(max_age) {
                debug!(
                    key = %key,
                    age_secs = payload.age().as_secs(),
                    max_age_secs = max_age.as_secs(),
                    "discarding stale distributed value"
                );
                if let Err(e) = self.timed("delete", self.store.delete(&storage_key)).await {
                    self.soft_fail("delete", key, &e);
                }
                self.metrics.record_stale();
                self.metrics.record_miss();
                return Lookup::Miss;
            }
        }

        self.metrics.record_hit();
        Lookup::Hit(payload.value)
    }

    /// Fetch a value; absent on miss, staleness or failure
    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.lookup(key).await {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Failed => None,
        }
    }

    /// Store a value. `ttl = None` applies the configured default TTL.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        let ttl_secs = ttl
            .map(|t| t.as_secs())
            .unwrap_or(self.config.default_ttl_secs)
            .max(1);
        let bytes = match StoredPayload::new(value.clone(), ttl_secs).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.soft_fail("encode", key, &e);
                return false;
            }
        };

        let storage_key = self.storage_key(key);
        match self
            .timed(
                "set",
                self.store
                    .set(&storage_key, bytes, Duration::from_secs(ttl_secs)),
            )
            .await
        {
            Ok(()) => {
                self.metrics.record_set();
                true
            }
            Err(e) => {
                self.soft_fail("set", key, &e);
                false
            }
        }
    }

    /// Delete a key; false if it was absent or the store failed
    pub async fn delete(&self, key: &str) -> bool {
        let storage_key = self.storage_key(key);
        match self.timed("delete", self.store.delete(&storage_key)).await {
            Ok(existed) => {
                if existed {
                    self.metrics.record_deletes(1);
                }
                existed
            }
            Err(e) => {
                self.soft_fail("delete", key, &e);
                false
            }
        }
    }

    /// Delete every key matching `pattern`; 0 on failure
    pub async fn delete_by_pattern(&self, pattern: &KeyPattern) -> u64 {
        let storage_pattern = self.storage_key(pattern.as_str());
        match self
            .timed("delete_by_pattern", self.store.delete_by_pattern(&storage_pattern))
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    self.metrics.record_deletes(removed);
                }
                debug!(pattern = %pattern, removed, "deleted distributed keys by pattern");
                removed
            }
            Err(e) => {
                self.soft_fail("delete_by_pattern", pattern.as_str(), &e);
                0
            }
        }
    }

    /// Remove every key under this deployment's prefix
    pub async fn clear(&self) -> u64 {
        self.delete_by_pattern(&KeyPattern::all()).await
    }

    /// Best-effort broadcast; false if it could not be sent
    pub async fn publish(&self, channel: &str, payload: &str) -> bool {
        match self.timed("publish", self.store.publish(channel, payload)).await {
            Ok(()) => {
                debug!(channel = %channel, "published message");
                true
            }
            Err(e) => {
                self.soft_fail("publish", channel, &e);
                false
            }
        }
    }

    /// Start a standing subscription
    pub async fn subscribe(
        &self,
        channels: &[&'static str],
    ) -> Result<mpsc::Receiver<RemoteMessage>> {
        self.store.subscribe(channels).await
    }

    /// Round-trip latency
    pub async fn ping(&self) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        self.timed("ping", self.store.ping()).await?;
        Ok(started.elapsed())
    }

    /// Counter snapshot
    pub fn stats(&self) -> TierMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the tier's counters
    pub fn reset_stats(&self) {
        self.metrics.reset();
    }

    /// Ping-based health report
    pub async fn health(&self) -> DistributedTierHealth {
        let (status, latency_ms, error) = match self.ping().await {
            Ok(latency) => {
                let status = if latency > self.config.degraded_latency() {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                (status, Some(latency.as_secs_f64() * 1_000.0), None)
            }
            Err(e) => {
                self.metrics.record_error();
                (HealthStatus::Unhealthy, None, Some(e.to_string()))
            }
        };

        let stats = self.stats();
        DistributedTierHealth {
            status,
            store: self.store.name(),
            latency_ms,
            error,
            hit_rate: stats.hit_ratio(),
            stats,
        }
    }
}

/// Distributed tier health report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedTierHealth {
    pub status: HealthStatus,
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub hit_rate: f64,
    pub stats: TierMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tier(store: Arc<MemoryStore>) -> DistributedTier {
        DistributedTier::new(store, DistributedConfig::default(), FreshnessPolicy::default())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let tier = tier(store.clone());
        let value = json!({"commodity": "Gold", "sell": 9500, "stations": ["Abraham Lincoln"]});

        assert!(tier.set("market:commodity:Gold:Sol", &value, None).await);
        assert_eq!(tier.get("market:commodity:Gold:Sol").await, Some(value));
        assert!(tier.delete("market:commodity:Gold:Sol").await);
        assert_eq!(tier.get("market:commodity:Gold:Sol").await, None);

        let stats = tier.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_soft_fail_when_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let tier = tier(store.clone());
        store.set_available(false);

        assert!(!tier.set("k", &json!(1), None).await);
        assert_eq!(tier.lookup("k").await, Lookup::Failed);
        assert!(!tier.delete("k").await);
        assert_eq!(tier.delete_by_pattern(&KeyPattern::all()).await, 0);
        assert!(!tier.publish("market_data_update", "{}").await);

        assert_eq!(tier.stats().errors, 5);
        let health = tier.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_values_are_discarded() {
        let store = Arc::new(MemoryStore::new());
        let tier = DistributedTier::new(
            store.clone(),
            DistributedConfig::default(),
            FreshnessPolicy::disabled().with_threshold("server:", 10),
        );

        tier.set("server:metrics:current", &json!({"cpu": 0.4}), Some(Duration::from_secs(60)))
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(tier.get("server:metrics:current").await, None);
        assert_eq!(tier.stats().stale, 1);
        // The stale value was removed from the store
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_discards_prices_before_expiry() {
        let store = Arc::new(MemoryStore::new());
        let tier = DistributedTier::new(
            store.clone(),
            DistributedConfig::default(),
            FreshnessPolicy::default(),
        );
        let key = "market:commodity:Gold:Sol";

        tier.set(key, &json!({"sell": 9500}), Some(Duration::from_secs(300)))
            .await;
        tokio::time::advance(Duration::from_secs(241)).await;

        assert_eq!(store.keys(), vec![key.to_string()]);
        assert_eq!(tier.get(key).await, None);
        assert_eq!(tier.stats().stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_is_soft_failure() {
        let store = Arc::new(MemoryStore::new());
        let tier = tier(store.clone());
        store.set_latency(Duration::from_secs(2));

        assert_eq!(tier.get("k").await, None);
        assert_eq!(tier.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_degraded_on_slow_ping() {
        let store = Arc::new(MemoryStore::new());
        let tier = tier(store.clone());
        assert_eq!(tier.health().await.status, HealthStatus::Healthy);

        store.set_latency(Duration::from_millis(200));
        assert_eq!(tier.health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let store = Arc::new(MemoryStore::new());
        let config = DistributedConfig {
            key_prefix: "eu:".into(),
            ..Default::default()
        };
        let tier = DistributedTier::new(store.clone(), config, FreshnessPolicy::default());
        let other = tier_with_prefix(store.clone(), "us:");

        tier.set("stats:global:abc", &json!(1), None).await;
        other.set("stats:global:abc", &json!(2), None).await;
        assert_eq!(store.keys(), vec!["eu:stats:global:abc", "us:stats:global:abc"]);

        assert_eq!(tier.clear().await, 1);
        assert_eq!(other.get("stats:global:abc").await, Some(json!(2)));
    }

    fn tier_with_prefix(store: Arc<MemoryStore>, prefix: &str) -> DistributedTier {
        let config = DistributedConfig {
            key_prefix: prefix.into(),
            ..Default::default()
        };
        DistributedTier::new(store, config, FreshnessPolicy::default())
    }
}
