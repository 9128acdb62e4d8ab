//! Cache Configuration
//!
//! YAML-loadable configuration for the cache manager, its tiers, the TTL
//! table and the invalidation schedule. Every field has a default, so an
//! empty document is a valid configuration.

use crate::cache::invalidation::DomainType;
use crate::cache::key::CacheDomain;
use crate::cache::tier::CacheStrategy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Configuration for the cache manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Which tiers to run
    pub strategy: CacheStrategy,
    /// Local tier configuration
    pub local: LocalTierConfig,
    /// Distributed tier configuration
    pub distributed: DistributedConfig,
    /// TTLs per domain subtype
    pub ttl: TtlTable,
    /// Freshness thresholds applied to distributed reads
    pub freshness: FreshnessPolicy,
    /// Invalidation schedule and publishing
    pub invalidation: InvalidationConfig,
    /// TTL for local copies backfilled from a distributed hit
    pub backfill_ttl_secs: u64,
    /// Interval between periodic stats snapshots (0 disables)
    pub stats_interval_secs: u64,
    /// Capacity of the cache event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Hybrid,
            local: LocalTierConfig::default(),
            distributed: DistributedConfig::default(),
            ttl: TtlTable::default(),
            freshness: FreshnessPolicy::default(),
            invalidation: InvalidationConfig::default(),
            backfill_ttl_secs: 60,
            stats_interval_secs: 300,
            event_channel_capacity: 1024,
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.local.max_entries == 0 {
            return Err(Error::Configuration("local.max_entries must be > 0".into()));
        }
        if !(self.local.high_water_mark > 0.0 && self.local.high_water_mark <= 1.0) {
            return Err(Error::Configuration(
                "local.high_water_mark must be within (0, 1]".into(),
            ));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(Error::Configuration(
                "local.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.strategy.uses_distributed() && self.distributed.url.trim().is_empty() {
            return Err(Error::Configuration(
                "distributed.url is required for this strategy".into(),
            ));
        }
        if self.distributed.operation_timeout_ms == 0 {
            return Err(Error::Configuration(
                "distributed.operation_timeout_ms must be > 0".into(),
            ));
        }
        if self.backfill_ttl_secs == 0 {
            return Err(Error::Configuration("backfill_ttl_secs must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        for schedule in &self.invalidation.schedules {
            if schedule.interval_secs == 0 {
                return Err(Error::Configuration(format!(
                    "invalidation schedule for {} must have interval_secs > 0",
                    schedule.domain
                )));
            }
        }
        Ok(())
    }

    /// TTL for local backfills
    pub fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.backfill_ttl_secs)
    }
}

// =============================================================================
// Local Tier
// =============================================================================

/// Configuration for the in-process tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTierConfig {
    /// Hard ceiling on entry count
    pub max_entries: usize,
    /// TTL applied when a caller gives none (None = never expires)
    pub default_ttl_secs: Option<u64>,
    /// Interval of the expiry sweep
    pub sweep_interval_secs: u64,
    /// Utilization (0.0-1.0) above which health reports degraded
    pub high_water_mark: f64,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: Some(300),
            sweep_interval_secs: 60,
            high_water_mark: 0.9,
        }
    }
}

impl LocalTierConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// =============================================================================
// Distributed Tier
// =============================================================================

/// Configuration for the shared network tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Store URL (`redis://...` or `memory://` for the in-process store)
    pub url: String,
    /// Prefix prepended to every key written by this deployment
    pub key_prefix: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Timeout for establishing connections
    pub connect_timeout_ms: u64,
    /// Timeout for each cache operation
    pub operation_timeout_ms: u64,
    /// TTL applied when a caller gives none
    pub default_ttl_secs: u64,
    /// Ping latency above which health reports degraded
    pub degraded_latency_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            pool_size: 16,
            connect_timeout_ms: 2_000,
            operation_timeout_ms: 500,
            default_ttl_secs: 3_600,
            degraded_latency_ms: 100,
        }
    }
}

impl DistributedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }

    /// Whether the URL selects the in-process store
    pub fn is_in_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

// =============================================================================
// TTL Table
// =============================================================================

/// TTLs (seconds) for one domain subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTtl {
    /// TTL in the distributed tier
    pub distributed: u64,
    /// TTL for local copies (None = never held locally alongside L2)
    pub local: Option<u64>,
}

impl DomainTtl {
    pub const fn new(distributed: u64, local: Option<u64>) -> Self {
        Self { distributed, local }
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed)
    }

    pub fn local_ttl(&self) -> Option<Duration> {
        self.local.map(Duration::from_secs)
    }
}

/// Lookup table of TTLs per domain subtype
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TtlTable {
    entries: HashMap<CacheDomain, DomainTtl>,
}

impl Default for TtlTable {
    fn default() -> Self {
        let entries = CacheDomain::ALL
            .iter()
            .map(|d| (*d, Self::builtin(*d)))
            .collect();
        Self { entries }
    }
}

impl TtlTable {
    fn builtin(domain: CacheDomain) -> DomainTtl {
        match domain {
            CacheDomain::MarketCommodity => DomainTtl::new(300, Some(60)),
            CacheDomain::MarketRoutes => DomainTtl::new(600, Some(120)),
            CacheDomain::MarketTrends => DomainTtl::new(1_800, Some(300)),
            CacheDomain::MiningProfitability => DomainTtl::new(1_800, None),
            CacheDomain::MiningHotspots => DomainTtl::new(3_600, None),
            CacheDomain::StatsGlobal => DomainTtl::new(600, Some(60)),
            CacheDomain::StatsEddn => DomainTtl::new(120, Some(30)),
            CacheDomain::StatsApiUsage => DomainTtl::new(300, Some(60)),
            CacheDomain::ServerMetrics => DomainTtl::new(30, Some(30)),
        }
    }

    /// TTLs for a domain; falls back to the built-in value when the
    /// configuration omits it
    pub fn get(&self, domain: CacheDomain) -> DomainTtl {
        self.entries
            .get(&domain)
            .copied()
            .unwrap_or_else(|| Self::builtin(domain))
    }

    /// Override one domain's TTLs
    pub fn set(&mut self, domain: CacheDomain, ttl: DomainTtl) {
        self.entries.insert(domain, ttl);
    }
}

// =============================================================================
// Freshness Policy
// =============================================================================

/// Maximum age (seconds) of distributed values, by key prefix.
///
/// The longest matching prefix wins; keys with no matching prefix are only
/// bounded by their TTL. Defaults for volatile data (live prices, EDDN
/// counters, server metrics, connection counts, response times) sit below
/// the domain's distributed TTL. The broad `market:`, `mining:` and `stats:`
/// thresholds exceed the built-in TTLs and only bound values written with
/// longer TTLs through raw `set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreshnessPolicy {
    thresholds: BTreeMap<String, u64>,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        let thresholds = [
            ("market:commodity:", 240),
            ("market:", 3_600),
            ("mining:", 7_200),
            ("stats:", 1_800),
            ("stats:eddn:", 90),
            ("server:", 20),
            ("connections:", 20),
            ("api:", 240),
        ]
        .into_iter()
        .map(|(prefix, secs)| (prefix.to_string(), secs))
        .collect();
        Self { thresholds }
    }
}

impl FreshnessPolicy {
    /// Policy with no thresholds
    pub fn disabled() -> Self {
        Self {
            thresholds: BTreeMap::new(),
        }
    }

    /// Set the threshold for a prefix
    pub fn with_threshold(mut self, prefix: impl Into<String>, max_age_secs: u64) -> Self {
        self.thresholds.insert(prefix.into(), max_age_secs);
        self
    }

    /// Maximum age for a key, if any prefix applies
    pub fn max_age_for(&self, key: &str) -> Option<Duration> {
        self.thresholds
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, secs)| Duration::from_secs(*secs))
    }
}

// =============================================================================
// Invalidation
// =============================================================================

/// Periodic invalidation of one domain type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub domain: DomainType,
    pub interval_secs: u64,
}

/// Invalidation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Scheduled refreshes
    pub schedules: Vec<ScheduleConfig>,
    /// Interval at which deferred invalidations are applied
    pub deferred_flush_secs: u64,
    /// Whether invalidations are published to other instances
    pub publish: bool,
    /// Identity stamped on published messages (generated when absent)
    pub instance_id: Option<String>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            schedules: vec![
                ScheduleConfig {
                    domain: DomainType::Statistics,
                    interval_secs: 300,
                },
                ScheduleConfig {
                    domain: DomainType::ApiUsage,
                    interval_secs: 60,
                },
                ScheduleConfig {
                    domain: DomainType::MiningData,
                    interval_secs: 1_800,
                },
            ],
            deferred_flush_secs: 5,
            publish: true,
            instance_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.strategy, CacheStrategy::Hybrid);
        assert_eq!(config.backfill_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_ttl_table() {
        let table = TtlTable::default();
        assert_eq!(table.get(CacheDomain::MarketCommodity), DomainTtl::new(300, Some(60)));
        assert_eq!(table.get(CacheDomain::MiningHotspots), DomainTtl::new(3_600, None));
        assert_eq!(table.get(CacheDomain::ServerMetrics).local_ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
strategy: memory-only
local:
  max_entries: 500
ttl:
  market.commodity:
    distributed: 120
    local: 15
invalidation:
  schedules:
    - domain: statistics
      interval_secs: 30
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.strategy, CacheStrategy::MemoryOnly);
        assert_eq!(config.local.max_entries, 500);
        // Unspecified local fields keep their defaults
        assert_eq!(config.local.sweep_interval_secs, 60);
        assert_eq!(config.ttl.get(CacheDomain::MarketCommodity), DomainTtl::new(120, Some(15)));
        // Domains missing from the override fall back to built-ins
        assert_eq!(config.ttl.get(CacheDomain::MarketRoutes), DomainTtl::new(600, Some(120)));
        assert_eq!(config.invalidation.schedules.len(), 1);
        assert_eq!(config.invalidation.schedules[0].domain, DomainType::Statistics);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = CacheConfig::default();
        config.local.max_entries = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = CacheConfig::default();
        config.local.high_water_mark = 1.5;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = CacheConfig::default();
        config.strategy = CacheStrategy::DistributedOnly;
        config.distributed.url = " ".into();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        assert_matches!(
            CacheConfig::from_yaml_str("strategy: sharded"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_freshness_longest_prefix() {
        let policy = FreshnessPolicy::default();
        assert_eq!(
            policy.max_age_for("market:commodity:Gold:Sol"),
            Some(Duration::from_secs(240))
        );
        assert_eq!(
            policy.max_age_for("stats:eddn:abc"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            policy.max_age_for("market:routes:abc"),
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(policy.max_age_for("unknown:key"), None);
        assert_eq!(FreshnessPolicy::disabled().max_age_for("market:x"), None);
    }

    #[test]
    fn test_volatile_freshness_is_tighter_than_ttl() {
        let policy = FreshnessPolicy::default();
        let ttl = TtlTable::default();
        for (domain, key) in [
            (CacheDomain::MarketCommodity, "market:commodity:Gold:Sol"),
            (CacheDomain::StatsEddn, "stats:eddn:abc"),
            (CacheDomain::StatsApiUsage, "api:response_times:%2Fapi:GET"),
            (CacheDomain::ServerMetrics, "server:metrics:current"),
            (CacheDomain::ServerMetrics, "connections:websocket:count"),
        ] {
            let max_age = policy.max_age_for(key).unwrap();
            assert!(
                max_age < ttl.get(domain).distributed_ttl(),
                "{} keeps values until they expire",
                key
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backfill_ttl_secs: 45\ndistributed:\n  url: memory://").unwrap();

        let config = CacheConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.backfill_ttl_secs, 45);
        assert!(config.distributed.is_in_memory());
    }
}
