//! Cache Keys
//!
//! Deterministic, colon-delimited keys for every cached domain object, and
//! the glob patterns used to bulk-delete them.
//!
//! ```text
//! market:{type}:{key}[:{system}]
//! mining:{type}:{filter-hash}
//! stats:{type}:{filter-hash}
//! server:metrics:current
//! api:response_times:{endpoint}:{method}
//! connections:{type}:count
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Namespaces
// =============================================================================

pub const MARKET_NAMESPACE: &str = "market";
pub const MINING_NAMESPACE: &str = "mining";
pub const STATS_NAMESPACE: &str = "stats";
pub const SERVER_NAMESPACE: &str = "server";
pub const API_NAMESPACE: &str = "api";
pub const CONNECTIONS_NAMESPACE: &str = "connections";

/// Hex digits of the filter digest kept in keys
const FILTER_HASH_LEN: usize = 16;

// =============================================================================
// Cache Domain
// =============================================================================

/// Domain subtype used to look up TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheDomain {
    #[serde(rename = "market.commodity")]
    MarketCommodity,
    #[serde(rename = "market.routes")]
    MarketRoutes,
    #[serde(rename = "market.trends")]
    MarketTrends,
    #[serde(rename = "mining.profitability")]
    MiningProfitability,
    #[serde(rename = "mining.hotspots")]
    MiningHotspots,
    #[serde(rename = "stats.global")]
    StatsGlobal,
    #[serde(rename = "stats.eddn")]
    StatsEddn,
    #[serde(rename = "stats.api_usage")]
    StatsApiUsage,
    #[serde(rename = "server.metrics")]
    ServerMetrics,
}

impl CacheDomain {
    /// Every known domain subtype
    pub const ALL: [CacheDomain; 9] = [
        CacheDomain::MarketCommodity,
        CacheDomain::MarketRoutes,
        CacheDomain::MarketTrends,
        CacheDomain::MiningProfitability,
        CacheDomain::MiningHotspots,
        CacheDomain::StatsGlobal,
        CacheDomain::StatsEddn,
        CacheDomain::StatsApiUsage,
        CacheDomain::ServerMetrics,
    ];

    /// Dotted name, e.g. `market.commodity`
    pub fn name(&self) -> &'static str {
        match self {
            CacheDomain::MarketCommodity => "market.commodity",
            CacheDomain::MarketRoutes => "market.routes",
            CacheDomain::MarketTrends => "market.trends",
            CacheDomain::MiningProfitability => "mining.profitability",
            CacheDomain::MiningHotspots => "mining.hotspots",
            CacheDomain::StatsGlobal => "stats.global",
            CacheDomain::StatsEddn => "stats.eddn",
            CacheDomain::StatsApiUsage => "stats.api_usage",
            CacheDomain::ServerMetrics => "server.metrics",
        }
    }

    /// Key namespace for this domain
    pub fn namespace(&self) -> &'static str {
        match self {
            CacheDomain::MarketCommodity | CacheDomain::MarketRoutes | CacheDomain::MarketTrends => {
                MARKET_NAMESPACE
            }
            CacheDomain::MiningProfitability | CacheDomain::MiningHotspots => MINING_NAMESPACE,
            CacheDomain::StatsGlobal | CacheDomain::StatsEddn | CacheDomain::StatsApiUsage => {
                STATS_NAMESPACE
            }
            CacheDomain::ServerMetrics => SERVER_NAMESPACE,
        }
    }

    /// Key subtype for this domain
    pub fn subtype(&self) -> &'static str {
        match self.name().split_once('.') {
            Some((_, subtype)) => subtype,
            None => self.name(),
        }
    }
}

impl fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CacheDomain::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .ok_or_else(|| Error::UnknownDomain(s.to_string()))
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Structured cache key.
///
/// Every segment is percent-encoded so names containing `:` or glob
/// metacharacters cannot collide with the key structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Namespace (e.g., "market", "stats")
    pub namespace: &'static str,
    /// Encoded segments after the namespace
    pub segments: Vec<String>,
}

impl CacheKey {
    fn build(namespace: &'static str, segments: &[&str]) -> Self {
        Self {
            namespace,
            segments: segments.iter().map(|s| segment(s).into_owned()).collect(),
        }
    }

    /// `market:{type}:{key}[:{system}]`
    pub fn market(subtype: &str, key: &str, system: Option<&str>) -> Self {
        match system {
            Some(system) => Self::build(MARKET_NAMESPACE, &[subtype, key, system]),
            None => Self::build(MARKET_NAMESPACE, &[subtype, key]),
        }
    }

    /// `mining:{type}:{filter-hash}`
    pub fn mining(subtype: &str, filters: &Value) -> Self {
        let hash = filter_hash(filters);
        Self::build(MINING_NAMESPACE, &[subtype, &hash])
    }

    /// `stats:{type}:{filter-hash}`
    pub fn stats(subtype: &str, filters: &Value) -> Self {
        let hash = filter_hash(filters);
        Self::build(STATS_NAMESPACE, &[subtype, &hash])
    }

    /// `server:metrics:current`
    pub fn server_metrics() -> Self {
        Self::build(SERVER_NAMESPACE, &["metrics", "current"])
    }

    /// `api:response_times:{endpoint}:{method}`
    pub fn api_response_times(endpoint: &str, method: &str) -> Self {
        let method = method.to_ascii_uppercase();
        Self::build(API_NAMESPACE, &["response_times", endpoint, &method])
    }

    /// `connections:{type}:count`
    pub fn connections(kind: &str) -> Self {
        Self::build(CONNECTIONS_NAMESPACE, &[kind, "count"])
    }

    /// Get a string representation for storage
    pub fn to_storage_key(&self) -> String {
        let mut key = String::from(self.namespace);
        for s in &self.segments {
            key.push(':');
            key.push_str(s);
        }
        key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_storage_key()
    }
}

/// Percent-encode one key segment
pub fn segment(raw: &str) -> Cow<'_, str> {
    urlencoding::encode(raw)
}

/// Stable digest of a filter set.
///
/// Object keys are sorted and null members dropped before hashing, so two
/// logically identical filter sets always produce the same key in every
/// process.
pub fn filter_hash(filters: &Value) -> String {
    let canonical = canonical_json(filters);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(FILTER_HASH_LEN);
    hash
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = members
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Key Pattern
// =============================================================================

/// Glob-like key pattern; `*` matches any run of characters
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    glob: glob::Pattern,
}

impl KeyPattern {
    /// Compile a pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let raw = pattern.into();
        let glob = glob::Pattern::new(&raw).map_err(|e| Error::InvalidPattern {
            pattern: raw.clone(),
            reason: e.msg.to_string(),
        })?;
        Ok(Self { raw, glob })
    }

    /// Pattern matching every key
    pub fn all() -> Self {
        Self {
            raw: "*".to_string(),
            glob: glob::Pattern::new("*").expect("literal '*' is a valid glob"),
        }
    }

    /// Check a full key against the pattern
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.glob.matches(key)
    }

    /// Whether this pattern matches every key
    pub fn is_match_all(&self) -> bool {
        self.raw == "*"
    }

    /// The pattern source
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for KeyPattern {}

impl std::hash::Hash for KeyPattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_market_key() {
        let key = CacheKey::market("commodity", "Gold", Some("Sol"));
        assert_eq!(key.to_storage_key(), "market:commodity:Gold:Sol");

        let key = CacheKey::market("trends", "Gold", None);
        assert_eq!(key.to_string(), "market:trends:Gold");
    }

    #[test]
    fn test_segments_are_encoded() {
        let key = CacheKey::market("commodity", "Void Opal", Some("Col 285:Sector*"));
        let raw = key.to_storage_key();
        assert_eq!(raw.matches(':').count(), 3);
        assert!(!raw.contains('*'));
        assert!(raw.starts_with("market:commodity:Void%20Opal:"));
    }

    #[test]
    fn test_filter_hash_is_order_independent() {
        let a = json!({"commodity": "Painite", "system": "HIP 21991", "limit": 10});
        let b = json!({"limit": 10, "system": "HIP 21991", "commodity": "Painite"});
        assert_eq!(filter_hash(&a), filter_hash(&b));
        assert_eq!(filter_hash(&a).len(), FILTER_HASH_LEN);

        // Null members do not change the key
        let c = json!({"limit": 10, "system": "HIP 21991", "commodity": "Painite", "ring": null});
        assert_eq!(filter_hash(&a), filter_hash(&c));

        let d = json!({"commodity": "Painite", "system": "HIP 21991", "limit": 20});
        assert_ne!(filter_hash(&a), filter_hash(&d));
    }

    #[test]
    fn test_stats_and_mining_keys() {
        let filters = json!({"days": 7});
        let stats = CacheKey::stats("mining", &filters).to_storage_key();
        assert!(stats.starts_with("stats:mining:"));
        assert_eq!(stats, CacheKey::stats("mining", &json!({"days": 7})).to_storage_key());

        let mining = CacheKey::mining("hotspots", &filters).to_storage_key();
        assert!(mining.starts_with("mining:hotspots:"));
    }

    #[test]
    fn test_fixed_keys() {
        assert_eq!(CacheKey::server_metrics().to_storage_key(), "server:metrics:current");
        assert_eq!(
            CacheKey::api_response_times("/api/market", "get").to_storage_key(),
            "api:response_times:%2Fapi%2Fmarket:GET"
        );
        assert_eq!(
            CacheKey::connections("websocket").to_storage_key(),
            "connections:websocket:count"
        );
    }

    #[test]
    fn test_domain_names() {
        assert_eq!(CacheDomain::MarketCommodity.namespace(), "market");
        assert_eq!(CacheDomain::StatsApiUsage.subtype(), "api_usage");
        assert_eq!(
            "mining.hotspots".parse::<CacheDomain>().unwrap(),
            CacheDomain::MiningHotspots
        );
        assert!("weather.forecast".parse::<CacheDomain>().is_err());
    }

    #[test]
    fn test_key_pattern() {
        let pattern = KeyPattern::new("market:commodity:Gold*").unwrap();
        assert!(pattern.matches("market:commodity:Gold:Sol"));
        assert!(pattern.matches("market:commodity:Gold"));
        assert!(!pattern.matches("market:commodity:Silver:Sol"));
        assert!(!pattern.matches("market:trends:Gold"));

        let all = KeyPattern::all();
        assert!(all.is_match_all());
        assert!(all.matches("anything:at:all"));

        assert!(KeyPattern::new("market:[").is_err());
    }
}
