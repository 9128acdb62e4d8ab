//! Cache Tier Definitions
//!
//! Defines the two-tier hierarchy (local L1, distributed L2) and the
//! strategies that decide which tiers a manager uses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Cache Tier
// =============================================================================

/// Cache tier representing the storage hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// L1: In-process cache (fastest, bounded by entry count)
    #[default]
    Local,
    /// L2: Shared network cache (Redis-compatible)
    Distributed,
}

impl CacheTier {
    /// Get all tiers in lookup order (L1 -> L2)
    pub fn lookup_order() -> &'static [CacheTier] {
        &[CacheTier::Local, CacheTier::Distributed]
    }

    /// Check if this tier is higher priority than another
    pub fn is_higher_than(&self, other: &CacheTier) -> bool {
        matches!((self, other), (CacheTier::Local, CacheTier::Distributed))
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Local => write!(f, "L1-Local"),
            CacheTier::Distributed => write!(f, "L2-Distributed"),
        }
    }
}

// =============================================================================
// Cache Strategy
// =============================================================================

/// Which tiers a cache manager reads from and writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Local tier only; no network dependency
    MemoryOnly,
    /// Distributed tier only; fails fast at startup if unreachable
    DistributedOnly,
    /// Local tier as L1 in front of the distributed tier
    #[default]
    Hybrid,
}

impl CacheStrategy {
    /// Whether this strategy reads/writes the local tier
    pub fn uses_local(&self) -> bool {
        matches!(self, CacheStrategy::MemoryOnly | CacheStrategy::Hybrid)
    }

    /// Whether this strategy reads/writes the distributed tier
    pub fn uses_distributed(&self) -> bool {
        matches!(self, CacheStrategy::DistributedOnly | CacheStrategy::Hybrid)
    }

    /// Tiers consulted by this strategy, in lookup order
    pub fn tiers(&self) -> &'static [CacheTier] {
        match self {
            CacheStrategy::MemoryOnly => &[CacheTier::Local],
            CacheStrategy::DistributedOnly => &[CacheTier::Distributed],
            CacheStrategy::Hybrid => CacheTier::lookup_order(),
        }
    }

    /// Narrow a requested strategy to what the manager actually runs.
    ///
    /// A per-call override may only drop tiers, never add a tier the
    /// manager does not have.
    pub fn constrain(&self, active: CacheStrategy) -> CacheStrategy {
        match (active, self) {
            (CacheStrategy::Hybrid, requested) => *requested,
            (CacheStrategy::MemoryOnly, _) => CacheStrategy::MemoryOnly,
            (CacheStrategy::DistributedOnly, _) => CacheStrategy::DistributedOnly,
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategy::MemoryOnly => write!(f, "memory-only"),
            CacheStrategy::DistributedOnly => write!(f, "distributed-only"),
            CacheStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory-only" | "memory" | "local" => Ok(CacheStrategy::MemoryOnly),
            "distributed-only" | "distributed" | "redis" => Ok(CacheStrategy::DistributedOnly),
            "hybrid" => Ok(CacheStrategy::Hybrid),
            other => Err(format!("unknown cache strategy '{}'", other)),
        }
    }
}
