//! Cache Events
//!
//! Events emitted by the cache manager for monitoring and observability.

use crate::cache::invalidation::DomainType;
use crate::cache::tier::{CacheStrategy, CacheTier};
use serde::{Deserialize, Serialize};

/// Events emitted by the cache system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Entry was stored
    Set { key: String, tier: CacheTier },

    /// Cache hit
    Hit {
        key: String,
        tier: CacheTier,
        backfilled: bool,
    },

    /// Cache miss (not found in any active tier)
    Miss { key: String },

    /// Entry was deleted
    Delete { key: String, tier: CacheTier },

    /// Entry was evicted from the local tier for capacity
    Evict { key: String },

    /// Expired entries were swept from the local tier
    Expired { count: u64 },

    /// Invalidation removed keys matching derived patterns
    Invalidated {
        domain: DomainType,
        trigger: String,
        patterns: Vec<String>,
        local_removed: u64,
        distributed_removed: u64,
        remote: bool,
    },

    /// Tier became unavailable
    TierUnavailable { tier: CacheTier, reason: String },

    /// Manager fell back to a narrower strategy at startup
    StrategyDowngraded {
        requested: CacheStrategy,
        active: CacheStrategy,
        reason: String,
    },

    /// Keys matching a bulk pattern were cleared
    Cleared {
        pattern: String,
        local_removed: u64,
        distributed_removed: u64,
    },

    /// Cache statistics snapshot
    StatsSnapshot {
        total_requests: u64,
        hit_ratio: f64,
        local_entries: u64,
        distributed_errors: u64,
    },
}

impl CacheEvent {
    /// Get the key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Set { key, .. }
            | CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key }
            | CacheEvent::Delete { key, .. }
            | CacheEvent::Evict { key } => Some(key),
            _ => None,
        }
    }

    /// Get the tier associated with this event (if any)
    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            CacheEvent::Set { tier, .. }
            | CacheEvent::Hit { tier, .. }
            | CacheEvent::Delete { tier, .. }
            | CacheEvent::TierUnavailable { tier, .. } => Some(*tier),
            CacheEvent::Evict { .. } | CacheEvent::Expired { .. } => Some(CacheTier::Local),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::TierUnavailable { .. } | CacheEvent::StrategyDowngraded { .. }
        )
    }
}
