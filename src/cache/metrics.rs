//! Cache Metrics
//!
//! Cache-line aligned atomic counters for each tier and for the manager,
//! plus point-in-time snapshots and Prometheus text rendering.

use crate::cache::tier::CacheTier;
use crate::error::{Error, Result};
use chrono::Utc;
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Per-Tier Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for a single cache tier, aligned to prevent false sharing.
///
/// Mutated only by the owning tier.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TierMetrics {
    /// Number of lookups that found a live value
    pub hits: AtomicU64,
    /// Number of lookups that found nothing (or an expired/stale value)
    pub misses: AtomicU64,
    /// Number of successful writes
    pub sets: AtomicU64,
    /// Number of entries removed by explicit or pattern delete
    pub deletes: AtomicU64,
    /// Number of entries evicted for capacity
    pub evictions: AtomicU64,
    /// Number of entries removed by expiry
    pub cleanups: AtomicU64,
    /// Number of failed operations (distributed tier only)
    pub errors: AtomicU64,
    /// Number of values discarded by the freshness check
    pub stale: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<TierMetrics>() <= 2 * CACHE_LINE_SIZE);

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TierMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_cleanups(&self, count: u64) {
        self.cleanups.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Zero every counter (used by a full clear)
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.evictions,
            &self.cleanups,
            &self.errors,
            &self.stale,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tier Metrics Snapshot
// =============================================================================

/// Point-in-time snapshot of tier metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub cleanups: u64,
    pub errors: u64,
    pub stale: u64,
}

impl TierMetricsSnapshot {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get total requests
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Whether every counter is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Manager Metrics
// =============================================================================

/// Aggregate counters kept by the cache manager, independent of the tiers'
/// own counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub total_requests: AtomicU64,
    pub local_hits: AtomicU64,
    pub distributed_hits: AtomicU64,
    pub misses: AtomicU64,
    pub errors: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub backfills: AtomicU64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a hit served by `tier`
    #[inline]
    pub fn record_hit(&self, tier: CacheTier) {
        match tier {
            CacheTier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Distributed => self.distributed_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_backfill(&self) {
        self.backfills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            distributed_hits: self.distributed_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            backfills: self.backfills.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatsSnapshot {
    pub total_requests: u64,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub deletes: u64,
    pub backfills: u64,
}

impl ManagerStatsSnapshot {
    /// Overall hit ratio across tiers
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.local_hits + self.distributed_hits) as f64 / self.total_requests as f64
        }
    }
}

// =============================================================================
// Aggregate Cache Statistics
// =============================================================================

/// Statistics across the manager and its active tiers
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    /// Manager-level counters
    pub manager: ManagerStatsSnapshot,
    /// Local tier counters (None when the tier is inactive)
    pub local: Option<TierMetricsSnapshot>,
    /// Distributed tier counters (None when the tier is inactive)
    pub distributed: Option<TierMetricsSnapshot>,
    /// Entries currently held by the local tier
    pub local_entries: u64,
    /// Overall hit ratio
    pub hit_ratio: f64,
}

impl CacheStatsSnapshot {
    /// Get tier statistics by tier
    pub fn get_tier_stats(&self, tier: CacheTier) -> Option<&TierMetricsSnapshot> {
        match tier {
            CacheTier::Local => self.local.as_ref(),
            CacheTier::Distributed => self.distributed.as_ref(),
        }
    }
}

// =============================================================================
// Prometheus Exposition
// =============================================================================

/// Render a stats snapshot in the Prometheus text format
pub fn render_prometheus(stats: &CacheStatsSnapshot) -> Result<String> {
    let registry = Registry::new();
    let prom = |e: prometheus::Error| Error::Internal(format!("prometheus: {}", e));

    let tier_ops = IntCounterVec::new(
        Opts::new("market_cache_tier_operations_total", "Cache tier operations by kind"),
        &["tier", "op"],
    )
    .map_err(prom)?;
    let manager_ops = IntCounterVec::new(
        Opts::new("market_cache_manager_operations_total", "Cache manager operations by kind"),
        &["op"],
    )
    .map_err(prom)?;
    let entries = IntGaugeVec::new(
        Opts::new("market_cache_entries", "Entries held per tier"),
        &["tier"],
    )
    .map_err(prom)?;
    let hit_ratio = GaugeVec::new(
        Opts::new("market_cache_hit_ratio", "Hit ratio per scope"),
        &["scope"],
    )
    .map_err(prom)?;

    registry.register(Box::new(tier_ops.clone())).map_err(prom)?;
    registry.register(Box::new(manager_ops.clone())).map_err(prom)?;
    registry.register(Box::new(entries.clone())).map_err(prom)?;
    registry.register(Box::new(hit_ratio.clone())).map_err(prom)?;

    for tier in CacheTier::lookup_order() {
        let Some(snapshot) = stats.get_tier_stats(*tier) else {
            continue;
        };
        let label = match tier {
            CacheTier::Local => "local",
            CacheTier::Distributed => "distributed",
        };
        for (op, value) in [
            ("hit", snapshot.hits),
            ("miss", snapshot.misses),
            ("set", snapshot.sets),
            ("delete", snapshot.deletes),
            ("eviction", snapshot.evictions),
            ("cleanup", snapshot.cleanups),
            ("error", snapshot.errors),
            ("stale", snapshot.stale),
        ] {
            tier_ops.with_label_values(&[label, op]).inc_by(value);
        }
        hit_ratio.with_label_values(&[label]).set(snapshot.hit_ratio());
    }

    let m = &stats.manager;
    for (op, value) in [
        ("request", m.total_requests),
        ("local_hit", m.local_hits),
        ("distributed_hit", m.distributed_hits),
        ("miss", m.misses),
        ("error", m.errors),
        ("set", m.sets),
        ("delete", m.deletes),
        ("backfill", m.backfills),
    ] {
        manager_ops.with_label_values(&[op]).inc_by(value);
    }
    hit_ratio.with_label_values(&["overall"]).set(stats.hit_ratio);
    entries
        .with_label_values(&["local"])
        .set(stats.local_entries as i64);

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(prom)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
}
