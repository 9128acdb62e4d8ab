//! L1 Local Tier
//!
//! In-process key/value store with per-entry TTL, strict LRU eviction under
//! an entry-count ceiling, and glob-pattern bulk deletion.
//!
//! The map keeps entries in access order (front = least recently used), so
//! eviction always takes the front. Expiry is tracked in a single min-heap
//! keyed by expiry time; each entry carries a generation number, and heap
//! records whose generation no longer matches (the key was rewritten or
//! deleted) are discarded when popped.

use crate::cache::clock;
use crate::cache::entry::CacheEntry;
use crate::cache::events::CacheEvent;
use crate::cache::health::HealthStatus;
use crate::cache::key::KeyPattern;
use crate::cache::metrics::{TierMetrics, TierMetricsSnapshot};
use crate::config::LocalTierConfig;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Heap records beyond this multiple of live entries trigger a rebuild
const HEAP_COMPACTION_FACTOR: usize = 2;
const HEAP_COMPACTION_FLOOR: usize = 1024;

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    generation: u64,
}

#[derive(Debug, Default)]
struct LocalState {
    /// Entries in LRU order (front = oldest access)
    entries: IndexMap<String, Slot>,
    /// Pending expiries: (expires_at, generation, key)
    expiry: BinaryHeap<Reverse<(Instant, u64, String)>>,
    next_generation: u64,
    bytes: u64,
}

impl LocalState {
    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.shift_remove(key)?;
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (key, slot) = self.entries.shift_remove_index(0)?;
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
        Some(key)
    }

    fn touch(&mut self, index: usize) {
        let last = self.entries.len() - 1;
        if index != last {
            self.entries.move_index(index, last);
        }
    }

    fn compact_heap(&mut self) {
        if self.expiry.len() <= HEAP_COMPACTION_FLOOR
            || self.expiry.len() <= self.entries.len() * HEAP_COMPACTION_FACTOR
        {
            return;
        }
        self.expiry = self
            .entries
            .iter()
            .filter_map(|(key, slot)| {
                slot.entry
                    .expires_at
                    .map(|at| Reverse((at, slot.generation, key.clone())))
            })
            .collect();
    }

    fn clear(&mut self) -> u64 {
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.expiry.clear();
        self.bytes = 0;
        count
    }
}

// =============================================================================
// Local Tier
// =============================================================================

/// L1 in-process cache
pub struct LocalTier {
    state: Mutex<LocalState>,
    config: LocalTierConfig,
    metrics: TierMetrics,
    events: Option<broadcast::Sender<CacheEvent>>,
}

impl LocalTier {
    /// Create a local tier
    pub fn new(config: LocalTierConfig) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            config,
            metrics: TierMetrics::new(),
            events: None,
        }
    }

    /// Create a local tier that reports evictions and expiries
    pub fn with_events(config: LocalTierConfig, events: broadcast::Sender<CacheEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(config)
        }
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Look up a live value, refreshing its LRU position
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = clock::now();
        let mut state = self.state.lock();

        let Some(index) = state.entries.get_index_of(key) else {
            drop(state);
            self.metrics.record_miss();
            return None;
        };

        if state.entries[index].entry.is_expired_at(now) {
            state.remove(key);
            drop(state);
            self.metrics.record_cleanups(1);
            self.metrics.record_miss();
            debug!(key = %key, "local entry expired on read");
            return None;
        }

        let value = {
            let slot = &mut state.entries[index];
            slot.entry.record_access(now);
            slot.entry.value.clone()
        };
        state.touch(index);
        drop(state);

        self.metrics.record_hit();
        Some(value)
    }

    /// Existence check; applies expiry but leaves LRU order alone
    pub fn has(&self, key: &str) -> bool {
        let now = clock::now();
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(slot) => slot.entry.is_expired_at(now),
            None => return false,
        };
        if expired {
            state.remove(key);
            drop(state);
            self.metrics.record_cleanups(1);
            return false;
        }
        true
    }

    /// Store a value. `ttl = None` applies the configured default TTL.
    ///
    /// A new key at capacity first evicts the least recently used entry.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let ttl = ttl.or_else(|| self.config.default_ttl());
        let entry = CacheEntry::new(key, value, ttl);
        let mut evicted = Vec::new();

        {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;

            if let Some(expires_at) = entry.expires_at {
                state
                    .expiry
                    .push(Reverse((expires_at, generation, key.to_string())));
            }

            if let Some(old) = state.remove(key) {
                // Rewrites keep no trace of the old expiry: its heap record
                // carries a stale generation.
                debug!(key = %key, previous_generation = old.generation, "replacing local entry");
            } else {
                while state.entries.len() >= self.config.max_entries {
                    match state.evict_lru() {
                        Some(victim) => evicted.push(victim),
                        None => break,
                    }
                }
            }

            state.bytes += entry.size_bytes;
            state.entries.insert(key.to_string(), Slot { entry, generation });
            state.compact_heap();
        }

        self.metrics.record_set();
        for victim in evicted {
            self.metrics.record_eviction();
            debug!(key = %victim, "evicted least recently used local entry");
            self.emit(CacheEvent::Evict { key: victim });
        }
        true
    }

    /// Remove a key; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.metrics.record_deletes(1);
        }
        removed
    }

    /// Remove every key matching `pattern`; returns the number removed
    pub fn delete_by_pattern(&self, pattern: &KeyPattern) -> u64 {
        let removed = {
            let mut state = self.state.lock();
            if pattern.is_match_all() {
                state.clear()
            } else {
                let before = state.entries.len();
                let mut freed = 0u64;
                state.entries.retain(|key, slot| {
                    let keep = !pattern.matches(key);
                    if !keep {
                        freed += slot.entry.size_bytes;
                    }
                    keep
                });
                state.bytes = state.bytes.saturating_sub(freed);
                (before - state.entries.len()) as u64
            }
        };

        if removed > 0 {
            self.metrics.record_deletes(removed);
            debug!(pattern = %pattern, removed, "deleted local entries by pattern");
        }
        removed
    }

    /// Remove every entry; returns the number removed
    pub fn clear(&self) -> u64 {
        let removed = self.state.lock().clear();
        info!(removed, "cleared local tier");
        removed
    }

    /// Remove entries whose expiry has passed; returns the number removed
    pub fn sweep_expired(&self) -> u64 {
        let now = clock::now();
        let mut removed = 0u64;
        {
            let mut state = self.state.lock();
            while let Some(Reverse((at, generation, _))) = state.expiry.peek() {
                if *at >= now {
                    break;
                }
                let generation = *generation;
                let Some(Reverse((_, _, key))) = state.expiry.pop() else {
                    break;
                };
                let live = state
                    .entries
                    .get(&key)
                    .is_some_and(|slot| slot.generation == generation);
                if live {
                    state.remove(&key);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.metrics.record_cleanups(removed);
            debug!(removed, "swept expired local entries");
            self.emit(CacheEvent::Expired { count: removed });
        }
        removed
    }

    /// Spawn the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tier = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tier.sweep_expired();
                    }
                }
            }
            debug!("local tier sweeper stopped");
        })
    }

    /// Number of entries held (including not-yet-swept expired ones)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in LRU order, least recently used first
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Remaining TTL of a key, if present and expiring
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .get(key)
            .and_then(|slot| slot.entry.remaining_ttl())
    }

    /// Configured entry ceiling
    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    /// Counter snapshot
    pub fn stats(&self) -> TierMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the tier's counters
    pub fn reset_stats(&self) {
        self.metrics.reset();
    }

    /// Health and utilization report
    pub fn health(&self) -> LocalTierHealth {
        let (entries, bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.bytes)
        };
        let utilization = entries as f64 / self.config.max_entries as f64;
        let status = if utilization > self.config.high_water_mark {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let stats = self.stats();

        LocalTierHealth {
            status,
            entries,
            max_entries: self.config.max_entries,
            utilization_pct: utilization * 100.0,
            hit_rate: stats.hit_ratio(),
            estimated_memory_bytes: bytes,
            stats,
        }
    }
}

/// Local tier health report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTierHealth {
    pub status: HealthStatus,
    pub entries: usize,
    pub max_entries: usize,
    pub utilization_pct: f64,
    pub hit_rate: f64,
    pub estimated_memory_bytes: u64,
    pub stats: TierMetricsSnapshot,
}
