//! Cache Manager
//!
//! Façade over the local and distributed tiers. Runs the configured
//! strategy, applies the per-domain TTL table, owns the invalidation engine
//! and the background tasks, and keeps aggregate statistics.

use crate::cache::distributed::{self, DistributedTier, Lookup, SharedStore};
use crate::cache::events::CacheEvent;
use crate::cache::health::{HealthComponents, HealthReport, HealthStatus};
use crate::cache::invalidation::{
    DomainType, InvalidationContext, InvalidationEngine, CHANNELS,
};
use crate::cache::key::{CacheDomain, CacheKey, MARKET_NAMESPACE, MINING_NAMESPACE, STATS_NAMESPACE};
use crate::cache::local::LocalTier;
use crate::cache::metrics::{CacheStatsSnapshot, ManagerMetrics};
use crate::cache::tier::{CacheStrategy, CacheTier};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Samples kept per API response-time series
pub const MAX_RESPONSE_SAMPLES: usize = 100;

// =============================================================================
// Options
// =============================================================================

/// Per-call options for [`CacheManager::get`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Narrow the tiers consulted for this call
    pub strategy_override: Option<CacheStrategy>,
    /// TTL of the local copy written on a distributed hit
    pub backfill_ttl: Option<Duration>,
}

impl GetOptions {
    pub fn with_strategy(strategy: CacheStrategy) -> Self {
        Self {
            strategy_override: Some(strategy),
            ..Default::default()
        }
    }
}

/// Per-call options for [`CacheManager::set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// TTL in the distributed tier (None = tier default)
    pub distributed_ttl: Option<Duration>,
    /// TTL in the local tier (None = tier default)
    pub local_ttl: Option<Duration>,
    /// Narrow the tiers written for this call
    pub strategy_override: Option<CacheStrategy>,
}

impl SetOptions {
    /// Same TTL in every tier
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            distributed_ttl: Some(ttl),
            local_ttl: Some(ttl),
            strategy_override: None,
        }
    }
}

// =============================================================================
// Status Types
// =============================================================================

/// Outcome of [`CacheManager::initialize`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitStatus {
    pub initialized: bool,
    pub requested: CacheStrategy,
    pub strategy: CacheStrategy,
    pub downgraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Summary of an API response-time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimeStats {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

impl ResponseTimeStats {
    /// Summarize samples; None when empty
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let rank = ((count as f64) * 0.95).ceil() as usize;
        Some(Self {
            count,
            avg_ms: sorted.iter().sum::<f64>() / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            p95_ms: sorted[rank.clamp(1, count) - 1],
        })
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Multi-tier cache manager
pub struct CacheManager {
    config: CacheConfig,
    requested: CacheStrategy,
    strategy: CacheStrategy,
    downgrade_reason: Option<String>,
    local: Option<Arc<LocalTier>>,
    distributed: Option<Arc<DistributedTier>>,
    engine: Arc<InvalidationEngine>,
    metrics: ManagerMetrics,
    event_tx: broadcast::Sender<CacheEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Serializes read-modify-write of one response-time key
    sample_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("requested", &self.requested)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build the tiers for the configured strategy and start background work.
    ///
    /// `hybrid` with an unreachable distributed tier runs `memory-only` for
    /// the manager's lifetime; `distributed-only` fails instead.
    pub async fn initialize(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = if config.strategy.uses_distributed() {
            Some(distributed::connect(&config.distributed).await)
        } else {
            None
        };
        Self::build(config, store).await
    }

    /// Like [`initialize`](Self::initialize), over an existing store
    pub async fn with_store(config: CacheConfig, store: SharedStore) -> Result<Arc<Self>> {
        config.validate()?;
        Self::build(config, Some(Ok(store))).await
    }

    async fn build(config: CacheConfig, store: Option<Result<SharedStore>>) -> Result<Arc<Self>> {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let requested = config.strategy;
        let mut strategy = requested;
        let mut downgrade_reason = None;

        let distributed = match store {
            Some(store) if requested.uses_distributed() => {
                let attempt = match store {
                    Ok(store) => {
                        let tier = DistributedTier::new(
                            store,
                            config.distributed.clone(),
                            config.freshness.clone(),
                        );
                        tier.verify().await.map(|_| tier)
                    }
                    Err(e) => Err(e),
                };
                match attempt {
                    Ok(tier) => Some(Arc::new(tier)),
                    Err(e) if requested == CacheStrategy::DistributedOnly => {
                        error!(error = %e, "distributed tier unreachable");
                        return Err(Error::DistributedUnavailable {
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            requested = %requested,
                            "distributed tier unreachable, running memory-only"
                        );
                        strategy = CacheStrategy::MemoryOnly;
                        let _ = event_tx.send(CacheEvent::TierUnavailable {
                            tier: CacheTier::Distributed,
                            reason: e.to_string(),
                        });
                        let _ = event_tx.send(CacheEvent::StrategyDowngraded {
                            requested,
                            active: strategy,
                            reason: e.to_string(),
                        });
                        downgrade_reason = Some(e.to_string());
                        None
                    }
                }
            }
            _ => None,
        };

        if strategy.uses_distributed() && distributed.is_none() {
            return Err(Error::Configuration(format!(
                "strategy {} requires a distributed store",
                strategy
            )));
        }

        let local = strategy
            .uses_local()
            .then(|| Arc::new(LocalTier::with_events(config.local.clone(), event_tx.clone())));

        let engine = Arc::new(InvalidationEngine::new(
            local.clone(),
            distributed.clone(),
            config.invalidation.clone(),
            Some(event_tx.clone()),
        ));

        let manager = Arc::new(Self {
            requested,
            strategy,
            downgrade_reason,
            local,
            distributed,
            engine,
            metrics: ManagerMetrics::new(),
            event_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            sample_locks: DashMap::new(),
            config,
        });
        manager.start_background_tasks().await;

        info!(
            requested = %manager.requested,
            strategy = %manager.strategy,
            instance_id = %manager.engine.instance_id(),
            "cache manager initialized"
        );
        Ok(manager)
    }

    async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        if let Some(local) = &self.local {
            tasks.push(local.spawn_sweeper(self.cancel.clone()));
        }
        tasks.extend(self.engine.spawn_schedules(self.cancel.clone()));
        tasks.push(self.engine.spawn_deferred_flush(self.cancel.clone()));

        if let Some(distributed) = &self.distributed {
            match distributed.subscribe(&CHANNELS).await {
                Ok(rx) => tasks.push(self.engine.spawn_listener(rx, self.cancel.clone())),
                Err(e) => warn!(error = %e, "cannot subscribe to invalidation channels"),
            }
        }

        if self.config.stats_interval_secs > 0 {
            tasks.push(Self::spawn_stats_reporter(
                Arc::downgrade(self),
                Duration::from_secs(self.config.stats_interval_secs),
                self.cancel.clone(),
            ));
        }

        self.tasks.lock().extend(tasks);
    }

    fn spawn_stats_reporter(
        manager: Weak<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.report_stats();
                    }
                }
            }
        })
    }

    fn report_stats(&self) {
        let stats = self.stats();
        let distributed_errors = stats.distributed.map(|d| d.errors).unwrap_or(0);
        info!(
            total_requests = stats.manager.total_requests,
            hit_ratio = stats.hit_ratio,
            local_entries = stats.local_entries,
            distributed_errors,
            "cache statistics"
        );
        self.emit(CacheEvent::StatsSnapshot {
            total_requests: stats.manager.total_requests,
            hit_ratio: stats.hit_ratio,
            local_entries: stats.local_entries,
            distributed_errors,
        });
    }

    /// Stop background tasks and apply queued invalidations
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!("cache manager closed");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Initialization outcome
    pub fn status(&self) -> InitStatus {
        InitStatus {
            initialized: !self.closed.load(Ordering::SeqCst),
            requested: self.requested,
            strategy: self.strategy,
            downgraded: self.downgrade_reason.is_some(),
            reason: self.downgrade_reason.clone(),
        }
    }

    /// Strategy actually running
    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn local_tier(&self) -> Option<&Arc<LocalTier>> {
        self.local.as_ref()
    }

    pub fn distributed_tier(&self) -> Option<&Arc<DistributedTier>> {
        self.distributed.as_ref()
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.engine
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    fn effective(&self, requested: Option<CacheStrategy>) -> CacheStrategy {
        requested
            .map(|s| s.constrain(self.strategy))
            .unwrap_or(self.strategy)
    }

    fn distributed_active(&self) -> bool {
        self.distributed.is_some()
    }

    // =========================================================================
    // Core Operations
    // =========================================================================

    /// Look a key up through the active tiers.
    ///
    /// A distributed hit is copied into the local tier with a short TTL.
    pub async fn get(&self, key: &str, options: &GetOptions) -> Option<Value> {
        self.metrics.record_request();
        let strategy = self.effective(options.strategy_override);

        if strategy.uses_local() {
            if let Some(value) = self.local.as_ref().and_then(|local| local.get(key)) {
                self.metrics.record_hit(CacheTier::Local);
                self.emit(CacheEvent::Hit {
                    key: key.to_string(),
                    tier: CacheTier::Local,
                    backfilled: false,
                });
                return Some(value);
            }
        }

        if strategy.uses_distributed() {
            if let Some(distributed) = &self.distributed {
                let epoch = self.engine.epoch();
                match distributed.lookup(key).await {
                    Lookup::Hit(value) => {
                        self.metrics.record_hit(CacheTier::Distributed);
                        // A deletion that finished during the lookup may have
                        // removed this value already
                        let current = self.engine.epoch() == epoch;
                        if !current && strategy.uses_local() {
                            debug!(key = %key, "skipping backfill after concurrent invalidation");
                        }
                        let backfilled = current
                            && strategy.uses_local()
                            && self.backfill(key, &value, options.backfill_ttl);
                        debug!(key = %key, backfilled, "distributed hit");
                        self.emit(CacheEvent::Hit {
                            key: key.to_string(),
                            tier: CacheTier::Distributed,
                            backfilled,
                        });
                        return Some(value);
                    }
                    Lookup::Miss => {}
                    Lookup::Failed => self.metrics.record_error(),
                }
            }
        }

        self.metrics.record_miss();
        self.emit(CacheEvent::Miss {
            key: key.to_string(),
        });
        None
    }

    fn backfill(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        let Some(local) = &self.local else {
            return false;
        };
        let mut ttl = ttl.unwrap_or_else(|| self.config.backfill_ttl());
        if let Some(domain) = domain_of(key) {
            match self.config.ttl.get(domain).local_ttl() {
                Some(local_ttl) => ttl = ttl.min(local_ttl),
                None => return false,
            }
        }
        let stored = local.set(key, value.clone(), Some(ttl));
        if stored {
            self.metrics.record_backfill();
        }
        stored
    }

    /// Typed [`get`](Self::get)
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, options: &GetOptions) -> Option<T> {
        let value = self.get(key, options).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key = %key, error = %e, "cached value has unexpected shape");
                None
            }
        }
    }

    /// Store a value in the active tiers; true if any tier accepted it
    pub async fn set(&self, key: &str, value: &Value, options: &SetOptions) -> bool {
        let strategy = self.effective(options.strategy_override);
        let mut stored = false;

        if strategy.uses_distributed() {
            if let Some(distributed) = &self.distributed {
                if distributed.set(key, value, options.distributed_ttl).await {
                    stored = true;
                    self.emit(CacheEvent::Set {
                        key: key.to_string(),
                        tier: CacheTier::Distributed,
                    });
                }
            }
        }

        if strategy.uses_local() {
            if let Some(local) = &self.local {
                let skip = options.local_ttl.is_none()
                    && self.distributed_active()
                    && domain_of(key).is_some_and(|d| self.config.ttl.get(d).local.is_none());
                if !skip && local.set(key, value.clone(), options.local_ttl) {
                    stored = true;
                    self.emit(CacheEvent::Set {
                        key: key.to_string(),
                        tier: CacheTier::Local,
                    });
                }
            }
        }

        if stored {
            self.metrics.record_set();
        } else {
            self.metrics.record_error();
            debug!(key = %key, "no tier accepted value");
        }
        stored
    }

    /// Typed [`set`](Self::set)
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, options: &SetOptions) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, &value, options).await,
            Err(e) => {
                warn!(key = %key, error = %e, "value is not serializable");
                false
            }
        }
    }

    /// Delete from every active tier; true if any tier had the key
    pub async fn del(&self, key: &str) -> bool {
        let mut deleted = false;
        if let Some(local) = &self.local {
            if local.delete(key) {
                deleted = true;
                self.emit(CacheEvent::Delete {
                    key: key.to_string(),
                    tier: CacheTier::Local,
                });
            }
        }
        if let Some(distributed) = &self.distributed {
            if distributed.delete(key).await {
                deleted = true;
                self.emit(CacheEvent::Delete {
                    key: key.to_string(),
                    tier: CacheTier::Distributed,
                });
            }
        }
        self.engine.advance_epoch();
        if deleted {
            self.metrics.record_delete();
        }
        deleted
    }

    // =========================================================================
    // Domain Wrappers
    // =========================================================================

    /// Options applying the TTL table to one domain.
    ///
    /// Domains without a local TTL skip the local tier while a distributed
    /// tier is active; without one, the local tier holds them for the
    /// distributed TTL.
    fn domain_options(&self, domain: CacheDomain) -> (GetOptions, SetOptions) {
        let ttl = self.config.ttl.get(domain);
        let (strategy_override, local_ttl) = match ttl.local_ttl() {
            Some(local_ttl) => (None, Some(local_ttl)),
            None if self.distributed_active() => (Some(CacheStrategy::DistributedOnly), None),
            None => (None, Some(ttl.distributed_ttl())),
        };
        let get = GetOptions {
            strategy_override,
            backfill_ttl: ttl.local_ttl(),
        };
        let set = SetOptions {
            distributed_ttl: Some(ttl.distributed_ttl()),
            local_ttl,
            strategy_override,
        };
        (get, set)
    }

    async fn get_domain(&self, domain: CacheDomain, key: &CacheKey) -> Option<Value> {
        let (options, _) = self.domain_options(domain);
        self.get(&key.to_storage_key(), &options).await
    }

    async fn set_domain(&self, domain: CacheDomain, key: &CacheKey, value: &Value) -> bool {
        let (_, options) = self.domain_options(domain);
        self.set(&key.to_storage_key(), value, &options).await
    }

    fn check_namespace(domain: CacheDomain, namespace: &str) -> bool {
        if domain.namespace() == namespace {
            true
        } else {
            warn!(domain = %domain, expected = namespace, "domain does not belong to namespace");
            false
        }
    }

    /// `market:{type}:{key}[:{system}]`
    pub async fn get_market_data(
        &self,
        domain: CacheDomain,
        key: &str,
        system: Option<&str>,
    ) -> Option<Value> {
        if !Self::check_namespace(domain, MARKET_NAMESPACE) {
            return None;
        }
        let cache_key = CacheKey::market(domain.subtype(), key, system);
        self.get_domain(domain, &cache_key).await
    }

    pub async fn set_market_data(
        &self,
        domain: CacheDomain,
        key: &str,
        system: Option<&str>,
        value: &Value,
    ) -> bool {
        if !Self::check_namespace(domain, MARKET_NAMESPACE) {
            return false;
        }
        let cache_key = CacheKey::market(domain.subtype(), key, system);
        self.set_domain(domain, &cache_key, value).await
    }

    /// `mining:{type}:{filter-hash}`
    pub async fn get_mining_data(&self, domain: CacheDomain, filters: &Value) -> Option<Value> {
        if !Self::check_namespace(domain, MINING_NAMESPACE) {
            return None;
        }
        self.get_domain(domain, &CacheKey::mining(domain.subtype(), filters))
            .await
    }

    pub async fn set_mining_data(&self, domain: CacheDomain, filters: &Value, value: &Value) -> bool {
        if !Self::check_namespace(domain, MINING_NAMESPACE) {
            return false;
        }
        self.set_domain(domain, &CacheKey::mining(domain.subtype(), filters), value)
            .await
    }

    /// `stats:{type}:{filter-hash}`
    pub async fn get_statistics(&self, domain: CacheDomain, filters: &Value) -> Option<Value> {
        if !Self::check_namespace(domain, STATS_NAMESPACE) {
            return None;
        }
        self.get_domain(domain, &CacheKey::stats(domain.subtype(), filters))
            .await
    }

    pub async fn set_statistics(&self, domain: CacheDomain, filters: &Value, value: &Value) -> bool {
        if !Self::check_namespace(domain, STATS_NAMESPACE) {
            return false;
        }
        self.set_domain(domain, &CacheKey::stats(domain.subtype(), filters), value)
            .await
    }

    /// `server:metrics:current`
    pub async fn get_server_metrics(&self) -> Option<Value> {
        self.get_domain(CacheDomain::ServerMetrics, &CacheKey::server_metrics())
            .await
    }

    pub async fn set_server_metrics(&self, metrics: &Value) -> bool {
        self.set_domain(CacheDomain::ServerMetrics, &CacheKey::server_metrics(), metrics)
            .await
    }

    /// Append a response-time sample to `api:response_times:{endpoint}:{method}`,
    /// keeping the most recent samples.
    ///
    /// Concurrent calls for the same key are serialized within this manager.
    /// Managers in other processes sharing the distributed tier can still
    /// overwrite each other's samples.
    pub async fn record_api_response_time(&self, endpoint: &str, method: &str, millis: f64) -> bool {
        let key = CacheKey::api_response_times(endpoint, method);
        let lock = self
            .sample_locks
            .entry(key.to_storage_key())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let mut samples: Vec<f64> = self
            .get_domain(CacheDomain::StatsApiUsage, &key)
            .await
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        samples.push(millis);
        if samples.len() > MAX_RESPONSE_SAMPLES {
            let excess = samples.len() - MAX_RESPONSE_SAMPLES;
            samples.drain(..excess);
        }
        self.set_domain(CacheDomain::StatsApiUsage, &key, &Value::from(samples))
            .await
    }

    /// Summary of recorded response times
    pub async fn api_response_stats(&self, endpoint: &str, method: &str) -> Option<ResponseTimeStats> {
        let key = CacheKey::api_response_times(endpoint, method);
        let value = self.get_domain(CacheDomain::StatsApiUsage, &key).await?;
        let samples: Vec<f64> = serde_json::from_value(value).ok()?;
        ResponseTimeStats::from_samples(&samples)
    }

    /// `connections:{type}:count`
    pub async fn set_connection_count(&self, kind: &str, count: u64) -> bool {
        self.set_domain(
            CacheDomain::ServerMetrics,
            &CacheKey::connections(kind),
            &Value::from(count),
        )
        .await
    }

    pub async fn connection_count(&self, kind: &str) -> Option<u64> {
        self.get_domain(CacheDomain::ServerMetrics, &CacheKey::connections(kind))
            .await
            .and_then(|v| v.as_u64())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// See [`InvalidationEngine::invalidate`]
    pub async fn invalidate(
        &self,
        domain: DomainType,
        trigger: &str,
        context: &InvalidationContext,
    ) -> bool {
        self.engine.invalidate(domain, trigger, context).await
    }

    /// See [`InvalidationEngine::bulk_invalidate`]
    pub async fn bulk_invalidate(&self, pattern: &str) -> u64 {
        self.engine.bulk_invalidate(pattern).await
    }

    /// Apply queued invalidations now
    pub async fn flush_pending(&self) -> u64 {
        self.engine.flush_pending().await
    }

    // =========================================================================
    // Health & Stats
    // =========================================================================

    /// Aggregate statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        let manager = self.metrics.snapshot();
        CacheStatsSnapshot {
            manager,
            local: self.local.as_ref().map(|l| l.stats()),
            distributed: self.distributed.as_ref().map(|d| d.stats()),
            local_entries: self.local.as_ref().map(|l| l.len() as u64).unwrap_or(0),
            hit_ratio: manager.hit_ratio(),
        }
    }

    /// Composite health: healthy only if every active component is, and the
    /// requested strategy is running
    pub async fn health_check(&self) -> HealthReport {
        let local = self.local.as_ref().map(|l| l.health());
        let distributed = match &self.distributed {
            Some(d) => Some(d.health().await),
            None => None,
        };
        let invalidation = self.engine.health();

        let mut statuses = vec![invalidation.status];
        statuses.extend(local.as_ref().map(|h| h.status));
        statuses.extend(distributed.as_ref().map(|h| h.status));
        if self.downgrade_reason.is_some() {
            statuses.push(HealthStatus::Degraded);
        }

        HealthReport {
            status: HealthStatus::combine(statuses),
            strategy: self.strategy.to_string(),
            components: HealthComponents {
                local_tier: local,
                distributed_tier: distributed,
                invalidation,
            },
            stats: self.stats(),
            timestamp: Utc::now(),
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// TTL domain a storage key belongs to, if any
pub fn domain_of(key: &str) -> Option<CacheDomain> {
    CacheDomain::ALL.into_iter().find(|domain| {
        key.strip_prefix(domain.namespace())
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|rest| rest.strip_prefix(domain.subtype()))
            .is_some_and(|rest| rest.starts_with(':'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::distributed::MemoryStore;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn config(strategy: CacheStrategy) -> CacheConfig {
        CacheConfig {
            strategy,
            stats_interval_secs: 0,
            ..Default::default()
        }
    }

    async fn hybrid(store: Arc<MemoryStore>) -> Arc<CacheManager> {
        CacheManager::with_store(config(CacheStrategy::Hybrid), store)
            .await
            .unwrap()
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("market:commodity:Gold:Sol"), Some(CacheDomain::MarketCommodity));
        assert_eq!(domain_of("mining:hotspots:abc"), Some(CacheDomain::MiningHotspots));
        assert_eq!(domain_of("server:metrics:current"), Some(CacheDomain::ServerMetrics));
        assert_eq!(domain_of("stats:api_usage:x"), Some(CacheDomain::StatsApiUsage));
        assert_eq!(domain_of("market:commodityx:Gold"), None);
        assert_eq!(domain_of("custom:key"), None);
    }

    #[test]
    fn test_response_time_stats() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let stats = ResponseTimeStats::from_samples(&samples).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert_eq!(stats.p95_ms, 95.0);
        assert!((stats.avg_ms - 50.5).abs() < f64::EPSILON);
        assert!(ResponseTimeStats::from_samples(&[]).is_none());
    }

    #[tokio::test]
    async fn test_memory_only_round_trip() {
        let manager = CacheManager::initialize(config(CacheStrategy::MemoryOnly))
            .await
            .unwrap();
        assert!(manager.distributed_tier().is_none());

        let value = json!({"name": "Gold", "prices": [9000, 9500], "nested": {"ok": true}});
        assert!(manager.set("custom:key", &value, &SetOptions::default()).await);
        assert_eq!(manager.get("custom:key", &GetOptions::default()).await, Some(value));
        assert!(manager.del("custom:key").await);
        assert_eq!(manager.get("custom:key", &GetOptions::default()).await, None);

        let stats = manager.stats().manager;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.misses, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_distributed_hit_backfills_local() {
        let store = Arc::new(MemoryStore::new());
        let manager = hybrid(store.clone()).await;
        let value = json!({"sell": 9500});

        manager
            .set(
                "custom:key",
                &value,
                &SetOptions {
                    strategy_override: Some(CacheStrategy::DistributedOnly),
                    ..Default::default()
                },
            )
            .await;
        let local = manager.local_tier().unwrap();
        assert!(!local.has("custom:key"));

        assert_eq!(manager.get("custom:key", &GetOptions::default()).await, Some(value.clone()));
        assert!(local.has("custom:key"));
        assert_eq!(manager.get("custom:key", &GetOptions::default()).await, Some(value));

        let stats = manager.stats().manager;
        assert_eq!(stats.distributed_hits, 1);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.backfills, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_hybrid_downgrades_when_unreachable() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let manager = hybrid(store).await;

        let status = manager.status();
        assert!(status.initialized);
        assert!(status.downgraded);
        assert_eq!(status.strategy, CacheStrategy::MemoryOnly);
        assert_eq!(manager.health_check().await.status, HealthStatus::Degraded);

        assert!(manager.set("k", &json!(1), &SetOptions::default()).await);
        assert_eq!(manager.get("k", &GetOptions::default()).await, Some(json!(1)));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_distributed_only_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let result = CacheManager::with_store(config(CacheStrategy::DistributedOnly), store).await;
        assert_matches!(result, Err(Error::DistributedUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_outage_after_start_soft_fails() {
        let store = Arc::new(MemoryStore::new());
        let manager = hybrid(store.clone()).await;
        manager.set("k", &json!(1), &SetOptions::default()).await;

        store.set_available(false);
        // Local copy still served
        assert_eq!(manager.get("k", &GetOptions::default()).await, Some(json!(1)));
        // Local write still succeeds
        assert!(manager.set("j", &json!(2), &SetOptions::default()).await);
        assert_eq!(manager.get("missing", &GetOptions::default()).await, None);
        assert_eq!(manager.stats().manager.errors, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_mining_data_skips_local_tier() {
        let store = Arc::new(MemoryStore::new());
        let manager = hybrid(store.clone()).await;
        let filters = json!({"commodity": "Painite", "ring": "metallic"});

        assert!(
            manager
                .set_mining_data(CacheDomain::MiningHotspots, &filters, &json!(["HIP 21991"]))
                .await
        );
        assert_eq!(manager.local_tier().unwrap().len(), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(
            manager.get_mining_data(CacheDomain::MiningHotspots, &filters).await,
            Some(json!(["HIP 21991"]))
        );
        // Not backfilled
        assert_eq!(manager.local_tier().unwrap().len(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_wrong_namespace_is_rejected() {
        let manager = CacheManager::initialize(config(CacheStrategy::MemoryOnly))
            .await
            .unwrap();
        assert!(
            !manager
                .set_market_data(CacheDomain::StatsGlobal, "Gold", None, &json!(1))
                .await
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn test_api_response_samples_are_capped() {
        let manager = CacheManager::initialize(config(CacheStrategy::MemoryOnly))
            .await
            .unwrap();
        for n in 0..120 {
            manager
                .record_api_response_time("/api/market", "get", n as f64)
                .await;
        }
        let stats = manager.api_response_stats("/api/market", "GET").await.unwrap();
        assert_eq!(stats.count, MAX_RESPONSE_SAMPLES);
        assert_eq!(stats.min_ms, 20.0);
        assert_eq!(stats.max_ms, 119.0);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_samples_are_all_kept() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_millis(1));
        let manager = hybrid(store).await;

        let handles: Vec<_> = (0..20)
            .map(|n| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .record_api_response_time("/api/market", "GET", n as f64)
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let stats = manager.api_response_stats("/api/market", "GET").await.unwrap();
        assert_eq!(stats.count, 20);
        assert_eq!(stats.min_ms, 0.0);
        assert_eq!(stats.max_ms, 19.0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_connection_counts() {
        let store = Arc::new(MemoryStore::new());
        let manager = hybrid(store).await;
        assert!(manager.set_connection_count("websocket", 42).await);
        assert_eq!(manager.connection_count("websocket").await, Some(42));
        assert_eq!(manager.connection_count("sse").await, None);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_typed_accessors() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Price {
            commodity: String,
            sell: u32,
        }

        let manager = CacheManager::initialize(config(CacheStrategy::MemoryOnly))
            .await
            .unwrap();
        let price = Price {
            commodity: "Gold".into(),
            sell: 9500,
        };
        assert!(manager.set_as("custom:price", &price, &SetOptions::default()).await);
        let cached: Option<Price> = manager.get_as("custom:price", &GetOptions::default()).await;
        assert_eq!(cached, Some(price));

        let wrong: Option<Vec<u8>> = manager.get_as("custom:price", &GetOptions::default()).await;
        assert!(wrong.is_none());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_health_report_shape() {
        let store = Arc::new(MemoryStore::new());
        let manager = hybrid(store).await;
        let report = manager.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["components"]["localTier"].is_object());
        assert!(json["components"]["distributedTier"].is_object());
        assert!(json["components"]["invalidation"]["strategies"].is_array());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = CacheManager::initialize(config(CacheStrategy::MemoryOnly))
            .await
            .unwrap();
        manager.close().await;
        manager.close().await;
        assert!(!manager.status().initialized);
    }
}
