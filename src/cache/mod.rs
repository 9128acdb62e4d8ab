//! Multi-Tier Caching System
//!
//! A two-tier cache for the market-data backend:
//! - **Local**: in-process LRU with per-entry TTL, fastest path
//! - **Distributed**: shared Redis store, survives restarts and is visible
//!   to every instance
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                               │
//! │      strategy · TTL table · backfill · aggregate statistics          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐            ┌──────────────────────────────┐   │
//! │  │   Local Tier     │   miss →   │     Distributed Tier         │   │
//! │  │ (IndexMap LRU +  │  ← backfill│  (Redis / in-memory store)   │   │
//! │  │  expiry heap)    │            │  freshness · soft failure    │   │
//! │  └────────┬─────────┘            └──────────────┬───────────────┘   │
//! │           └──────────────┬──────────────────────┘                   │
//! │                 ┌────────┴─────────┐        pub/sub                 │
//! │                 │ Invalidation     │ ◄────────────────► other       │
//! │                 │ Engine           │                    instances   │
//! │                 └──────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use market_cache::cache::{CacheDomain, CacheManager, DomainType, InvalidationContext};
//! use market_cache::CacheConfig;
//!
//! let cache = CacheManager::initialize(CacheConfig::default()).await?;
//!
//! cache.set_market_data(CacheDomain::MarketCommodity, "Gold", Some("Sol"), &prices).await;
//! let cached = cache.get_market_data(CacheDomain::MarketCommodity, "Gold", Some("Sol")).await;
//!
//! // A new price arrived for Gold
//! let ctx = InvalidationContext::new().commodity("Gold");
//! cache.invalidate(DomainType::MarketData, "new_price_data", &ctx).await;
//!
//! cache.close().await;
//! ```

pub mod clock;
pub mod distributed;
pub mod entry;
pub mod events;
pub mod health;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod manager;
pub mod metrics;
pub mod tier;

// Re-export main types
pub use distributed::{DistributedStore, DistributedTier, MemoryStore, RedisStore, SharedStore};
pub use entry::StoredPayload;
pub use events::CacheEvent;
pub use health::{HealthReport, HealthStatus};
pub use invalidation::{DomainType, InvalidationContext, InvalidationEngine, InvalidationStrategy};
pub use key::{CacheDomain, CacheKey, KeyPattern};
pub use local::LocalTier;
pub use manager::{CacheManager, GetOptions, InitStatus, ResponseTimeStats, SetOptions};
pub use metrics::{render_prometheus, CacheStatsSnapshot, TierMetricsSnapshot};
pub use tier::{CacheStrategy, CacheTier};
