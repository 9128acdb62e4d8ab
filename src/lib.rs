//! Market Cache
//!
//! Multi-tier cache for a real-time market-data backend: an in-process LRU
//! tier in front of a shared Redis tier, with domain-specific TTLs and
//! event-driven invalidation propagated between instances over pub/sub.
//!
//! # Modules
//!
//! - [`cache`]: tiers, cache manager and invalidation engine
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types and handling

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheDomain, CacheEvent, CacheKey, CacheManager, CacheStrategy, CacheTier, DomainType,
    GetOptions, HealthReport, HealthStatus, InvalidationContext, SetOptions,
};

pub use config::{CacheConfig, DistributedConfig, LocalTierConfig};

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
