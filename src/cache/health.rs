//! Health Reporting
//!
//! Component and composite health for the cache subsystem.

use crate::cache::distributed::DistributedTierHealth;
use crate::cache::invalidation::InvalidationHealth;
use crate::cache::local::LocalTierHealth;
use crate::cache::metrics::CacheStatsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Health classification of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Composite status: healthy only if every component is
    pub fn combine(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        if statuses.into_iter().all(|s| s.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Per-component health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthComponents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_tier: Option<LocalTierHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed_tier: Option<DistributedTierHealth>,
    pub invalidation: InvalidationHealth,
}

/// Composite health report of the cache manager
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub strategy: String,
    pub components: HealthComponents,
    pub stats: CacheStatsSnapshot,
    pub timestamp: DateTime<Utc>,
}
