//! In-process store with Redis semantics.
//!
//! Shared by `Arc` between cache managers in one process it behaves like a
//! single Redis database: TTLs, glob deletes and pub/sub fan-out. It can be
//! switched offline or slowed down to exercise the soft-failure paths.

use super::{DistributedStore, RemoteMessage, SUBSCRIPTION_BUFFER};
use crate::cache::clock;
use crate::cache::key::KeyPattern;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

const BROADCAST_CAPACITY: usize = 1024;

/// Map size below which writes never sweep
const SWEEP_FLOOR: usize = 64;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-memory distributed store
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    /// Map size at which the next write sweeps expired entries
    sweep_at: AtomicUsize,
    bus: broadcast::Sender<RemoteMessage>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            sweep_at: AtomicUsize::new(SWEEP_FLOOR),
            bus,
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "memory store availability changed");
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = clock::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, v)| v.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        self.sweep(&mut entries)
    }

    fn sweep(&self, entries: &mut HashMap<String, StoredValue>) -> usize {
        let now = clock::now();
        let before = entries.len();
        entries.retain(|_, v| v.expires_at > now);
        self.sweep_at
            .store((entries.len() * 2).max(SWEEP_FLOOR), Ordering::Relaxed);
        before - entries.len()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DistributedUnavailable {
                reason: "memory store offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter().await?;
        let now = clock::now();
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(v) if v.expires_at > now => Ok(Some(v.bytes.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.enter().await?;
        let expires_at = clock::now() + ttl;
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        // Map stays within twice the live set
        if entries.len() >= self.sweep_at.load(Ordering::Relaxed) {
            let purged = self.sweep(&mut entries);
            if purged > 0 {
                debug!(purged, remaining = entries.len(), "swept expired entries");
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        let now = clock::now();
        Ok(self
            .entries
            .write()
            .remove(key)
            .is_some_and(|v| v.expires_at > now))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        self.enter().await?;
        let pattern = KeyPattern::new(pattern)?;
        let now = clock::now();
        let mut removed = 0u64;
        self.entries.write().retain(|key, v| {
            if pattern.matches(key) {
                if v.expires_at > now {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.enter().await?;
        // No subscribers is not an error, same as PUBLISH returning 0
        let _ = self.bus.send(RemoteMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&'static str]) -> Result<mpsc::Receiver<RemoteMessage>> {
        self.enter().await?;
        let mut bus = self.bus.subscribe();
        let channels: Vec<&'static str> = channels.to_vec();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(msg) => {
                        if !channels.iter().any(|c| *c == msg.channel) {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "memory store subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}
