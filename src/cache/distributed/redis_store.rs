//! Redis-backed store.
//!
//! Commands run over a `deadpool-redis` connection pool. Subscriptions use a
//! dedicated pub/sub connection (pooled connections cannot SUBSCRIBE) owned
//! by a listener task that reconnects with exponential backoff.

use super::{DistributedStore, RemoteMessage, SUBSCRIPTION_BUFFER};
use crate::config::DistributedConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use deadpool_redis::{Pool, PoolConfig, Runtime};
use futures::StreamExt;
use redis::aio::PubSub;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Keys requested per SCAN round-trip
const SCAN_COUNT: usize = 100;

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(300);

/// Store backed by a Redis server
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
}

impl RedisStore {
    /// Build the pool and pub/sub client. Connections are opened lazily.
    pub async fn connect(config: &DistributedConfig) -> Result<Self> {
        info!(url = %config.url, pool_size = config.pool_size, "connecting to redis");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connect_timeout());
        pool_config.timeouts.create = Some(config.connect_timeout());
        pool_config.timeouts.recycle = Some(config.connect_timeout());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::RedisPool(e.to_string()))?;
        let client = redis::Client::open(config.url.as_str())?;

        Ok(Self { pool, client })
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(RECONNECT_INITIAL)
        .with_max_interval(RECONNECT_MAX)
        .with_max_elapsed_time(None)
        .build()
}

async fn open_pubsub(client: &redis::Client, channels: &[&'static str]) -> Result<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(*channel).await?;
    }
    info!(channels = ?channels, "subscribed to invalidation channels");
    Ok(pubsub)
}

/// Forward messages until the connection drops (error) or the receiver is
/// gone (Ok)
async fn forward(mut pubsub: PubSub, tx: &mpsc::Sender<RemoteMessage>) -> Result<()> {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "unreadable pub/sub payload");
                continue;
            }
        };
        debug!(channel = %channel, "received pub/sub message");
        if tx.send(RemoteMessage { channel, payload }).await.is_err() {
            return Ok(());
        }
    }
    Err(Error::SubscriptionClosed("pub/sub stream ended".to_string()))
}

#[async_trait]
impl DistributedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&'static str]) -> Result<mpsc::Receiver<RemoteMessage>> {
        let channels: Vec<&'static str> = channels.to_vec();
        let first = open_pubsub(&self.client, &channels).await?;
        let client = self.client.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            let mut backoff = reconnect_backoff();
            let mut pending = Some(first);

            loop {
                let result = match pending.take() {
                    Some(pubsub) => forward(pubsub, &tx).await,
                    None => match open_pubsub(&client, &channels).await {
                        Ok(pubsub) => {
                            backoff.reset();
                            forward(pubsub, &tx).await
                        }
                        Err(e) => Err(e),
                    },
                };

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        if tx.is_closed() {
                            break;
                        }
                        let delay = backoff.next_backoff().unwrap_or(RECONNECT_MAX);
                        error!(
                            error = %e,
                            transient = e.is_transient(),
                            backoff_secs = delay.as_secs(),
                            "pub/sub listener error, reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            debug!("pub/sub listener stopped");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
