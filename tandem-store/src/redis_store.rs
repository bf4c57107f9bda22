//! Redis store backend.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::pubsub::{Message, Subscription};
use crate::store::{Store, StoreConnector};
use crate::{Result, StoreConfig, StoreError};

const DELETE_IF_EQUALS: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

const EXTEND_IF_EQUALS: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

/// Redis-backed store.
///
/// Commands share one multiplexed [`ConnectionManager`]; every subscription
/// gets its own pub/sub connection so blocking reads never stall commands.
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    config: StoreConfig,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let client = Client::open(url).map_err(|e| StoreError::Config(e.to_string()))?;

        let connection = tokio::time::timeout(
            config.connection_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self {
            client,
            connection,
            config,
            closed: AtomicBool::new(false),
        };

        if let Some(name) = store.config.connection_name.clone() {
            let mut conn = store.connection.clone();
            let _: () = store
                .timed(redis::cmd("CLIENT").arg("SETNAME").arg(&name).query_async(&mut conn))
                .await?;
        }

        info!(url = %store.config.redacted_url(), "Redis store connected");

        Ok(store)
    }

    /// Get the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let _: String = self.timed(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.connection.clone())
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

/// Map a redis error, keeping transport failures recognisable.
fn classify(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Redis(err)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        trace!(key = %key, "GET");
        self.timed(redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        trace!(key = %key, "SET");
        self.timed(redis::cmd("SET").arg(key).arg(value).query_async(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let deleted: u32 = self.timed(redis::cmd("DEL").arg(key).query_async(&mut conn)).await?;
        Ok(deleted > 0)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn()?;
        trace!(key = %key, "RPUSH");
        self.timed(redis::cmd("RPUSH").arg(key).arg(value).query_async(&mut conn)).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        trace!(key = %key, "LPOP");
        self.timed(redis::cmd("LPOP").arg(key).query_async(&mut conn)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u32> {
        let mut conn = self.conn()?;
        let receivers: u32 = self
            .timed(redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut conn))
            .await?;
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(receivers)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn()?;
        let reply: Option<String> = self
            .timed(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let script = redis::Script::new(DELETE_IF_EQUALS);
        let removed: i64 = self
            .timed(script.key(key).arg(expected).invoke_async(&mut conn))
            .await?;
        Ok(removed == 1)
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn()?;
        let script = redis::Script::new(EXTEND_IF_EQUALS);
        let extended: i64 = self
            .timed(
                script
                    .key(key)
                    .arg(expected)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(extended == 1)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let channel_name = channel.to_string();

        let mut pubsub = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_async_pubsub(),
        )
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        tokio::time::timeout(self.config.connection_timeout, pubsub.subscribe(&channel_name))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::PubSub(e.to_string()))?;

        info!(channel = %channel_name, "Subscribed to Redis channel");

        let reader_channel = channel_name.clone();
        let reader = tokio::spawn(async move {
            {
                let mut messages = pubsub.on_message();
                loop {
                    let msg = tokio::select! {
                        _ = &mut close_rx => break,
                        msg = messages.next() => msg,
                    };

                    let Some(msg) = msg else {
                        debug!(channel = %reader_channel, "Subscriber connection ended");
                        return Ok(());
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            error!(error = %e, "Failed to get message payload");
                            continue;
                        }
                    };

                    let message = Message {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };

                    trace!(channel = %message.channel, "Received pub/sub message");

                    tokio::select! {
                        biased;
                        sent = tx.send(message) => {
                            if sent.is_err() {
                                debug!(channel = %reader_channel, "Subscription receiver dropped");
                                break;
                            }
                        }
                        _ = &mut close_rx => break,
                    }
                }
            }

            // Dropping the pubsub connection afterwards closes the socket.
            pubsub
                .unsubscribe(&reader_channel)
                .await
                .map_err(|e| StoreError::PubSub(e.to_string()))
        });

        Ok(Subscription::new(channel_name, rx, close_tx, reader))
    }

    async fn quit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The connection manager closes its socket once the last clone drops.
        info!(url = %self.config.redacted_url(), "Redis store closed");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Connector opening [`RedisStore`] connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: StoreConfig,
}

impl RedisConnector {
    /// Create a connector for the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        let store = RedisStore::connect(self.config.clone()).await?;
        Ok(Arc::new(store))
    }
}
