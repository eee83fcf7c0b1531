use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use futures_util::StreamExt;
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    AsyncCommands,
};
use tokio::{sync::mpsc, sync::OnceCell, task::AbortHandle};
use tracing::{debug, instrument, warn};

use crate::configuration::StoreConfiguration;

/// Operations the telemetry layer needs from a key-value / pub-sub store.
///
/// Values are already serialized when they reach the store.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Publish `message` on `channel`.
    fn publish(&self, channel: &str, message: &str)
        -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Write several hash fields of `key`.
    fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Read hash fields of `key`, `None` for absent fields.
    fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> impl Future<Output = anyhow::Result<Vec<Option<String>>>> + Send;

    /// Read every hash field of `key`.
    fn get_all_fields(
        &self,
        key: &str,
    ) -> impl Future<Output = anyhow::Result<Vec<(String, String)>>> + Send;

    /// Append `value` to the list `key`.
    fn push(&self, key: &str, value: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Set the time to live of `key` to `ttl` from now.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Receive every message published on `channel` from now on.
    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = anyhow::Result<mpsc::UnboundedReceiver<String>>> + Send;

    /// Release the connections. Called once, when telemetry shuts down.
    fn quit(&self) -> impl Future<Output = ()> + Send;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// No new connection attempt before this long after a failed one.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// Redis backed store.
///
/// Commands go through a lazily opened [`ConnectionManager`], which reconnects on its own;
/// each subscription owns a dedicated pub/sub connection. An unreachable server fails commands
/// within [`CONNECT_TIMEOUT`], and fails them at once during the following cooldown.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    last_failure: Mutex<Option<Instant>>,
    subscriptions: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl RedisStore {
    /// Prepare a store for `config`. No connection is made yet.
    ///
    /// # Errors
    /// Returned when the connection url is invalid.
    pub fn open(config: &StoreConfiguration) -> anyhow::Result<RedisStore> {
        let client =
            redis::Client::open(config.connection_url()).context("invalid store connection url")?;
        Ok(RedisStore {
            client,
            connection: OnceCell::new(),
            last_failure: Mutex::new(None),
            subscriptions: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        })
    }

    async fn connection(&self) -> anyhow::Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("store connection released");
        }
        if let Some(connection) = self.connection.get() {
            return Ok(connection.clone());
        }
        let last_failure = *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner);
        if last_failure.is_some_and(|at| at.elapsed() < RECONNECT_COOLDOWN) {
            anyhow::bail!("store unreachable, waiting before the next attempt");
        }

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT)
            .set_number_of_retries(1);
        let connected = self
            .connection
            .get_or_try_init(|| async {
                tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    self.client.get_connection_manager_with_config(config),
                )
                .await
                .context("timed out connecting to store")?
                .context("could not connect to store")
            })
            .await;
        match connected {
            Ok(connection) => Ok(connection.clone()),
            Err(e) => {
                *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Instant::now());
                Err(e)
            }
        }
    }
}

impl KeyValueStore for RedisStore {
    async fn publish(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        let mut connection = self.connection().await?;
        let _: () = connection.publish(channel, message).await?;
        Ok(())
    }

    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection().await?;
        let _: () = connection.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> anyhow::Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(vec![]);
        }
        let mut connection = self.connection().await?;
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut connection)
            .await?;
        Ok(values)
    }

    async fn get_all_fields(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut connection = self.connection().await?;
        let values: HashMap<String, String> = connection.hgetall(key).await?;
        Ok(values.into_iter().collect())
    }

    async fn push(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut connection = self.connection().await?;
        let _: () = connection.rpush(key, value).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut connection = self.connection().await?;
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _: () = connection.expire(key, seconds).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> anyhow::Result<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("could not open subscribe connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("could not subscribe to {channel}"))?;
        debug!("subscribed");

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(target: "telemetry", %channel, "unreadable message: {e}"),
                }
            }
            debug!(%channel, "subscription ended");
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.abort_handle());
        Ok(rx)
    }

    async fn quit(&self) {
        self.closed.store(true, Ordering::Release);
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for subscription in subscriptions {
            subscription.abort();
        }
        debug!("store connections released");
    }
}
