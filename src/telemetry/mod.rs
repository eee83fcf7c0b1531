//! Best-effort mirroring of session events into a shared key-value / pub-sub store.
//!
//! Every name written by this module starts with the instance namespace:
//!
//! - channels: `"{namespace}-{topic}"`, e.g. `"{namespace}-state"`
//! - round keyspace (a hash): `"{namespace}-{replayId}"`
//! - round lists: `"{namespace}-{replayId}-{list}"`
//!
//! Writes are queued to a background writer task and never report failure to the caller: a
//! failed or slow store must not hold gameplay back. Failures are logged with the `telemetry`
//! target. Reads are queued behind the writes issued before them.
//!
//! The queue is bounded. Writes issued while it is full are dropped, and writes still queued at
//! shutdown are discarded as soon as the store fails once.

use std::{
    collections::BTreeMap,
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, warn};

use crate::identity::InstanceToken;

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::{KeyValueStore, RedisStore};

/// Channel topics.
pub mod topic {
    /// Connection, join and round lifecycle events.
    pub const STATE: &str = "state";
    /// Raw per-turn snapshots.
    pub const GAME_UPDATE: &str = "game_update";
}

/// Hash fields of a round keyspace.
pub mod field {
    #![allow(missing_docs)]
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const SIZE: &str = "size";
    pub const OWN_GENERAL: &str = "ownGeneral";
    pub const TURN: &str = "turn";
    pub const CITIES: &str = "cities";
    pub const DISCOVERED_TILES: &str = "discoveredTiles";
    pub const ARMIES: &str = "armies";
    pub const TERRAIN: &str = "terrain";
    pub const ENEMY_GENERAL: &str = "enemyGeneral";
    pub const OWN_TILES: &str = "ownTiles";
    pub const ENEMY_TILES: &str = "enemyTiles";
}

/// Append-only lists of a round keyspace.
pub mod list {
    /// Score lines of every turn.
    pub const SCORES: &str = "scores";
    /// Largest army on an owned tile, every turn.
    pub const MAX_ARMY_ON_TILE: &str = "maxArmyOnTile";
    /// Cumulative move count, every turn.
    pub const MOVE_COUNT: &str = "moveCount";
}

/// Namespace of an instance: the token, optionally behind a label.
pub fn namespace(token: &InstanceToken, label: Option<&str>) -> String {
    match label {
        Some(label) if !label.is_empty() => format!("{label}-{token}"),
        _ => token.to_string(),
    }
}

/// Name of the per-round keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace(String);

impl Keyspace {
    /// Key of the round hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of one of the round lists.
    pub fn list_key(&self, list: &str) -> String {
        format!("{}-{list}", self.0)
    }
}

impl Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit marker returned in place of a field value that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// The field does not exist.
    #[error("field is missing")]
    Missing,
    /// The stored text is not valid JSON.
    #[error("field is malformed: {0}")]
    Malformed(String),
}

/// Fields written together by [`Telemetry::set_fields`], each serialized on its own.
#[derive(Debug, Clone, Default)]
pub struct FieldBatch {
    fields: Vec<(String, String)>,
}

impl FieldBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. A value that cannot be serialized is logged and left out of the batch.
    pub fn with<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => self.fields.push((name.to_string(), json)),
            Err(e) => error!(target: "telemetry", field = name, "could not serialize field: {e}"),
        }
        self
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if no field was added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

type Reply<T> = oneshot::Sender<anyhow::Result<T>>;

enum Request {
    Publish {
        channel: String,
        message: String,
    },
    SetFields {
        key: String,
        fields: Vec<(String, String)>,
    },
    Push {
        key: String,
        value: String,
    },
    Expire {
        key: String,
    },
    GetFields {
        key: String,
        fields: Vec<String>,
        reply: Reply<Vec<Option<String>>>,
    },
    GetAllFields {
        key: String,
        reply: Reply<Vec<(String, String)>>,
    },
    Subscribe {
        channel: String,
        reply: Reply<mpsc::UnboundedReceiver<String>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Requests the writer queue holds before new writes are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Telemetry client.
///
/// Owns the store through its writer task; nothing else holds a reference to the store.
pub struct Telemetry {
    namespace: String,
    tx: mpsc::Sender<Request>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Telemetry {
    /// Spawn the writer task owning `store`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<S: KeyValueStore>(
        store: S,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Telemetry {
        Self::start_with_capacity(store, namespace, ttl, DEFAULT_QUEUE_CAPACITY)
    }

    /// Same as [`Telemetry::start`] with a queue of `capacity` requests.
    pub fn start_with_capacity<S: KeyValueStore>(
        store: S,
        namespace: impl Into<String>,
        ttl: Duration,
        capacity: usize,
    ) -> Telemetry {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, stopped) = oneshot::channel();
        let writer = tokio::spawn(run_writer(store, rx, stopped, ttl));
        Telemetry {
            namespace: namespace.into(),
            tx,
            stop: Mutex::new(Some(stop)),
            writer: Mutex::new(Some(writer)),
            subscriptions: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Namespace prefix of every name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full channel name of `topic`.
    pub fn channel_name(&self, topic: &str) -> String {
        format!("{}-{topic}", self.namespace)
    }

    /// Keyspace of the round `replay_id`.
    pub fn keyspace(&self, replay_id: &str) -> Keyspace {
        Keyspace(format!("{}-{replay_id}", self.namespace))
    }

    /// Writes dropped because the queue was full.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn write(&self, request: Request) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(target: "telemetry", dropped, "telemetry queue full, dropping writes");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "telemetry", "telemetry is shut down, request dropped");
            }
        }
    }

    async fn send(&self, request: Request) -> bool {
        if self.tx.send(request).await.is_err() {
            debug!(target: "telemetry", "telemetry is shut down, request dropped");
            return false;
        }
        true
    }

    /// Publish `payload` as JSON on `topic`.
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        let channel = self.channel_name(topic);
        match serde_json::to_string(payload) {
            Ok(message) => {
                self.write(Request::Publish { channel, message });
            }
            Err(e) => error!(target: "telemetry", %channel, "could not serialize message: {e}"),
        }
    }

    /// Write `fields` into the round hash and re-arm its expiration.
    pub fn set_fields(&self, keyspace: &Keyspace, fields: FieldBatch) {
        if fields.is_empty() {
            return;
        }
        self.write(Request::SetFields {
            key: keyspace.0.clone(),
            fields: fields.fields,
        });
    }

    /// Re-arm the expiration of the round hash.
    pub fn arm_expiration(&self, keyspace: &Keyspace) {
        self.write(Request::Expire {
            key: keyspace.0.clone(),
        });
    }

    /// Append `value` to a round list and re-arm the expiration of that list.
    pub fn append_to_list<T: Serialize + ?Sized>(
        &self,
        keyspace: &Keyspace,
        list: &str,
        value: &T,
    ) {
        let key = keyspace.list_key(list);
        match serde_json::to_string(value) {
            Ok(value) => {
                self.write(Request::Push { key, value });
            }
            Err(e) => error!(target: "telemetry", %key, "could not serialize list entry: {e}"),
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> anyhow::Result<T> {
        let (reply, answer) = oneshot::channel();
        if !self.send(build(reply)).await {
            return Err(anyhow!("telemetry is shut down"));
        }
        answer.await.context("telemetry writer stopped")?
    }

    /// Read some fields of the round hash.
    ///
    /// Each field is decoded on its own; one that cannot be decoded is returned as a
    /// [`FieldError`] next to the others.
    ///
    /// # Errors
    /// Returned when the store cannot be read at all.
    pub async fn get_fields(
        &self,
        keyspace: &Keyspace,
        names: &[&str],
    ) -> anyhow::Result<Vec<(String, Result<Value, FieldError>)>> {
        let fields = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let key = keyspace.0.clone();
        let values = self
            .request(|reply| Request::GetFields {
                key,
                fields: fields.clone(),
                reply,
            })
            .await?;
        Ok(fields
            .into_iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(name, raw)| {
                let value = decode_field(&name, raw);
                (name, value)
            })
            .collect())
    }

    /// Read every field of the round hash. See [`Telemetry::get_fields`].
    ///
    /// # Errors
    /// Returned when the store cannot be read at all.
    pub async fn get_all_fields(
        &self,
        keyspace: &Keyspace,
    ) -> anyhow::Result<BTreeMap<String, Result<Value, FieldError>>> {
        let key = keyspace.0.clone();
        let values = self
            .request(|reply| Request::GetAllFields { key, reply })
            .await?;
        Ok(values
            .into_iter()
            .map(|(name, raw)| {
                let value = decode_field(&name, Some(raw));
                (name, value)
            })
            .collect())
    }

    /// Call `handler` for every message published on `topic`.
    ///
    /// Messages that do not decode as `T` are logged and dropped.
    ///
    /// # Errors
    /// Returned when the subscription cannot be opened.
    pub async fn subscribe<T, H, Fut>(&self, topic: &str, mut handler: H) -> anyhow::Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let channel = self.channel_name(topic);
        let subscribed = channel.clone();
        let mut messages = self
            .request(|reply| Request::Subscribe {
                channel: subscribed,
                reply,
            })
            .await?;
        let task = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match serde_json::from_str::<T>(&message) {
                    Ok(value) => handler(value).await,
                    Err(e) => warn!(
                        target: "telemetry",
                        %channel,
                        %message,
                        "dropping malformed message: {e}"
                    ),
                }
            }
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.abort_handle());
        Ok(())
    }

    /// Wait until every request issued before this call reached the store.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Request::Flush(done)).await {
            let _ = wait.await;
        }
    }

    /// Drain pending writes, then release the store connections.
    ///
    /// Pending writes are discarded once one of them fails. Idempotent: later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for subscription in subscriptions {
            subscription.abort();
        }
        let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(target: "telemetry", "telemetry writer failed: {e}");
            }
        }
        debug!(target: "telemetry", "telemetry shut down");
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        // no executor to await in drop
        for subscription in self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            subscription.abort();
        }
    }
}

fn decode_field(name: &str, raw: Option<String>) -> Result<Value, FieldError> {
    let raw = raw.ok_or(FieldError::Missing)?;
    serde_json::from_str(&raw).map_err(|e| {
        warn!(target: "telemetry", field = name, "malformed field: {e}");
        FieldError::Malformed(e.to_string())
    })
}

async fn run_writer<S: KeyValueStore>(
    store: S,
    mut rx: mpsc::Receiver<Request>,
    mut stopped: oneshot::Receiver<()>,
    ttl: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => break,
            request = rx.recv() => match request {
                Some(request) => {
                    handle_request(&store, request, ttl).await;
                }
                None => break,
            },
        }
    }

    rx.close();
    let mut store_failed = false;
    let mut discarded = 0usize;
    while let Ok(request) = rx.try_recv() {
        if store_failed {
            discarded += 1;
            continue;
        }
        store_failed = !handle_request(&store, request, ttl).await;
    }
    if discarded > 0 {
        warn!(target: "telemetry", discarded, "store unavailable, pending writes discarded");
    }
    store.quit().await;
    debug!(target: "telemetry", "telemetry writer stopped");
}

/// Returns `false` when a write failed.
async fn handle_request<S: KeyValueStore>(store: &S, request: Request, ttl: Duration) -> bool {
    match request {
        Request::Publish { channel, message } => {
            if let Err(e) = store.publish(&channel, &message).await {
                error!(target: "telemetry", %channel, "publish failed: {e:#}");
                return false;
            }
        }
        Request::SetFields { key, fields } => {
            if let Err(e) = store.set_fields(&key, &fields).await {
                error!(target: "telemetry", %key, "writing fields failed: {e:#}");
                return false;
            }
            return expire(store, &key, ttl).await;
        }
        Request::Push { key, value } => {
            if let Err(e) = store.push(&key, &value).await {
                error!(target: "telemetry", %key, "list append failed: {e:#}");
                return false;
            }
            return expire(store, &key, ttl).await;
        }
        Request::Expire { key } => return expire(store, &key, ttl).await,
        Request::GetFields { key, fields, reply } => {
            let _ = reply.send(store.get_fields(&key, &fields).await);
        }
        Request::GetAllFields { key, reply } => {
            let _ = reply.send(store.get_all_fields(&key).await);
        }
        Request::Subscribe { channel, reply } => {
            let _ = reply.send(store.subscribe(&channel).await);
        }
        Request::Flush(done) => {
            let _ = done.send(());
        }
    }
    true
}

async fn expire<S: KeyValueStore>(store: &S, key: &str, ttl: Duration) -> bool {
    if let Err(e) = store.expire(key, ttl).await {
        error!(target: "telemetry", %key, "setting expiration failed: {e:#}");
        return false;
    }
    true
}
