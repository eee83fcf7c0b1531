use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::bail;
use tokio::{sync::mpsc, time::Instant};

use super::store::KeyValueStore;

/// Published messages kept for inspection, across all channels.
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 1024;

/// In-process store with expiration, used for dry runs and tests.
///
/// Clones share the same data, so a test can keep a handle on the store given to the
/// telemetry layer and inspect what was written.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    expirations: HashMap<String, Instant>,
    published: VecDeque<(String, String)>,
    publish_log_capacity: usize,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    failing: bool,
    latency: Option<Duration>,
    failed_calls: u32,
    hang_on_quit: bool,
    quit_calls: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            hashes: HashMap::new(),
            lists: HashMap::new(),
            expirations: HashMap::new(),
            published: VecDeque::new(),
            publish_log_capacity: DEFAULT_PUBLISH_LOG_CAPACITY,
            subscribers: HashMap::new(),
            failing: false,
            latency: None,
            failed_calls: 0,
            hang_on_quit: false,
            quit_calls: 0,
        }
    }
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired = self
            .expirations
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in expired {
            self.expirations.remove(&key);
            self.hashes.remove(&key);
            self.lists.remove(&key);
        }
    }

    fn check_available(&mut self) -> anyhow::Result<()> {
        if self.failing {
            self.failed_calls += 1;
            bail!("store unavailable");
        }
        self.purge_expired();
        Ok(())
    }
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the last `capacity` published messages.
    pub fn with_publish_log_capacity(self, capacity: usize) -> Self {
        {
            let mut inner = self.lock();
            inner.publish_log_capacity = capacity;
            let excess = inner.published.len().saturating_sub(capacity);
            inner.published.drain(..excess);
        }
        self
    }

    /// Delay every operation but `quit` by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Make `quit` never complete.
    pub fn with_hanging_quit(self) -> Self {
        self.lock().hang_on_quit = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn reach(&self) -> MutexGuard<'_, Inner> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.lock()
    }

    /// Make every operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Operations rejected while failing.
    pub fn failed_calls(&self) -> u32 {
        self.lock().failed_calls
    }

    /// Messages published on `channel`, oldest first, among the last ones kept.
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Current content of the hash `key`.
    pub fn hash(&self, key: &str) -> BTreeMap<String, String> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.hashes.get(key).cloned().unwrap_or_default()
    }

    /// Current content of the list `key`.
    pub fn list(&self, key: &str) -> Vec<String> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.lists.get(key).cloned().unwrap_or_default()
    }

    /// Remaining time to live of `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner
            .expirations
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Write a raw hash field, bypassing serialization.
    pub fn insert_raw_field(&self, key: &str, field: &str, raw: &str) {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), raw.to_string());
    }

    /// Number of `quit` calls.
    pub fn quit_calls(&self) -> u32 {
        self.lock().quit_calls
    }
}

impl KeyValueStore for MemoryStore {
    async fn publish(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        if inner.published.len() >= inner.publish_log_capacity {
            inner.published.pop_front();
        }
        if inner.publish_log_capacity > 0 {
            inner
                .published
                .push_back((channel.to_string(), message.to_string()));
        }
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> anyhow::Result<Vec<Option<String>>> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        let hash = inner.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn get_all_fields(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn push(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        // like redis, only existing keys get an expiration
        if inner.hashes.contains_key(key) || inner.lists.contains_key(key) {
            inner.expirations.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<mpsc::UnboundedReceiver<String>> {
        let mut inner = self.reach().await;
        inner.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn quit(&self) {
        let hang = {
            let mut inner = self.lock();
            inner.quit_calls += 1;
            inner.subscribers.clear();
            inner.hang_on_quit
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }
}
