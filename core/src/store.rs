//! Event store: bounded in-memory log with JSON snapshots on disk.
//!
//! Every flush writes the whole buffer to `events_<YYYYMMDD_HHMMSS>.json` in
//! the storage directory. On startup only the most recent snapshot is loaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::event::{Event, EventType};
use crate::event_bus::EventHandler;
use crate::{ConduitError, Result};

const SNAPSHOT_PREFIX: &str = "events_";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Event store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStoreConfig {
    /// When false the store is memory-only: nothing is loaded or flushed
    pub enabled: bool,

    pub storage_dir: PathBuf,

    /// Buffer bound; the oldest events are trimmed past it
    pub max_events: usize,

    /// Auto-flush period; `None` flushes only on demand and at shutdown
    pub flush_interval: Option<Duration>,

    /// Snapshot files kept after a flush (0 keeps all)
    pub retain_snapshots: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_dir: PathBuf::from("./data/events"),
            max_events: 10_000,
            flush_interval: Some(Duration::from_secs(30)),
            retain_snapshots: 5,
        }
    }
}

impl EventStoreConfig {
    /// Memory-only store
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_retain_snapshots(mut self, retain: usize) -> Self {
        self.retain_snapshots = retain;
        self
    }
}

/// An event as kept by the store.
///
/// `sequence` is dense from 1 over the current buffer and is renumbered when
/// old events are trimmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub stored_at: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub count: usize,
    pub max_events: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub last_flush: Option<DateTime<Utc>>,
    /// `None` for a memory-only store
    pub snapshot_dir: Option<PathBuf>,
}

struct StoreInner {
    config: EventStoreConfig,
    events: RwLock<Vec<StoredEvent>>,
    last_flush: Mutex<Option<DateTime<Utc>>>,
}

/// Bounded event log with snapshot persistence
pub struct EventStore {
    inner: Arc<StoreInner>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl EventStore {
    /// Open a store, loading the latest snapshot and starting auto-flush when enabled
    pub async fn new(config: EventStoreConfig) -> Result<Self> {
        let mut events = Vec::new();
        if config.enabled {
            tokio::fs::create_dir_all(&config.storage_dir).await?;
            events = load_latest(&config.storage_dir).await?;
            trim(&mut events, config.max_events);
            info!(
                target: "event_store",
                dir = %config.storage_dir.display(),
                loaded = events.len(),
                "Event store opened"
            );
        } else {
            debug!(target: "event_store", "Event store running memory-only");
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                events: RwLock::new(events),
                last_flush: Mutex::new(None),
            }),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        store.spawn_auto_flush();
        Ok(store)
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.inner.config
    }

    /// Append an event, trimming the oldest past `max_events`
    pub async fn store(&self, event: Event) {
        let mut events = self.inner.events.write().await;
        let sequence = events.len() as u64 + 1;
        events.push(StoredEvent {
            event,
            stored_at: Utc::now(),
            sequence,
        });
        if events.len() > self.inner.config.max_events {
            let dropped = events.len() - self.inner.config.max_events;
            trim(&mut events, self.inner.config.max_events);
            debug!(target: "event_store", dropped, "Trimmed oldest events");
        }
    }

    pub async fn get(&self, event_id: &str) -> Option<StoredEvent> {
        self.inner
            .events
            .read()
            .await
            .iter()
            .find(|s| s.event.id == event_id)
            .cloned()
    }

    pub async fn get_by_type(&self, event_type: EventType) -> Vec<StoredEvent> {
        self.inner
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Events whose timestamp falls in `[start, end]`
    pub async fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<StoredEvent> {
        self.inner
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.event.timestamp >= start && s.event.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Up to `n` most recent events, oldest first
    pub async fn get_recent(&self, n: usize) -> Vec<StoredEvent> {
        let events = self.inner.events.read().await;
        let skip = events.len().saturating_sub(n);
        events[skip..].to_vec()
    }

    pub async fn count(&self) -> usize {
        self.inner.events.read().await.len()
    }

    pub async fn clear(&self) -> usize {
        let mut events = self.inner.events.write().await;
        let n = events.len();
        events.clear();
        n
    }

    /// Feed every stored event to `handler` in stored order.
    ///
    /// Stops at the first handler error, or with [`ConduitError::Cancelled`]
    /// when `cancel` fires between events. Returns the number replayed.
    pub async fn replay(
        &self,
        cancel: &CancellationToken,
        handler: &dyn EventHandler,
    ) -> Result<usize> {
        let snapshot = self.inner.events.read().await.clone();
        replay_events(snapshot, cancel, handler).await
    }

    /// Like [`replay`](Self::replay), limited to events timestamped at or after `since`
    pub async fn replay_since(
        &self,
        cancel: &CancellationToken,
        since: DateTime<Utc>,
        handler: &dyn EventHandler,
    ) -> Result<usize> {
        let snapshot: Vec<StoredEvent> = self
            .inner
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.event.timestamp >= since)
            .cloned()
            .collect();
        replay_events(snapshot, cancel, handler).await
    }

    /// Write the buffer to a new snapshot file; `None` for a memory-only store
    pub async fn flush(&self) -> Result<Option<PathBuf>> {
        self.inner.flush().await
    }

    pub async fn stats(&self) -> StoreStats {
        let (count, oldest, newest) = {
            let events = self.inner.events.read().await;
            (
                events.len(),
                events.first().map(|s| s.event.timestamp),
                events.last().map(|s| s.event.timestamp),
            )
        };
        StoreStats {
            count,
            max_events: self.inner.config.max_events,
            oldest,
            newest,
            last_flush: *self.inner.last_flush.lock().await,
            snapshot_dir: self
                .inner
                .config
                .enabled
                .then(|| self.inner.config.storage_dir.clone()),
        }
    }

    /// Stop auto-flush and write a final snapshot
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.stop.cancel();
        self.tracker.close();

        let inner = Arc::clone(&self.inner);
        let tracker = self.tracker.clone();
        let drain = async move {
            tracker.wait().await;
            inner.flush().await
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(res) => {
                res?;
                info!(target: "event_store", "Event store stopped");
                Ok(())
            }
            Err(_) => Err(ConduitError::ShutdownTimeout {
                component: "event_store",
                timeout,
            }),
        }
    }

    fn spawn_auto_flush(&self) {
        let Some(period) = self.inner.config.flush_interval else {
            return;
        };
        if !self.inner.config.enabled || period.is_zero() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.flush().await {
                            warn!(target: "event_store", error = %e, "Auto-flush failed");
                        }
                    }
                }
            }
        });
    }
}

impl StoreInner {
    #[tracing::instrument(skip(self), fields(dir = %self.config.storage_dir.display()))]
    async fn flush(&self) -> Result<Option<PathBuf>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let snapshot = self.events.read().await.clone();
        let now = Utc::now();
        let path = self.config.storage_dir.join(snapshot_name(now));
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::create_dir_all(&self.config.storage_dir).await?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        *self.last_flush.lock().await = Some(now);

        debug!(target: "event_store", path = %path.display(), events = snapshot.len(), "Snapshot written");
        if self.config.retain_snapshots > 0 {
            prune_snapshots(&self.config.storage_dir, self.config.retain_snapshots).await?;
        }
        Ok(Some(path))
    }
}

async fn replay_events(
    events: Vec<StoredEvent>,
    cancel: &CancellationToken,
    handler: &dyn EventHandler,
) -> Result<usize> {
    let mut replayed = 0;
    for stored in events {
        if cancel.is_cancelled() {
            debug!(target: "event_store", replayed, "Replay cancelled");
            return Err(ConduitError::Cancelled);
        }
        handler.handle(Arc::new(stored.event)).await?;
        replayed += 1;
    }
    Ok(replayed)
}

fn trim(events: &mut Vec<StoredEvent>, max_events: usize) {
    if events.len() > max_events {
        let excess = events.len() - max_events;
        events.drain(..excess);
    }
    for (i, stored) in events.iter_mut().enumerate() {
        stored.sequence = i as u64 + 1;
    }
}

fn snapshot_name(at: DateTime<Utc>) -> String {
    format!(
        "{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}",
        at.format("%Y%m%d_%H%M%S")
    )
}

fn is_snapshot(name: &str) -> bool {
    name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_SUFFIX)
}

/// Snapshot files in `dir`, oldest first
async fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_str().is_some_and(is_snapshot) {
            files.push(entry.path());
        }
    }
    // The timestamp format sorts lexicographically
    files.sort();
    Ok(files)
}

async fn load_latest(dir: &Path) -> Result<Vec<StoredEvent>> {
    let Some(latest) = list_snapshots(dir).await?.pop() else {
        return Ok(Vec::new());
    };
    let bytes = tokio::fs::read(&latest).await?;
    match serde_json::from_slice::<Vec<StoredEvent>>(&bytes) {
        Ok(events) => {
            debug!(target: "event_store", path = %latest.display(), events = events.len(), "Snapshot loaded");
            Ok(events)
        }
        Err(e) => {
            warn!(target: "event_store", path = %latest.display(), error = %e, "Unreadable snapshot, starting empty");
            Ok(Vec::new())
        }
    }
}

async fn prune_snapshots(dir: &Path, retain: usize) -> Result<()> {
    let files = list_snapshots(dir).await?;
    if files.len() <= retain {
        return Ok(());
    }
    let excess = files.len() - retain;
    for old in &files[..excess] {
        match tokio::fs::remove_file(old).await {
            Ok(()) => debug!(target: "event_store", path = %old.display(), "Old snapshot removed"),
            Err(e) => {
                warn!(target: "event_store", path = %old.display(), error = %e, "Failed to remove old snapshot")
            }
        }
    }
    Ok(())
}
