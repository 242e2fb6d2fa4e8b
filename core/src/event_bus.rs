// Event bus implementation
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::event::{Event, TOPIC_ALL};
use crate::middleware::Middleware;
use crate::{ConduitError, Result};

/// Event handler trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Predicate deciding whether a subscriber sees an event
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Subscription registered against a topic.
///
/// Higher `priority` runs first. Synchronous subscribers run inline in the
/// publisher's call, asynchronous ones on a tracked background task.
#[derive(Clone)]
pub struct Subscriber {
    pub id: String,
    pub handler: Arc<dyn EventHandler>,
    pub filter: Option<EventFilter>,
    pub priority: i32,
    pub is_async: bool,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            id: id.into(),
            handler,
            filter: None,
            priority: 0,
            is_async: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Deliver on a background task instead of inline
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("is_async", &self.is_async)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusMetrics {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub subscribers: usize,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Default)]
struct BusStats {
    published: u64,
    delivered: u64,
    failed: u64,
    expired: u64,
    total_latency: Duration,
    samples: u64,
}

impl BusStats {
    fn record(&mut self, ok: bool, latency: Duration) {
        if ok {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
        self.total_latency += latency;
        self.samples += 1;
    }
}

/// Topic-routed publish/subscribe bus.
///
/// The subscriber map is only locked long enough to copy a topic's subscriber
/// list; handlers always run against that snapshot, so a handler may itself
/// subscribe, unsubscribe or publish without deadlocking.
pub struct EventBus {
    // Topic -> subscribers, kept sorted by descending priority
    subscriptions: DashMap<String, Vec<Arc<Subscriber>>>,

    // Applied to every delivery, first registered = outermost
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,

    // Statistics
    stats: Arc<Mutex<BusStats>>,

    // Outstanding asynchronous deliveries
    tracker: TaskTracker,

    stopping: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            middlewares: RwLock::new(Vec::new()),
            stats: Arc::new(Mutex::new(BusStats::default())),
            tracker: TaskTracker::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Subscribe to topic
    pub async fn subscribe(&self, topic: &str, subscriber: Subscriber) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ConduitError::BusShutdown);
        }
        if topic.is_empty() {
            return Err(ConduitError::InvalidArgument("topic is empty".into()));
        }
        if subscriber.id.is_empty() {
            return Err(ConduitError::InvalidArgument(
                "subscriber id is empty".into(),
            ));
        }

        let id = subscriber.id.clone();
        let priority = subscriber.priority;
        {
            let mut subs = self.subscriptions.entry(topic.to_string()).or_default();
            if subs.iter().any(|s| s.id == id) {
                return Err(ConduitError::DuplicateSubscriber {
                    topic: topic.to_string(),
                    id,
                });
            }
            subs.push(Arc::new(subscriber));
            // Stable: equal priorities keep registration order
            subs.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        info!(target: "event_bus", topic = %topic, subscriber = %id, priority, "Subscribed");
        Ok(())
    }

    /// Unsubscribe from topic
    pub async fn unsubscribe(&self, topic: &str, id: &str) -> Result<()> {
        {
            let mut subs = self
                .subscriptions
                .get_mut(topic)
                .ok_or_else(|| ConduitError::TopicNotFound(topic.to_string()))?;
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() == before {
                return Err(ConduitError::SubscriberNotFound {
                    topic: topic.to_string(),
                    id: id.to_string(),
                });
            }
        }
        self.subscriptions.remove_if(topic, |_, subs| subs.is_empty());

        info!(target: "event_bus", topic = %topic, subscriber = %id, "Unsubscribed");
        Ok(())
    }

    /// Append a middleware applied to every subsequent delivery
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(target: "event_bus", middleware = middleware.name(), "Middleware registered");
        self.middlewares.write().await.push(middleware);
    }

    /// Publish event to topic.
    ///
    /// Every subscriber of `topic` (and of [`TOPIC_ALL`]) whose filter accepts the
    /// event is invoked once. A failing subscriber does not stop delivery to the
    /// rest; if any synchronous subscriber fails, a [`ConduitError::Delivery`]
    /// carrying the first error is returned after all deliveries were attempted.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn publish(&self, topic: &str, mut event: Event) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ConduitError::BusShutdown);
        }
        if topic.is_empty() {
            return Err(ConduitError::InvalidArgument("topic is empty".into()));
        }
        if event.topic.is_empty() {
            event.topic = topic.to_string();
        }
        if event.timestamp == DateTime::<Utc>::default() {
            event.timestamp = Utc::now();
        }

        {
            let mut stats = self.stats.lock().await;
            stats.published += 1;
            if event.is_expired() {
                stats.expired += 1;
                debug!(target: "event_bus", topic = %topic, "Dropping expired event");
                return Ok(());
            }
        }

        let subscribers = self.snapshot(topic);
        if subscribers.is_empty() {
            debug!(target: "event_bus", topic = %topic, "No subscribers for topic");
            return Ok(());
        }
        let middlewares = self.middlewares.read().await.clone();
        let event = Arc::new(event);

        let mut errors = Vec::new();
        let mut attempted = 0;
        for sub in subscribers {
            if !sub.accepts(&event) {
                continue;
            }
            attempted += 1;
            let handler = Self::chain(&middlewares, &sub);

            if sub.is_async {
                let event = Arc::clone(&event);
                let stats = Arc::clone(&self.stats);
                let sub_id = sub.id.clone();
                self.tracker.spawn(async move {
                    let started = Instant::now();
                    let res = handler.handle(event).await;
                    stats.lock().await.record(res.is_ok(), started.elapsed());
                    if let Err(err) = res {
                        warn!(target: "event_bus", subscriber = %sub_id, error = %err, "Async subscriber failed");
                    }
                });
            } else {
                let started = Instant::now();
                let res = handler.handle(Arc::clone(&event)).await;
                self.stats
                    .lock()
                    .await
                    .record(res.is_ok(), started.elapsed());
                if let Err(err) = res {
                    warn!(target: "event_bus", subscriber = %sub.id, error = %err, "Subscriber failed");
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let failed = errors.len();
            let first = errors.swap_remove(0);
            Err(ConduitError::Delivery {
                failed,
                attempted,
                first: Box::new(first),
            })
        }
    }

    /// Subscriber IDs of a topic in dispatch order
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.value().len()).sum()
    }

    /// Remove every subscription
    pub fn clear(&self) {
        self.subscriptions.clear();
        info!(target: "event_bus", "All subscriptions cleared");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Get stats
    pub async fn metrics(&self) -> BusMetrics {
        let stats = self.stats.lock().await;
        let avg_latency_ms = if stats.samples == 0 {
            0.0
        } else {
            stats.total_latency.as_secs_f64() * 1000.0 / stats.samples as f64
        };
        BusMetrics {
            published: stats.published,
            delivered: stats.delivered,
            failed: stats.failed,
            expired: stats.expired,
            subscribers: self.subscriber_count(),
            avg_latency_ms,
        }
    }

    /// Stop accepting work and wait for in-flight asynchronous deliveries
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(target: "event_bus", "Event bus shutting down");
        self.stopping.store(true, Ordering::Release);
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!(target: "event_bus", "Event bus stopped");
                Ok(())
            }
            Err(_) => {
                warn!(target: "event_bus", pending = self.tracker.len(), "Async subscribers still running at shutdown deadline");
                Err(ConduitError::ShutdownTimeout {
                    component: "event_bus",
                    timeout,
                })
            }
        }
    }

    // Copy the topic's and the wildcard's subscribers, merged by priority
    fn snapshot(&self, topic: &str) -> Vec<Arc<Subscriber>> {
        let mut subs: Vec<Arc<Subscriber>> = self
            .subscriptions
            .get(topic)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        if topic != TOPIC_ALL {
            if let Some(all) = self.subscriptions.get(TOPIC_ALL) {
                subs.extend(all.value().iter().cloned());
            }
        }
        subs.sort_by(|a, b| b.priority.cmp(&a.priority));
        subs
    }

    fn chain(middlewares: &[Arc<dyn Middleware>], sub: &Subscriber) -> Arc<dyn EventHandler> {
        middlewares
            .iter()
            .rev()
            .fold(Arc::clone(&sub.handler), |next, mw| mw.wrap(&sub.id, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventData, EventType};

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Ok(()) })
    }

    #[tokio::test]
    async fn wildcard_subscribers_merge_by_priority() {
        let bus = EventBus::new();
        bus.subscribe("task", Subscriber::new("low", noop()).with_priority(1))
            .await
            .unwrap();
        bus.subscribe(TOPIC_ALL, Subscriber::new("all", noop()).with_priority(3))
            .await
            .unwrap();
        bus.subscribe("task", Subscriber::new("high", noop()).with_priority(5))
            .await
            .unwrap();

        let ids: Vec<String> = bus.snapshot("task").iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["high", "all", "low"]);

        let wildcard: Vec<String> = bus.snapshot(TOPIC_ALL).iter().map(|s| s.id.clone()).collect();
        assert_eq!(wildcard, vec!["all"]);
    }

    #[tokio::test]
    async fn equal_priorities_keep_registration_order() {
        let bus = EventBus::new();
        for id in ["a", "b", "c"] {
            bus.subscribe("t", Subscriber::new(id, noop())).await.unwrap();
        }
        assert_eq!(bus.subscribers("t"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn publish_stamps_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "task",
            Subscriber::new(
                "rec",
                handler_fn(move |event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        *sink.lock().await = event.topic.clone();
                        Ok(())
                    }
                }),
            ),
        )
        .await
        .unwrap();

        bus.publish("task", Event::new(EventType::TaskStarted, EventData::Empty))
            .await
            .unwrap();
        assert_eq!(*seen.lock().await, "task");
    }
}
