//! Named priority queues with a worker pool, retries and a dead-letter queue.
//!
//! Each queue is bounded: [`MessageQueue::enqueue`] rejects new work with
//! [`ConduitError::QueueFull`] at capacity instead of blocking or growing. A
//! worker pops the highest-priority item, runs its handler and on failure
//! re-queues the item after the retry delay until the message's `max_retries`
//! budget is spent, at which point it lands in the [`DeadLetterQueue`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::message::{DeadLetterMessage, Message, QueueItem};
use crate::{ConduitError, Result};

/// Queue message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

struct FnMessageHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn message_handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnMessageHandler(f))
}

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delay before the first retry of a failed message
    pub retry_delay: Duration,

    /// Growth factor applied per further attempt; 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,

    /// Upper bound for the retry delay
    pub max_retry_delay: Duration,

    /// Dead letters kept before the oldest is evicted
    pub dlq_capacity: usize,

    /// How long an idle worker waits for a wake-up before polling again
    pub idle_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(60),
            dlq_capacity: 1_000,
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Exponential backoff between retries
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_retry_delay = max_delay;
        self
    }

    pub fn with_dlq_capacity(mut self, capacity: usize) -> Self {
        self.dlq_capacity = capacity;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 1.0 {
            self.backoff_multiplier
        } else {
            return self.retry_delay;
        };
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.retry_delay.as_secs_f64() * multiplier.powi(exponent);
        // Out of range (too big or NaN) means the cap applies
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_retry_delay, |delay| delay.min(self.max_retry_delay))
    }
}

// ==============================================================================
// Priority queue
// ==============================================================================

struct Ranked {
    item: QueueItem,
    seq: u64,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    // Max-heap on priority; older insertions first among equals
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue for one named lane.
///
/// Backed by a binary heap. Callers only rely on highest-priority-first; the
/// order among equal priorities is an implementation detail.
pub struct PriorityQueue {
    name: String,
    max_size: usize,
    heap: Mutex<BinaryHeap<Ranked>>,
    seq: AtomicU64,
    not_empty: Notify,
}

impl PriorityQueue {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            not_empty: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Add an item, failing with [`ConduitError::QueueFull`] at capacity
    pub async fn push(&self, item: QueueItem) -> Result<()> {
        {
            let mut heap = self.heap.lock().await;
            if heap.len() >= self.max_size {
                return Err(ConduitError::QueueFull {
                    queue: self.name.clone(),
                    max_size: self.max_size,
                });
            }
            heap.push(self.rank(item));
        }
        self.not_empty.notify_one();
        Ok(())
    }

    // Retries re-enter regardless of capacity: the item was already admitted.
    async fn requeue(&self, item: QueueItem) {
        self.heap.lock().await.push(self.rank(item));
        self.not_empty.notify_one();
    }

    pub async fn pop(&self) -> Option<QueueItem> {
        self.heap.lock().await.pop().map(|r| r.item)
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    fn rank(&self, item: QueueItem) -> Ranked {
        Ranked {
            item,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

// ==============================================================================
// Dead-letter queue
// ==============================================================================

/// Bounded FIFO of dead letters; the oldest entry is evicted when full
pub struct DeadLetterQueue {
    capacity: usize,
    items: Mutex<VecDeque<DeadLetterMessage>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, message: DeadLetterMessage) {
        let mut items = self.items.lock().await;
        while items.len() >= self.capacity {
            if let Some(evicted) = items.pop_front() {
                warn!(target: "message_queue", message_id = %evicted.message.id, "Dead-letter queue full, evicting oldest entry");
            }
        }
        items.push_back(message);
    }

    /// All dead letters, oldest first
    pub async fn list(&self) -> Vec<DeadLetterMessage> {
        self.items.lock().await.iter().cloned().collect()
    }

    pub async fn get(&self, message_id: &str) -> Option<DeadLetterMessage> {
        self.items
            .lock()
            .await
            .iter()
            .find(|d| d.message.id == message_id)
            .cloned()
    }

    pub async fn remove(&self, message_id: &str) -> Option<DeadLetterMessage> {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|d| d.message.id == message_id)?;
        items.remove(pos)
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn clear(&self) -> usize {
        let mut items = self.items.lock().await;
        let n = items.len();
        items.clear();
        n
    }
}

// ==============================================================================
// Message queue
// ==============================================================================

/// Message queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub processed: u64,
    /// Failed handler invocations, including ones that were retried
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Enqueue attempts refused at capacity
    pub rejected: u64,
    pub workers: usize,
    pub dlq_size: usize,
    pub queue_sizes: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
}

struct WorkerHandle {
    queue: String,
    stop: CancellationToken,
}

/// Named priority queues served by registered workers
pub struct MessageQueue {
    config: QueueConfig,
    queues: DashMap<String, Arc<PriorityQueue>>,
    workers: DashMap<String, WorkerHandle>,
    dlq: Arc<DeadLetterQueue>,
    stats: Arc<QueueStats>,
    worker_seq: AtomicU64,
    stop: CancellationToken,
    tracker: TaskTracker,
    stopping: AtomicBool,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_capacity));
        Self {
            config,
            queues: DashMap::new(),
            workers: DashMap::new(),
            dlq,
            stats: Arc::new(QueueStats::default()),
            worker_seq: AtomicU64::new(0),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create a bounded queue
    pub fn create_queue(&self, name: &str, max_size: usize) -> Result<()> {
        if name.is_empty() {
            return Err(ConduitError::InvalidArgument("queue name is empty".into()));
        }
        if max_size == 0 {
            return Err(ConduitError::InvalidArgument(format!(
                "queue {name} needs a max size above zero"
            )));
        }
        match self.queues.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConduitError::QueueExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(PriorityQueue::new(name, max_size)));
                info!(target: "message_queue", queue = %name, max_size, "Queue created");
                Ok(())
            }
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn queue_len(&self, name: &str) -> Result<usize> {
        let queue = self.queue(name)?;
        Ok(queue.len().await)
    }

    /// Start a worker serving `queue_name`; returns the worker ID
    pub fn register_worker(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String> {
        if self.is_shutting_down() {
            return Err(ConduitError::QueueShutdown);
        }
        let queue = self.queue(queue_name)?;
        let n = self.worker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let worker_id = format!("{queue_name}-worker-{n}");
        let stop = self.stop.child_token();

        let worker = Worker {
            id: worker_id.clone(),
            queue,
            handler,
            dlq: Arc::clone(&self.dlq),
            stats: Arc::clone(&self.stats),
            config: self.config.clone(),
            stop: stop.clone(),
        };
        self.workers.insert(
            worker_id.clone(),
            WorkerHandle {
                queue: queue_name.to_string(),
                stop,
            },
        );
        self.tracker.spawn(worker.run());

        info!(target: "message_queue", queue = %queue_name, worker = %worker_id, "Worker registered");
        Ok(worker_id)
    }

    /// Stop one worker after its current message
    pub fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let (_, handle) = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| ConduitError::NotFound(format!("worker {worker_id}")))?;
        handle.stop.cancel();
        info!(target: "message_queue", queue = %handle.queue, worker = %worker_id, "Worker unregistered");
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a message on its queue; returns the message ID.
    ///
    /// Fails with [`ConduitError::QueueFull`] when the queue is at capacity.
    #[tracing::instrument(skip(self, message), fields(queue = %message.queue, message_type = %message.message_type))]
    pub async fn enqueue(&self, mut message: Message) -> Result<String> {
        if self.is_shutting_down() {
            return Err(ConduitError::QueueShutdown);
        }
        let queue = self.queue(&message.queue)?;
        message.fill_defaults();
        let id = message.id.clone();

        if let Err(err) = queue.push(QueueItem::new(message)).await {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(target: "message_queue", queue = %queue.name(), message_id = %id, "Queue at capacity, message rejected");
            return Err(err);
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(target: "message_queue", queue = %queue.name(), message_id = %id, "Message enqueued");
        Ok(id)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.dlq.list().await
    }

    pub async fn dead_letter(&self, message_id: &str) -> Option<DeadLetterMessage> {
        self.dlq.get(message_id).await
    }

    /// Move a dead letter back onto its queue with a fresh retry budget.
    ///
    /// Counts as a new enqueue in [`QueueMetrics::enqueued`].
    pub async fn requeue_dead_letter(&self, message_id: &str) -> Result<()> {
        let dead = self
            .dlq
            .remove(message_id)
            .await
            .ok_or_else(|| ConduitError::NotFound(format!("dead letter {message_id}")))?;
        let queue = match self.queue(&dead.message.queue) {
            Ok(q) => q,
            Err(err) => {
                self.dlq.push(dead).await;
                return Err(err);
            }
        };

        let mut message = dead.message.clone();
        message.retries = 0;
        if let Err(err) = queue.push(QueueItem::new(message)).await {
            self.dlq.push(dead).await;
            return Err(err);
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        info!(target: "message_queue", queue = %queue.name(), message_id = %message_id, "Dead letter requeued");
        Ok(())
    }

    /// Drop every dead letter; returns how many were removed
    pub async fn purge_dead_letters(&self) -> usize {
        self.dlq.clear().await
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let queues: Vec<Arc<PriorityQueue>> =
            self.queues.iter().map(|e| Arc::clone(e.value())).collect();
        let mut queue_sizes = HashMap::with_capacity(queues.len());
        for q in queues {
            queue_sizes.insert(q.name().to_string(), q.len().await);
        }
        QueueMetrics {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            workers: self.workers.len(),
            dlq_size: self.dlq.len().await,
            queue_sizes,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop accepting work, signal every worker and wait for them to exit
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(target: "message_queue", workers = self.workers.len(), "Message queue shutting down");
        self.stopping.store(true, Ordering::Release);
        self.stop.cancel();
        self.tracker.close();

        let res = tokio::time::timeout(timeout, self.tracker.wait()).await;
        self.workers.clear();
        match res {
            Ok(()) => {
                info!(target: "message_queue", "Message queue stopped");
                Ok(())
            }
            Err(_) => {
                warn!(target: "message_queue", pending = self.tracker.len(), "Workers still running at shutdown deadline");
                Err(ConduitError::ShutdownTimeout {
                    component: "message_queue",
                    timeout,
                })
            }
        }
    }

    fn queue(&self, name: &str) -> Result<Arc<PriorityQueue>> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| ConduitError::QueueNotFound(name.to_string()))
    }
}

// ==============================================================================
// Worker
// ==============================================================================

struct Worker {
    id: String,
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn MessageHandler>,
    dlq: Arc<DeadLetterQueue>,
    stats: Arc<QueueStats>,
    config: QueueConfig,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(target: "message_queue", worker = %self.id, queue = %self.queue.name(), "Worker started");
        while !self.stop.is_cancelled() {
            match self.queue.pop().await {
                Some(item) => self.process(item).await,
                None => {
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = self.queue.not_empty.notified() => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
            }
        }
        debug!(target: "message_queue", worker = %self.id, "Worker stopped");
    }

    async fn process(&self, mut item: QueueItem) {
        item.attempts += 1;
        item.message.retries = item.attempts - 1;
        let message_id = item.message.id.clone();

        let err = match self.invoke(item.message.clone()).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!(target: "message_queue", worker = %self.id, message_id = %message_id, attempts = item.attempts, "Message processed");
                return;
            }
            Err(err) => err,
        };
        self.stats.failed.fetch_add(1, Ordering::Relaxed);

        if item.attempts < item.message.max_retries {
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.retry_delay_for(item.attempts);
            debug!(
                target: "message_queue",
                worker = %self.id,
                message_id = %message_id,
                attempt = item.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Message failed, retrying"
            );
            // On shutdown the item still goes back so it is not lost
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            self.queue.requeue(item).await;
            return;
        }

        warn!(
            target: "message_queue",
            worker = %self.id,
            message_id = %message_id,
            attempts = item.attempts,
            error = %err,
            "Message exhausted retries, dead-lettering"
        );
        let last_error = err.to_string();
        self.dlq
            .push(DeadLetterMessage {
                error: format!("failed after {} attempts: {}", item.attempts, last_error),
                failed_at: Utc::now(),
                attempts: item.attempts,
                last_error,
                message: item.message,
            })
            .await;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    async fn invoke(&self, message: Message) -> Result<()> {
        let timeout = message.timeout;
        let call = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(ConduitError::Timeout(limit)),
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|_| {
            Err(ConduitError::HandlerPanic(format!(
                "message handler on queue {} panicked",
                self.queue.name()
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(priority: i64) -> QueueItem {
        QueueItem::new(Message::new("q", "job", json!({})).with_priority(priority))
    }

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let q = PriorityQueue::new("q", 10);
        for p in [1, 5, 3, -2, 4] {
            q.push(item(p)).await.unwrap();
        }
        let mut order = Vec::new();
        while let Some(i) = q.pop().await {
            order.push(i.priority);
        }
        assert_eq!(order, vec![5, 4, 3, 1, -2]);
    }

    #[tokio::test]
    async fn push_rejects_at_capacity_but_requeue_does_not() {
        let q = PriorityQueue::new("q", 2);
        q.push(item(0)).await.unwrap();
        q.push(item(0)).await.unwrap();
        assert!(matches!(
            q.push(item(0)).await,
            Err(ConduitError::QueueFull { max_size: 2, .. })
        ));
        q.requeue(item(0)).await;
        assert_eq!(q.len().await, 3);
    }

    #[tokio::test]
    async fn dead_letter_queue_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2);
        for id in ["a", "b", "c"] {
            dlq.push(DeadLetterMessage {
                message: Message::new("q", "job", json!({})).with_id(id),
                error: "boom".into(),
                failed_at: Utc::now(),
                attempts: 3,
                last_error: "boom".into(),
            })
            .await;
        }
        let ids: Vec<String> = dlq.list().await.into_iter().map(|d| d.message.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn retry_delay_fixed_and_exponential() {
        let fixed = QueueConfig::default().with_retry_delay(Duration::from_millis(100));
        assert_eq!(fixed.retry_delay_for(1), Duration::from_millis(100));
        assert_eq!(fixed.retry_delay_for(5), Duration::from_millis(100));

        let expo = fixed.with_backoff(2.0, Duration::from_millis(500));
        assert_eq!(expo.retry_delay_for(1), Duration::from_millis(100));
        assert_eq!(expo.retry_delay_for(2), Duration::from_millis(200));
        assert_eq!(expo.retry_delay_for(3), Duration::from_millis(400));
        assert_eq!(expo.retry_delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_saturates_at_huge_cap() {
        let unbounded = QueueConfig::default().with_backoff(2.0, Duration::MAX);
        assert_eq!(unbounded.retry_delay_for(70), Duration::MAX);
        assert_eq!(unbounded.retry_delay_for(u32::MAX), Duration::MAX);
        assert_eq!(unbounded.retry_delay_for(2), Duration::from_secs(2));

        let capped = QueueConfig::default().with_backoff(10.0, Duration::from_secs(30));
        assert_eq!(capped.retry_delay_for(1_000), Duration::from_secs(30));
    }
}
