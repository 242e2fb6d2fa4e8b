//! Composition root wiring the bus, queue, breakers and store together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerPool,
};
use crate::config::CoordinatorConfig;
use crate::event::{
    ActivityEventData, AgentEventData, Event, EventData, EventType, SessionEventData,
    SystemEventData, TaskEventData, ToolEventData, WorkflowEventData, TOPIC_ACTIVITY, TOPIC_AGENT,
    TOPIC_ALL, TOPIC_SESSION, TOPIC_SYSTEM, TOPIC_TASK, TOPIC_TOOL, TOPIC_WORKFLOW,
};
use crate::event_bus::{BusMetrics, EventBus, EventHandler, Subscriber};
use crate::message::Message;
use crate::middleware::{
    DedupCache, DeduplicationMiddleware, LoggingMiddleware, Middleware, RecoveryMiddleware,
};
use crate::queue::{MessageHandler, MessageQueue, QueueMetrics};
use crate::store::{EventStore, StoreStats};
use crate::{ConduitError, Result};

/// Subscriber ID of the built-in persistence subscriber
pub const STORE_SUBSCRIBER_ID: &str = "event-store";

/// Aggregated metrics of every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub event_bus: BusMetrics,
    pub message_queue: QueueMetrics,
    pub event_store: StoreStats,
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub dedup_entries: usize,
}

impl CoordinatorMetrics {
    /// The whole report as one JSON object
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// Persists every delivered event
struct StoreSubscriber {
    store: Arc<EventStore>,
}

#[async_trait]
impl EventHandler for StoreSubscriber {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        self.store.store(Event::clone(&event)).await;
        Ok(())
    }
}

/// Owns the event infrastructure and exposes typed emission helpers
pub struct EventCoordinator {
    config: CoordinatorConfig,
    bus: Arc<EventBus>,
    queue: Arc<MessageQueue>,
    store: Arc<EventStore>,
    breakers: Arc<CircuitBreakerPool>,
    dedup: Arc<DedupCache>,
}

impl EventCoordinator {
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let store = Arc::new(EventStore::new(config.store.clone()).await?);
        let breakers = Arc::new(CircuitBreakerPool::new());
        let dedup = Arc::new(DedupCache::new(config.dedup_window));

        bus.use_middleware(Arc::new(RecoveryMiddleware::new())).await;
        bus.use_middleware(Arc::new(LoggingMiddleware::new())).await;
        bus.use_middleware(Arc::new(DeduplicationMiddleware::new(Arc::clone(&dedup))))
            .await;

        if config.store.enabled {
            let persist = Arc::new(StoreSubscriber {
                store: Arc::clone(&store),
            });
            bus.subscribe(
                TOPIC_ALL,
                Subscriber::new(STORE_SUBSCRIBER_ID, persist)
                    .with_priority(-1)
                    .asynchronous(),
            )
            .await?;
        }

        info!(
            target: "coordinator",
            store_enabled = config.store.enabled,
            dedup_window_secs = config.dedup_window.as_secs(),
            "Event coordinator ready"
        );
        Ok(Self {
            config,
            bus,
            queue,
            store,
            breakers,
            dedup,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn message_queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerPool> {
        &self.breakers
    }

    pub fn dedup_cache(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    // --- consumer interface ---

    pub async fn subscribe(&self, topic: &str, subscriber: Subscriber) -> Result<()> {
        self.bus.subscribe(topic, subscriber).await
    }

    pub async fn unsubscribe(&self, topic: &str, id: &str) -> Result<()> {
        self.bus.unsubscribe(topic, id).await
    }

    /// Append middleware after the built-in recovery, logging and dedup layers
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.bus.use_middleware(middleware).await;
    }

    // --- producer interface ---

    /// Validate and publish an event on its topic, or its domain topic when unset
    pub async fn publish_event(&self, event: Event) -> Result<()> {
        event.validate()?;
        let topic = if event.topic.is_empty() {
            event.event_type.domain().topic().to_string()
        } else {
            event.topic.clone()
        };
        self.bus.publish(&topic, event).await
    }

    pub async fn emit_agent_event(
        &self,
        event_type: EventType,
        data: AgentEventData,
    ) -> Result<()> {
        self.emit(TOPIC_AGENT, event_type, data.into()).await
    }

    pub async fn emit_session_event(
        &self,
        event_type: EventType,
        data: SessionEventData,
    ) -> Result<()> {
        self.emit(TOPIC_SESSION, event_type, data.into()).await
    }

    pub async fn emit_task_event(&self, event_type: EventType, data: TaskEventData) -> Result<()> {
        self.emit(TOPIC_TASK, event_type, data.into()).await
    }

    pub async fn emit_activity_event(
        &self,
        event_type: EventType,
        data: ActivityEventData,
    ) -> Result<()> {
        self.emit(TOPIC_ACTIVITY, event_type, data.into()).await
    }

    pub async fn emit_tool_event(&self, event_type: EventType, data: ToolEventData) -> Result<()> {
        self.emit(TOPIC_TOOL, event_type, data.into()).await
    }

    pub async fn emit_workflow_event(
        &self,
        event_type: EventType,
        data: WorkflowEventData,
    ) -> Result<()> {
        self.emit(TOPIC_WORKFLOW, event_type, data.into()).await
    }

    pub async fn emit_system_event(
        &self,
        event_type: EventType,
        data: SystemEventData,
    ) -> Result<()> {
        self.emit(TOPIC_SYSTEM, event_type, data.into()).await
    }

    async fn emit(&self, topic: &str, event_type: EventType, data: EventData) -> Result<()> {
        let event = Event::new(event_type, data).with_topic(topic);
        self.publish_event(event).await
    }

    // --- background work interface ---

    pub fn create_queue(&self, name: &str, max_size: usize) -> Result<()> {
        self.queue.create_queue(name, max_size)
    }

    pub fn register_worker(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String> {
        self.queue.register_worker(queue_name, handler)
    }

    pub async fn enqueue_message(&self, message: Message) -> Result<String> {
        self.queue.enqueue(message).await
    }

    // --- fault isolation interface ---

    /// Named breaker, created with `config` (or the coordinator default) on first use
    pub fn get_circuit_breaker(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .get_or_create(name, config.unwrap_or_else(|| self.config.breaker.clone()))
    }

    pub async fn get_metrics(&self) -> CoordinatorMetrics {
        let circuit_breakers = self
            .breakers
            .metrics()
            .await
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        CoordinatorMetrics {
            event_bus: self.bus.metrics().await,
            message_queue: self.queue.metrics().await,
            event_store: self.store.stats().await,
            circuit_breakers,
            dedup_entries: self.dedup.len(),
        }
    }

    /// Stop the queue, then the bus, then the store within one shared deadline.
    ///
    /// Every stage runs even when an earlier one fails; the failures come back
    /// together as [`ConduitError::Shutdown`].
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(target: "coordinator", "Event coordinator shutting down");
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut errors = Vec::new();
        if let Err(e) = self.queue.shutdown(remaining()).await {
            error!(target: "coordinator", error = %e, "Message queue shutdown failed");
            errors.push(e);
        }
        if let Err(e) = self.bus.shutdown(remaining()).await {
            error!(target: "coordinator", error = %e, "Event bus shutdown failed");
            errors.push(e);
        }
        if let Err(e) = self.store.shutdown(remaining()).await {
            error!(target: "coordinator", error = %e, "Event store shutdown failed");
            errors.push(e);
        }

        if errors.is_empty() {
            info!(target: "coordinator", "Event coordinator stopped");
            Ok(())
        } else {
            Err(ConduitError::Shutdown(errors))
        }
    }
}
