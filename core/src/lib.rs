// Conduit Core Library
// In-process event infrastructure: pub/sub bus, work queues, circuit breakers, event store

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod event_bus;
pub mod message;
pub mod middleware;
pub mod queue;
pub mod store;
pub mod telemetry;

// Export core types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerMiddleware,
    CircuitBreakerPool, CircuitState,
};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorMetrics, EventCoordinator};
pub use event::{
    Event, EventData, EventDomain, EventPriority, EventType, TOPIC_ACTIVITY, TOPIC_AGENT,
    TOPIC_ALL, TOPIC_SESSION, TOPIC_SYSTEM, TOPIC_TASK, TOPIC_TOOL, TOPIC_WORKFLOW,
};
pub use event_bus::{handler_fn, BusMetrics, EventBus, EventFilter, EventHandler, Subscriber};
pub use message::{DeadLetterMessage, Message, QueueItem};
pub use middleware::{
    DedupCache, DeduplicationMiddleware, EventTypeMetrics, FilterMiddleware, LoggingMiddleware,
    MetricsMiddleware, Middleware, RecoveryMiddleware, RetryMiddleware, TimeoutMiddleware,
};
pub use queue::{
    message_handler_fn, DeadLetterQueue, MessageHandler, MessageQueue, PriorityQueue, QueueConfig,
    QueueMetrics,
};
pub use store::{EventStore, EventStoreConfig, StoreStats, StoredEvent};

// Error types
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConduitError {
    // --- contract errors: returned synchronously, never retried ---
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Subscriber {id} already registered on topic {topic}")]
    DuplicateSubscriber { topic: String, id: String },

    #[error("Subscriber {id} not found on topic {topic}")]
    SubscriberNotFound { topic: String, id: String },

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Event bus is shutting down")]
    BusShutdown,

    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {queue} is full (max size {max_size})")]
    QueueFull { queue: String, max_size: usize },

    #[error("Message queue is shutting down")]
    QueueShutdown,

    #[error("Payload mismatch: event type {event_type} does not accept a {found} payload")]
    PayloadMismatch { event_type: String, found: String },

    // --- transient processing errors ---
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Delivery failed for {failed} of {attempted} subscribers: {first}")]
    Delivery {
        failed: usize,
        attempted: usize,
        first: Box<ConduitError>,
    },

    // --- systemic failures ---
    #[error("Circuit breaker {0} is open")]
    CircuitOpen(String),

    // --- infrastructure ---
    #[error("Operation cancelled")]
    Cancelled,

    #[error("{component} did not shut down within {timeout:?}")]
    ShutdownTimeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("Shutdown finished with errors: {}", join_errors(.0))]
    Shutdown(Vec<ConduitError>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConduitError {
    /// Shorthand for a handler failure with a message.
    pub fn handler(reason: impl Into<String>) -> Self {
        ConduitError::Handler(reason.into())
    }

    /// Caller mistakes that will fail the same way on every attempt.
    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            ConduitError::InvalidArgument(_)
                | ConduitError::DuplicateSubscriber { .. }
                | ConduitError::SubscriberNotFound { .. }
                | ConduitError::TopicNotFound(_)
                | ConduitError::BusShutdown
                | ConduitError::QueueExists(_)
                | ConduitError::QueueNotFound(_)
                | ConduitError::QueueFull { .. }
                | ConduitError::QueueShutdown
                | ConduitError::PayloadMismatch { .. }
        )
    }

    /// Errors worth another attempt after a delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConduitError::Handler(_)
            | ConduitError::HandlerPanic(_)
            | ConduitError::Timeout(_)
            | ConduitError::Io(_) => true,
            ConduitError::Delivery { first, .. } => first.is_retryable(),
            _ => false,
        }
    }
}

fn join_errors(errors: &[ConduitError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_serde_errors_convert() {
        let io: ConduitError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(io, ConduitError::Io(_)));
        assert!(io.is_retryable());
        assert!(!io.is_contract());

        let serde: ConduitError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(serde, ConduitError::Serialization(_)));
        assert!(!serde.is_retryable());
    }

    #[test]
    fn delivery_retryability_follows_first_error() {
        let err = ConduitError::Delivery {
            failed: 1,
            attempted: 2,
            first: Box::new(ConduitError::handler("boom")),
        };
        assert!(err.is_retryable());
        let err = ConduitError::Delivery {
            failed: 1,
            attempted: 1,
            first: Box::new(ConduitError::CircuitOpen("db".into())),
        };
        assert!(!err.is_retryable());
    }
}
