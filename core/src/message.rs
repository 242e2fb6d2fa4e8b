//! Work items for the message queue.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key the queue reads an item's priority from
pub const PRIORITY_KEY: &str = "priority";

/// Retry budget applied when a message does not set one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unit of background work addressed to a named queue.
///
/// `id`, `timestamp` and `max_retries` are filled in by
/// [`MessageQueue::enqueue`](crate::MessageQueue::enqueue) when left unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub queue: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Upper bound for a single handler invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Message {
    pub fn new(
        queue: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: String::new(),
            message_type: message_type.into(),
            queue: queue.into(),
            payload,
            timestamp: DateTime::<Utc>::default(),
            metadata: HashMap::new(),
            retries: 0,
            max_retries: 0,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.metadata
            .insert(PRIORITY_KEY.to_string(), serde_json::Value::from(priority));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Priority from `metadata["priority"]`: an integer or a numeric string, else 0
    pub fn priority(&self) -> i64 {
        match self.metadata.get(PRIORITY_KEY) {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub(crate) fn fill_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.timestamp == DateTime::<Utc>::default() {
            self.timestamp = Utc::now();
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
    }
}

/// A message waiting in a priority queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub message: Message,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Handler invocations so far
    pub attempts: u32,
}

impl QueueItem {
    pub fn new(message: Message) -> Self {
        Self {
            priority: message.priority(),
            message,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// A message that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub message: Message,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
}
