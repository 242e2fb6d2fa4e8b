//! Event data model: event types, typed payloads, topics and builder helpers.
//!
//! Every event carries an [`EventType`] discriminant and an [`EventData`] payload
//! from a closed set of variants. The payload variant must belong to the same
//! [`EventDomain`] as the event type; [`Event::validate`] enforces that pairing so
//! consumers can match on the payload without guessing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConduitError, Result};

/// Wildcard topic: subscribers here receive events published on every topic.
pub const TOPIC_ALL: &str = "*";
pub const TOPIC_AGENT: &str = "agent";
pub const TOPIC_SESSION: &str = "session";
pub const TOPIC_TASK: &str = "task";
pub const TOPIC_ACTIVITY: &str = "activity";
pub const TOPIC_TOOL: &str = "tool";
pub const TOPIC_WORKFLOW: &str = "workflow";
pub const TOPIC_SYSTEM: &str = "system";

/// Functional area an event belongs to. Each domain owns one canonical topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDomain {
    Agent,
    Session,
    Task,
    Activity,
    Tool,
    Workflow,
    System,
}

impl EventDomain {
    /// Canonical topic used by the coordinator's typed emit helpers
    pub fn topic(self) -> &'static str {
        match self {
            EventDomain::Agent => TOPIC_AGENT,
            EventDomain::Session => TOPIC_SESSION,
            EventDomain::Task => TOPIC_TASK,
            EventDomain::Activity => TOPIC_ACTIVITY,
            EventDomain::Tool => TOPIC_TOOL,
            EventDomain::Workflow => TOPIC_WORKFLOW,
            EventDomain::System => TOPIC_SYSTEM,
        }
    }
}

/// Event discriminant. Serialized in its dotted form, e.g. `"task.completed"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.state_changed")]
    AgentStateChanged,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "agent.error")]
    AgentError,

    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.phase_changed")]
    SessionPhaseChanged,
    #[serde(rename = "session.completed")]
    SessionCompleted,
    #[serde(rename = "session.failed")]
    SessionFailed,

    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,

    #[serde(rename = "activity.started")]
    ActivityStarted,
    #[serde(rename = "activity.logged")]
    ActivityLogged,
    #[serde(rename = "activity.completed")]
    ActivityCompleted,

    #[serde(rename = "tool.invoked")]
    ToolInvoked,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    #[serde(rename = "tool.failed")]
    ToolFailed,

    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.step_completed")]
    WorkflowStepCompleted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,

    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
}

impl EventType {
    pub const ALL: [EventType; 25] = [
        EventType::AgentStateChanged,
        EventType::AgentStarted,
        EventType::AgentStopped,
        EventType::AgentError,
        EventType::SessionStarted,
        EventType::SessionPhaseChanged,
        EventType::SessionCompleted,
        EventType::SessionFailed,
        EventType::TaskCreated,
        EventType::TaskStarted,
        EventType::TaskProgress,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::ActivityStarted,
        EventType::ActivityLogged,
        EventType::ActivityCompleted,
        EventType::ToolInvoked,
        EventType::ToolCompleted,
        EventType::ToolFailed,
        EventType::WorkflowStarted,
        EventType::WorkflowStepCompleted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::SystemError,
        EventType::SystemShutdown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::AgentStateChanged => "agent.state_changed",
            EventType::AgentStarted => "agent.started",
            EventType::AgentStopped => "agent.stopped",
            EventType::AgentError => "agent.error",
            EventType::SessionStarted => "session.started",
            EventType::SessionPhaseChanged => "session.phase_changed",
            EventType::SessionCompleted => "session.completed",
            EventType::SessionFailed => "session.failed",
            EventType::TaskCreated => "task.created",
            EventType::TaskStarted => "task.started",
            EventType::TaskProgress => "task.progress",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::ActivityStarted => "activity.started",
            EventType::ActivityLogged => "activity.logged",
            EventType::ActivityCompleted => "activity.completed",
            EventType::ToolInvoked => "tool.invoked",
            EventType::ToolCompleted => "tool.completed",
            EventType::ToolFailed => "tool.failed",
            EventType::WorkflowStarted => "workflow.started",
            EventType::WorkflowStepCompleted => "workflow.step_completed",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowFailed => "workflow.failed",
            EventType::SystemError => "system.error",
            EventType::SystemShutdown => "system.shutdown",
        }
    }

    pub fn domain(self) -> EventDomain {
        use EventType::*;
        match self {
            AgentStateChanged | AgentStarted | AgentStopped | AgentError => EventDomain::Agent,
            SessionStarted | SessionPhaseChanged | SessionCompleted | SessionFailed => {
                EventDomain::Session
            }
            TaskCreated | TaskStarted | TaskProgress | TaskCompleted | TaskFailed => {
                EventDomain::Task
            }
            ActivityStarted | ActivityLogged | ActivityCompleted => EventDomain::Activity,
            ToolInvoked | ToolCompleted | ToolFailed => EventDomain::Tool,
            WorkflowStarted | WorkflowStepCompleted | WorkflowCompleted | WorkflowFailed => {
                EventDomain::Workflow
            }
            SystemError | SystemShutdown => EventDomain::System,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConduitError::InvalidArgument(format!("unknown event type: {s}")))
    }
}

/// Delivery priority carried on an event
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Agent lifecycle payload (state machine transitions, start/stop, errors)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentEventData {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Multi-phase session orchestration payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionEventData {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskEventData {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Completion ratio in `0.0..=1.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Human-readable progress line for UI reporters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityEventData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolEventData {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowEventData {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemEventData {
    pub component: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed event payload, one variant per [`EventDomain`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventData {
    #[default]
    Empty,
    Agent(AgentEventData),
    Session(SessionEventData),
    Task(TaskEventData),
    Activity(ActivityEventData),
    Tool(ToolEventData),
    Workflow(WorkflowEventData),
    System(SystemEventData),
}

impl EventData {
    /// Domain of the payload; `None` for [`EventData::Empty`]
    pub fn domain(&self) -> Option<EventDomain> {
        match self {
            EventData::Empty => None,
            EventData::Agent(_) => Some(EventDomain::Agent),
            EventData::Session(_) => Some(EventDomain::Session),
            EventData::Task(_) => Some(EventDomain::Task),
            EventData::Activity(_) => Some(EventDomain::Activity),
            EventData::Tool(_) => Some(EventDomain::Tool),
            EventData::Workflow(_) => Some(EventDomain::Workflow),
            EventData::System(_) => Some(EventDomain::System),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EventData::Empty => "empty",
            EventData::Agent(_) => "agent",
            EventData::Session(_) => "session",
            EventData::Task(_) => "task",
            EventData::Activity(_) => "activity",
            EventData::Tool(_) => "tool",
            EventData::Workflow(_) => "workflow",
            EventData::System(_) => "system",
        }
    }
}

impl From<AgentEventData> for EventData {
    fn from(d: AgentEventData) -> Self {
        EventData::Agent(d)
    }
}

impl From<SessionEventData> for EventData {
    fn from(d: SessionEventData) -> Self {
        EventData::Session(d)
    }
}

impl From<TaskEventData> for EventData {
    fn from(d: TaskEventData) -> Self {
        EventData::Task(d)
    }
}

impl From<ActivityEventData> for EventData {
    fn from(d: ActivityEventData) -> Self {
        EventData::Activity(d)
    }
}

impl From<ToolEventData> for EventData {
    fn from(d: ToolEventData) -> Self {
        EventData::Tool(d)
    }
}

impl From<WorkflowEventData> for EventData {
    fn from(d: WorkflowEventData) -> Self {
        EventData::Workflow(d)
    }
}

impl From<SystemEventData> for EventData {
    fn from(d: SystemEventData) -> Self {
        EventData::System(d)
    }
}

/// A state change announced on the bus.
///
/// Build with [`Event::new`] and the `with_*` methods before publishing; once
/// published the event is shared by reference (`Arc<Event>`) across subscribers
/// and is never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: EventData,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub retries: u32,
}

impl Event {
    /// Create an event with a fresh ID and the current timestamp
    pub fn new(event_type: EventType, data: impl Into<EventData>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            topic: String::new(),
            source: String::new(),
            timestamp: Utc::now(),
            data: data.into(),
            metadata: HashMap::new(),
            priority: EventPriority::Normal,
            ttl: None,
            retries: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
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

    /// True when a TTL is set and has elapsed since `timestamp`
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => self
                    .timestamp
                    .checked_add_signed(ttl)
                    .map_or(false, |deadline| Utc::now() > deadline),
                // TTL too large to represent never expires
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Check that the payload variant belongs to the event type's domain.
    /// [`EventData::Empty`] is accepted for every type.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ConduitError::InvalidArgument("event id is empty".into()));
        }
        match self.data.domain() {
            Some(domain) if domain != self.event_type.domain() => {
                Err(ConduitError::PayloadMismatch {
                    event_type: self.event_type.to_string(),
                    found: self.data.kind().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}
