//! Observability events emitted while workflows run.

use crate::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of an [`Event`].
///
/// Serialized as its dotted name, custom types as their own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    WorkflowStart,
    WorkflowStep,
    AgentStart,
    AgentComplete,
    AgentError,
    Progress,
    StateUpdate,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::WorkflowStart => "workflow.start",
            EventType::WorkflowStep => "workflow.step",
            EventType::AgentStart => "agent.start",
            EventType::AgentComplete => "agent.complete",
            EventType::AgentError => "agent.error",
            EventType::Progress => "progress",
            EventType::StateUpdate => "state.update",
            EventType::Custom(name) => name,
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of something that happened during a run.
///
/// Errors are carried in their string form.
///
/// # Examples
///
/// ```
/// use hataori_core::{Event, EventType};
/// use serde_json::json;
///
/// let event = Event::new(EventType::Progress, "agent-1", "pipeline", json!({"step": "fetch"}))
///     .with_metadata("attempt", 2);
///
/// let encoded = serde_json::to_value(&event).unwrap();
/// assert_eq!(encoded["type"], "progress");
/// assert_eq!(encoded["metadata"]["attempt"], 2);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub agent_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
            data,
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// Attaches the string form of `error`.
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns `true` for error events and events carrying an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.event_type == EventType::AgentError
    }
}

/// Predicate selecting which events a subscriber receives.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Accepts events whose type is one of `types`.
pub fn filter_by_type(types: impl IntoIterator<Item = EventType>) -> EventFilter {
    let types: Vec<EventType> = types.into_iter().collect();
    Arc::new(move |event: &Event| types.contains(&event.event_type))
}

/// Accepts events emitted by the agent with the given id.
pub fn filter_by_agent(agent_id: impl Into<String>) -> EventFilter {
    let agent_id = agent_id.into();
    Arc::new(move |event: &Event| event.agent_id == agent_id)
}

/// Accepts events emitted by agents with the given name.
pub fn filter_by_agent_name(agent_name: impl Into<String>) -> EventFilter {
    let agent_name = agent_name.into();
    Arc::new(move |event: &Event| event.agent_name == agent_name)
}

/// Accepts error events only.
pub fn filter_errors() -> EventFilter {
    Arc::new(Event::is_error)
}

/// Accepts events matching every filter. An empty list accepts all.
pub fn combine_filters(filters: impl IntoIterator<Item = EventFilter>) -> EventFilter {
    let filters: Vec<EventFilter> = filters.into_iter().collect();
    Arc::new(move |event: &Event| filters.iter().all(|filter| filter(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, agent: &str) -> Event {
        Event::new(event_type, format!("{agent}-id"), agent, Value::Null)
    }

    #[test]
    fn test_error_serialized_as_string() {
        let err = crate::WorkflowError::step("fetch", "timeout");
        let event = event(EventType::AgentError, "a").with_error(&err);
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["error"], json!("Step failed: fetch, details: timeout"));
        assert_eq!(encoded["type"], "agent.error");
    }

    #[test]
    fn test_is_error() {
        assert!(event(EventType::AgentError, "a").is_error());
        assert!(event(EventType::Progress, "a").with_error("boom").is_error());
        assert!(!event(EventType::Progress, "a").is_error());
    }

    #[test]
    fn test_filters() {
        let start = event(EventType::WorkflowStart, "alpha");
        let failure = event(EventType::AgentError, "beta");

        let by_type = filter_by_type([EventType::WorkflowStart]);
        assert!(by_type(&start));
        assert!(!by_type(&failure));

        assert!(filter_by_agent("beta-id")(&failure));
        assert!(filter_by_agent_name("alpha")(&start));
        assert!(filter_errors()(&failure));

        let combined = combine_filters([filter_errors(), filter_by_agent_name("alpha")]);
        assert!(!combined(&failure));
        assert!(combine_filters([])(&start));
    }

    #[test]
    fn test_custom_type_name() {
        let custom = EventType::Custom("cache.hit".into());
        assert_eq!(custom.to_string(), "cache.hit");
    }
}
