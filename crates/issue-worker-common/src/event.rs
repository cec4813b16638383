use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobPhase;

/// Kinds of control events accepted by the supervisor.
///
/// Issue activity notifications (`comment_added`, `review_changes`,
/// `ci_failed`) are accepted as aliases of `rerun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    #[serde(alias = "comment_added", alias = "review_changes", alias = "ci_failed")]
    Rerun,
    Stop,
    Cleanup,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Rerun => "rerun",
            EventType::Stop => "stop",
            EventType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional job context carried by a `start` event. Missing fields fall back
/// to the worker's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPayload {
    pub repo: Option<String>,
    #[serde(alias = "issue")]
    pub issue_number: Option<u64>,
    #[serde(alias = "base")]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: EventPayload,
}

impl WorkerEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            payload: EventPayload::default(),
        }
    }
}

/// Reply to an event. `accepted` is false for events that were valid but had
/// nothing to do, such as `stop` with no active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    pub event: EventType,
    pub accepted: bool,
    pub phase: JobPhase,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_payload() {
        let json = r#"{"type":"start","payload":{"repo":"acme/widgets","issue_number":7,"base_branch":"dev"}}"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::Start);
        assert_eq!(event.payload.repo.as_deref(), Some("acme/widgets"));
        assert_eq!(event.payload.issue_number, Some(7));
        assert_eq!(event.payload.base_branch.as_deref(), Some("dev"));
    }

    #[test]
    fn payload_is_optional() {
        let event: WorkerEvent = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(event.event_type, EventType::Stop);
        assert_eq!(event.payload, EventPayload::default());
    }

    #[test]
    fn activity_events_alias_rerun() {
        for name in ["rerun", "comment_added", "review_changes", "ci_failed"] {
            let json = format!(r#"{{"type":"{}"}}"#, name);
            let event: WorkerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event.event_type, EventType::Rerun, "alias {}", name);
        }
    }

    #[test]
    fn short_payload_field_names() {
        let json = r#"{"type":"start","payload":{"issue":9,"base":"trunk"}}"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.payload.issue_number, Some(9));
        assert_eq!(event.payload.base_branch.as_deref(), Some("trunk"));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<WorkerEvent>(r#"{"type":"deploy"}"#).is_err());
    }
}
