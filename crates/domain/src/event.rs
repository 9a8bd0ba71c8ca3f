//! Canonical session events.
//!
//! Every observable thing a session does becomes an [`EventRecord`] in the
//! append-only per-session log: `{seq, type, data, created_at}` on the wire,
//! with `data` shaped by the event kind.  The same record is fanned out to
//! every live subscriber queue, so SSE clients and bridge routers see the
//! log order exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionState;

/// Output granularity.
///
/// `step` is intermediate trace (tool calls, thinking), `final` is the
/// user-visible assistant text for the turn, `header` is runner banner text
/// (never logged; it updates `runner_header` on the session row instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Step,
    Final,
    Header,
}

/// Payload of a session event, tagged by event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Output {
        text: String,
        kind: OutputKind,
        #[serde(rename = "final")]
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_history: Option<bool>,
    },
    /// Turn-level concatenation of final output.  Convenience event: bridge
    /// routers always skip it, SSE clients may use or derive it.
    OutputFinal {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_history: Option<bool>,
    },
    SessionState {
        state: SessionState,
    },
    Error {
        code: String,
        message: String,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },
    InputRequired {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_output: Option<String>,
    },
    Header {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sandbox: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        approval: Option<String>,
    },
    Metadata {
        key: String,
        value: Value,
        raw: String,
    },
    Heartbeat {
        elapsed_s: f64,
        done: bool,
    },
}

impl EventPayload {
    /// The wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Output { .. } => "output",
            EventPayload::OutputFinal { .. } => "output_final",
            EventPayload::SessionState { .. } => "session_state",
            EventPayload::Error { .. } => "error",
            EventPayload::PermissionRequest { .. } => "permission_request",
            EventPayload::InputRequired { .. } => "input_required",
            EventPayload::Header { .. } => "header",
            EventPayload::Metadata { .. } => "metadata",
            EventPayload::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Whether the payload carries the history-replay marker.
    pub fn is_history(&self) -> bool {
        matches!(
            self,
            EventPayload::Output {
                is_history: Some(true),
                ..
            } | EventPayload::OutputFinal {
                is_history: Some(true),
                ..
            }
        )
    }
}

/// One entry of the append-only per-session event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_event_wire_shape() {
        let record = EventRecord {
            seq: 7,
            payload: EventPayload::Output {
                text: "hello".into(),
                kind: OutputKind::Final,
                is_final: true,
                is_history: None,
            },
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["seq"], 7);
        assert_eq!(v["type"], "output");
        assert_eq!(v["data"]["text"], "hello");
        assert_eq!(v["data"]["kind"], "final");
        assert_eq!(v["data"]["final"], true);
        assert!(v["data"].get("is_history").is_none());
    }

    #[test]
    fn record_round_trips() {
        let record = EventRecord {
            seq: 1,
            payload: EventPayload::Metadata {
                key: "tokens".into(),
                value: serde_json::json!({"input": 10, "output": 2}),
                raw: "input: 10, output: 2".into(),
            },
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn session_state_event_uses_state_names() {
        let payload = EventPayload::SessionState {
            state: SessionState::AwaitingInput,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "session_state");
        assert_eq!(v["data"]["state"], "AWAITING_INPUT");
    }

    #[test]
    fn history_marker_detection() {
        let history = EventPayload::Output {
            text: "old".into(),
            kind: OutputKind::Final,
            is_final: true,
            is_history: Some(true),
        };
        assert!(history.is_history());
        let live = EventPayload::Heartbeat {
            elapsed_s: 5.0,
            done: false,
        };
        assert!(!live.is_history());
    }
}
