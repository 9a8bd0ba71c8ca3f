//! Routes session events to platform bridges.
//!
//! One background consumer per bound session.  The subscriber queue is
//! registered synchronously before the consumer task starts, so events
//! emitted in between are not lost.  History replay, intermediate steps,
//! and turn-blob events are filtered out; everything else maps to a bridge
//! verb.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use tether_domain::event::EventPayload;
use tether_domain::session::SessionState;
use tether_store::{SessionStore, Subscription};

use crate::{ApprovalKind, ApprovalRequest, Bridge, BridgeManager};

struct ConsumerEntry {
    handle: JoinHandle<()>,
    subscriber_id: u64,
}

/// Per-session consumers that forward store events to platform bridges.
pub struct BridgeSubscriber {
    store: Arc<SessionStore>,
    manager: Arc<BridgeManager>,
    tasks: Mutex<HashMap<String, ConsumerEntry>>,
}

impl BridgeSubscriber {
    pub fn new(store: Arc<SessionStore>, manager: Arc<BridgeManager>) -> Self {
        Self {
            store,
            manager,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start consuming events for a session.  No-op when a consumer for the
    /// session is already running.
    pub fn subscribe(&self, session_id: &str, platform: &str) {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(session_id) {
            return;
        }

        // Register the queue eagerly so no events are missed between here
        // and the consumer's first iteration.
        let subscription = self.store.new_subscriber(session_id);
        let subscriber_id = subscription.id;

        let handle = tokio::spawn(consume(
            self.store.clone(),
            self.manager.clone(),
            session_id.to_owned(),
            platform.to_owned(),
            subscription,
        ));
        tasks.insert(
            session_id.to_owned(),
            ConsumerEntry {
                handle,
                subscriber_id,
            },
        );
        tracing::info!(session_id, platform, "bridge subscriber started");
    }

    /// Stop consuming events for a session and let the bridge clean up.
    pub async fn unsubscribe(&self, session_id: &str, platform: Option<&str>) {
        let entry = self.tasks.lock().remove(session_id);
        if let Some(entry) = entry {
            entry.handle.abort();
            self.store.remove_subscriber(session_id, entry.subscriber_id);
            tracing::info!(session_id, "bridge subscriber stopped");
        }

        if let Some(platform) = platform {
            if let Some(bridge) = self.manager.get_bridge(platform) {
                bridge.on_session_removed(session_id).await;
            }
        }
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.tasks.lock().contains_key(session_id)
    }
}

async fn consume(
    store: Arc<SessionStore>,
    manager: Arc<BridgeManager>,
    session_id: String,
    platform: String,
    mut subscription: Subscription,
) {
    let Some(bridge) = manager.get_bridge(&platform) else {
        tracing::warn!(session_id, platform, "no bridge for platform, subscriber exiting");
        store.remove_subscriber(&session_id, subscription.id);
        return;
    };

    while let Some(event) = subscription.rx.recv().await {
        if event.payload.is_history() {
            continue;
        }
        route_event(bridge.as_ref(), &session_id, &event.payload).await;
    }
    store.remove_subscriber(&session_id, subscription.id);
}

/// Map one event to the corresponding bridge verbs.
async fn route_event(bridge: &dyn Bridge, session_id: &str, payload: &EventPayload) {
    match payload {
        EventPayload::Output { text, is_final, .. } => {
            // Only the final assistant message of a turn reaches the chat;
            // intermediate steps stay in the log and the UI.
            if *is_final && !text.is_empty() {
                bridge.on_output(session_id, text).await;
            }
        }
        // Duplicate of the per-step finals above.
        EventPayload::OutputFinal { .. } => {}
        EventPayload::PermissionRequest {
            request_id,
            tool_name,
            tool_input,
        } => {
            let request = build_approval_request(request_id, tool_name, tool_input);
            bridge.on_approval_request(session_id, request).await;
        }
        EventPayload::SessionState { state } => match state {
            SessionState::Running => bridge.on_typing(session_id).await,
            SessionState::AwaitingInput => bridge.on_typing_stopped(session_id).await,
            SessionState::Error => {
                bridge.on_typing_stopped(session_id).await;
                bridge.on_status_change(session_id, "error", None).await;
            }
            SessionState::Created | SessionState::Interrupting => {}
        },
        EventPayload::Error { message, .. } => {
            bridge
                .on_status_change(
                    session_id,
                    "error",
                    Some(serde_json::json!({ "message": message })),
                )
                .await;
        }
        EventPayload::InputRequired { .. }
        | EventPayload::Header { .. }
        | EventPayload::Metadata { .. }
        | EventPayload::Heartbeat { .. } => {}
    }
}

/// Build the approval prompt for a permission request.
///
/// Multi-choice questions arrive as an `AskUserQuestion` "tool" with a
/// structured schema; everything else becomes a generic Allow/Deny prompt
/// with the raw tool input as the description.
fn build_approval_request(request_id: &str, tool_name: &str, tool_input: &Value) -> ApprovalRequest {
    if tool_name.starts_with("AskUserQuestion") {
        if let Some(question) = tool_input
            .get("questions")
            .and_then(Value::as_array)
            .and_then(|qs| qs.first())
            .filter(|q| q.is_object())
        {
            let header = question
                .get("header")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("Question");
            let text = question
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();

            let mut labels = Vec::new();
            let mut lines: Vec<String> = Vec::new();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
            if let Some(options) = question.get("options").and_then(Value::as_array) {
                for (i, opt) in options.iter().enumerate() {
                    let Some(label) = opt.get("label").and_then(Value::as_str) else {
                        continue;
                    };
                    let label = label.trim();
                    if label.is_empty() {
                        continue;
                    }
                    labels.push(label.to_string());
                    let description = opt
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim();
                    if description.is_empty() {
                        lines.push(format!("{}. {label}", i + 1));
                    } else {
                        lines.push(format!("{}. {label} - {description}", i + 1));
                    }
                }
            }

            return ApprovalRequest {
                kind: ApprovalKind::Choice,
                request_id: request_id.to_string(),
                title: header.to_string(),
                description: lines.join("\n"),
                options: labels,
            };
        }
    }

    ApprovalRequest {
        kind: ApprovalKind::Permission,
        request_id: request_id.to_string(),
        title: tool_name.to_string(),
        description: if tool_input.is_object() {
            serde_json::to_string(tool_input).unwrap_or_default()
        } else {
            tool_input.to_string()
        },
        options: vec!["Allow".into(), "Deny".into()],
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tether_domain::error::Result;
    use tether_domain::event::OutputKind;
    use tether_domain::session::RepoRef;
    use crate::ThreadInfo;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Output(String),
        Approval(ApprovalRequest),
        Status(String),
        Typing,
        TypingStopped,
        Removed,
    }

    #[derive(Default)]
    struct MockBridge {
        calls: Mutex<Vec<Call>>,
    }

    impl MockBridge {
        fn snapshot(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Bridge for MockBridge {
        async fn on_output(&self, _sid: &str, text: &str) {
            self.calls.lock().push(Call::Output(text.to_string()));
        }
        async fn on_approval_request(&self, _sid: &str, request: ApprovalRequest) {
            self.calls.lock().push(Call::Approval(request));
        }
        async fn on_status_change(&self, _sid: &str, status: &str, _details: Option<Value>) {
            self.calls.lock().push(Call::Status(status.to_string()));
        }
        async fn on_typing(&self, _sid: &str) {
            self.calls.lock().push(Call::Typing);
        }
        async fn on_typing_stopped(&self, _sid: &str) {
            self.calls.lock().push(Call::TypingStopped);
        }
        async fn on_session_removed(&self, _sid: &str) {
            self.calls.lock().push(Call::Removed);
        }
        async fn create_thread(&self, session_id: &str, _name: &str) -> Result<ThreadInfo> {
            Ok(ThreadInfo {
                thread_id: format!("thread-{session_id}"),
                platform: "mock".into(),
            })
        }
    }

    struct Rig {
        _dir: TempDir,
        store: Arc<SessionStore>,
        bridge: Arc<MockBridge>,
        subscriber: BridgeSubscriber,
        session_id: String,
    }

    fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()).unwrap());
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();

        let bridge = Arc::new(MockBridge::default());
        let manager = Arc::new(BridgeManager::new());
        manager.register_bridge("mock", bridge.clone());

        let subscriber = BridgeSubscriber::new(store.clone(), manager);
        Rig {
            _dir: dir,
            store,
            bridge,
            subscriber,
            session_id: session.id,
        }
    }

    fn output(text: &str, kind: OutputKind, is_final: bool, is_history: Option<bool>) -> EventPayload {
        EventPayload::Output {
            text: text.into(),
            kind,
            is_final,
            is_history,
        }
    }

    async fn wait_for_call(bridge: &MockBridge, pred: impl Fn(&[Call]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&bridge.snapshot()) {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out; calls = {:?}", bridge.snapshot());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn final_output_reaches_the_bridge() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");
        r.store
            .append_event(&r.session_id, output("hello", OutputKind::Final, true, None))
            .unwrap();

        wait_for_call(&r.bridge, |c| c.contains(&Call::Output("hello".into()))).await;
    }

    #[tokio::test]
    async fn steps_history_and_turn_blobs_are_filtered() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");

        r.store
            .append_event(&r.session_id, output("step", OutputKind::Step, false, None))
            .unwrap();
        r.store
            .append_event(
                &r.session_id,
                output("old", OutputKind::Final, true, Some(true)),
            )
            .unwrap();
        r.store
            .append_event(
                &r.session_id,
                EventPayload::OutputFinal {
                    text: "blob".into(),
                    is_history: None,
                },
            )
            .unwrap();
        // Marker event so we know the consumer has drained the others.
        r.store
            .append_event(&r.session_id, output("marker", OutputKind::Final, true, None))
            .unwrap();

        wait_for_call(&r.bridge, |c| c.contains(&Call::Output("marker".into()))).await;
        assert_eq!(r.bridge.snapshot(), vec![Call::Output("marker".into())]);
    }

    #[tokio::test]
    async fn ask_user_question_becomes_a_choice_request() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");

        let tool_input = serde_json::json!({
            "questions": [{
                "header": "Pick",
                "question": "Which?",
                "options": [
                    {"label": "A", "description": "first"},
                    {"label": "B"},
                ],
            }],
        });
        r.store
            .append_event(
                &r.session_id,
                EventPayload::PermissionRequest {
                    request_id: "req_1".into(),
                    tool_name: "AskUserQuestion".into(),
                    tool_input,
                },
            )
            .unwrap();

        wait_for_call(&r.bridge, |c| {
            c.iter().any(|call| matches!(call, Call::Approval(_)))
        })
        .await;

        let calls = r.bridge.snapshot();
        let Call::Approval(request) = &calls[0] else {
            panic!("expected approval, got {calls:?}");
        };
        assert_eq!(request.kind, ApprovalKind::Choice);
        assert_eq!(request.title, "Pick");
        assert_eq!(request.options, vec!["A".to_string(), "B".to_string()]);
        assert!(request.description.contains("1. A - first"));
        assert!(request.description.contains("2. B"));
    }

    #[tokio::test]
    async fn generic_permission_becomes_allow_deny() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");

        r.store
            .append_event(
                &r.session_id,
                EventPayload::PermissionRequest {
                    request_id: "req_2".into(),
                    tool_name: "bash".into(),
                    tool_input: serde_json::json!({"command": "rm -rf /"}),
                },
            )
            .unwrap();

        wait_for_call(&r.bridge, |c| {
            c.iter().any(|call| matches!(call, Call::Approval(_)))
        })
        .await;

        let calls = r.bridge.snapshot();
        let Call::Approval(request) = &calls[0] else {
            panic!("expected approval");
        };
        assert_eq!(request.kind, ApprovalKind::Permission);
        assert_eq!(request.title, "bash");
        assert_eq!(request.options, vec!["Allow".to_string(), "Deny".to_string()]);
        assert!(request.description.contains("rm -rf /"));
    }

    #[tokio::test]
    async fn session_states_map_to_typing_verbs() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");

        for state in [
            SessionState::Running,
            SessionState::AwaitingInput,
            SessionState::Error,
        ] {
            r.store
                .append_event(&r.session_id, EventPayload::SessionState { state })
                .unwrap();
        }

        wait_for_call(&r.bridge, |c| c.len() >= 4).await;
        assert_eq!(
            r.bridge.snapshot(),
            vec![
                Call::Typing,
                Call::TypingStopped,
                Call::TypingStopped,
                Call::Status("error".into()),
            ]
        );
    }

    #[tokio::test]
    async fn error_events_become_status_changes() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");
        r.store
            .append_event(
                &r.session_id,
                EventPayload::Error {
                    code: "RUNNER_ERROR".into(),
                    message: "boom".into(),
                },
            )
            .unwrap();
        wait_for_call(&r.bridge, |c| c.contains(&Call::Status("error".into()))).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_consumption_and_notifies_bridge() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");
        assert!(r.subscriber.is_subscribed(&r.session_id));

        r.subscriber.unsubscribe(&r.session_id, Some("mock")).await;
        assert!(!r.subscriber.is_subscribed(&r.session_id));
        assert_eq!(r.store.subscriber_count(&r.session_id), 0);
        assert!(r.bridge.snapshot().contains(&Call::Removed));

        // Events after unsubscribe never reach the bridge.
        r.store
            .append_event(&r.session_id, output("late", OutputKind::Final, true, None))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!r.bridge.snapshot().contains(&Call::Output("late".into())));
    }

    #[tokio::test]
    async fn subscribe_twice_is_a_noop() {
        let r = rig();
        r.subscriber.subscribe(&r.session_id, "mock");
        r.subscriber.subscribe(&r.session_id, "mock");
        assert_eq!(r.store.subscriber_count(&r.session_id), 1);
    }
}
