//! Runner adapter for an external agent sidecar service.
//!
//! The sidecar executes turns in its own process; this adapter queues
//! prompts over HTTP and reports results through [`RunnerEvents`].  A
//! sidecar that cannot be reached surfaces as `RunnerUnavailable`, which
//! the API edge maps to 503 `AGENT_UNAVAILABLE`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use tether_domain::error::{Error, Result};
use tether_domain::event::OutputKind;
use tether_store::SessionStore;

use crate::protocol::{Runner, RunnerEvents, RunnerHeader};

/// Result of one sidecar turn.
#[derive(Debug, Deserialize, Default)]
struct TurnReply {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    /// Intermediate step lines (tool trace, thinking).
    #[serde(default)]
    steps: Vec<String>,
    /// Final user-visible output of the turn.
    #[serde(default)]
    output: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    error: Option<String>,
}

/// Runner that proxies turns to a sidecar agent service.
pub struct SidecarRunner {
    client: reqwest::Client,
    base_url: String,
    token: String,
    store: Arc<SessionStore>,
    events: Arc<dyn RunnerEvents>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SidecarRunner {
    pub fn new(
        base_url: String,
        token: String,
        store: Arc<SessionStore>,
        events: Arc<dyn RunnerEvents>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            store,
            events,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}{path}", self.base_url));
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        req
    }

    /// Queue text on the sidecar; unreachable hosts become
    /// [`Error::RunnerUnavailable`].
    async fn queue_input(&self, session_id: &str, text: &str) -> Result<()> {
        let resp = self
            .post(&format!("/v1/sessions/{session_id}/input"))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            return Err(Error::Runner {
                runner_type: "sidecar".into(),
                message: format!("sidecar input failed: HTTP {}", resp.status().as_u16()),
            });
        }
        Ok(())
    }

    fn spawn_turn(&self, session_id: &str, emit_header: bool) {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let task_key = session_id.to_owned();
        let session_id = session_id.to_owned();

        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut announce_header = emit_header;

            loop {
                let mut req = client.post(format!("{base_url}/v1/sessions/{session_id}/turn"));
                if !token.is_empty() {
                    req = req.bearer_auth(&token);
                }

                let reply: TurnReply = match req.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        resp.json().await.unwrap_or_default()
                    }
                    Ok(resp) => {
                        events
                            .on_error(
                                &session_id,
                                "RUNNER_ERROR",
                                &format!("sidecar turn failed: HTTP {}", resp.status().as_u16()),
                            )
                            .await;
                        return;
                    }
                    Err(e) => {
                        events
                            .on_error(&session_id, "RUNNER_ERROR", &e.to_string())
                            .await;
                        return;
                    }
                };

                if let Some(message) = reply.error {
                    events
                        .on_error(&session_id, "RUNNER_ERROR", &message)
                        .await;
                    return;
                }

                if announce_header {
                    announce_header = false;
                    events
                        .on_header(
                            &session_id,
                            RunnerHeader {
                                title: "Agent Sidecar".into(),
                                model: reply.model.clone(),
                                provider: Some("sidecar".into()),
                                thread_id: reply.thread_id.clone(),
                                ..Default::default()
                            },
                        )
                        .await;
                }

                for step in &reply.steps {
                    events
                        .on_output(&session_id, step, OutputKind::Step, false)
                        .await;
                }
                if !reply.output.is_empty() {
                    events
                        .on_output(&session_id, &reply.output, OutputKind::Final, true)
                        .await;
                    // The sidecar reports discrete whole turns, so the
                    // turn-level blob is emitted here rather than derived.
                    events.on_output_final(&session_id, &reply.output).await;
                }
                if reply.input_tokens > 0 || reply.output_tokens > 0 {
                    events
                        .on_metadata(
                            &session_id,
                            "tokens",
                            json!({"input": reply.input_tokens, "output": reply.output_tokens}),
                            &format!(
                                "input: {}, output: {}",
                                reply.input_tokens, reply.output_tokens
                            ),
                        )
                        .await;
                }

                if store.is_stop_requested(&session_id) {
                    events
                        .on_heartbeat(&session_id, started.elapsed().as_secs_f64(), true)
                        .await;
                    events.on_exit(&session_id, Some(0)).await;
                    return;
                }

                // Input that arrived while this turn was in flight starts
                // the next one.
                if let Some(text) = store.pop_next_pending_input(&session_id) {
                    let mut req =
                        client.post(format!("{base_url}/v1/sessions/{session_id}/input"));
                    if !token.is_empty() {
                        req = req.bearer_auth(&token);
                    }
                    if let Err(e) = req.json(&json!({ "text": text })).send().await {
                        events
                            .on_error(&session_id, "RUNNER_ERROR", &e.to_string())
                            .await;
                        return;
                    }
                    continue;
                }

                events
                    .on_heartbeat(&session_id, started.elapsed().as_secs_f64(), true)
                    .await;
                events.on_awaiting_input(&session_id).await;
                return;
            }
        });
        self.tasks.lock().insert(task_key, handle);
    }

    fn task_is_live(&self, session_id: &str) -> bool {
        self.tasks
            .lock()
            .get(session_id)
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Runner for SidecarRunner {
    fn runner_type(&self) -> &'static str {
        "sidecar"
    }

    async fn start(&self, session_id: &str, prompt: &str, approval_choice: u8) -> Result<()> {
        self.store.clear_stop_requested(session_id);

        let resp = self
            .post("/v1/sessions")
            .json(&json!({
                "session_id": session_id,
                "prompt": prompt,
                "approval_choice": approval_choice,
            }))
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            return Err(Error::Runner {
                runner_type: "sidecar".into(),
                message: format!("sidecar start failed: HTTP {}", resp.status().as_u16()),
            });
        }

        self.spawn_turn(session_id, true);
        Ok(())
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        // A turn is in flight: park the text in the pending-input queue;
        // the turn task drains it before going idle.
        if self.task_is_live(session_id) {
            self.store.add_pending_input(session_id, text);
            return Ok(());
        }
        self.queue_input(session_id, text).await?;
        self.spawn_turn(session_id, false);
        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<Option<i32>> {
        self.store.request_stop(session_id);

        let _ = self
            .post(&format!("/v1/sessions/{session_id}/stop"))
            .send()
            .await;

        let handle = self.tasks.lock().remove(session_id);
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!(session_id, "sidecar turn task did not stop in time");
                abort.abort();
            }
        }

        self.store.clear_stop_requested(session_id);
        Ok(Some(0))
    }
}

fn unavailable(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::RunnerUnavailable(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}
