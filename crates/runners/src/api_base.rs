//! Generic conversation loop for API-based backends.
//!
//! [`ApiRunner`] owns the per-session task: it drives LLM -> tool -> LLM
//! iteration, runs a 5-second heartbeat alongside, and emits the terminal
//! events when the loop exits.  Backends supply only the four hooks on
//! [`ApiBackend`]: the (streaming) API call, response persistence, tool-use
//! extraction, and tool-result persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_domain::error::Result;
use tether_domain::event::OutputKind;
use tether_domain::message::StoredMessage;
use tether_domain::session::SessionState;
use tether_store::SessionStore;
use tether_tools::ToolExecutor;

use crate::protocol::{Runner, RunnerEvents};

/// Heartbeat cadence while a conversation task runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Grace window for a cancelled task to unwind before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Tool results echoed into step output are truncated to this many chars.
const RESULT_PREVIEW_CHARS: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend hook types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Token usage reported for one API call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Parsed result of one API call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Completed content blocks in the stored message format.
    pub content: Vec<tether_domain::message::ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Shared context handed to backend hooks.
pub struct BackendContext {
    pub store: Arc<SessionStore>,
    pub events: Arc<dyn RunnerEvents>,
}

/// The four per-backend hooks of the conversation loop, plus the header.
#[async_trait]
pub trait ApiBackend: Send + Sync + 'static {
    fn runner_type(&self) -> &'static str;

    fn header(&self) -> crate::protocol::RunnerHeader;

    /// Call the LLM API with the conversation so far.
    ///
    /// Stream mode: implementations may emit partial text through
    /// `ctx.events.on_output(.., OutputKind::Final, true)` as deltas, and
    /// must finally return the completed content blocks with the parsed
    /// stop reason and usage.  Returns `Ok(None)`, without saving partial
    /// content, when a stop was requested mid-stream.
    async fn call_api(
        &self,
        ctx: &BackendContext,
        session_id: &str,
        messages: &[StoredMessage],
    ) -> Result<Option<ApiResponse>>;

    /// Queue a user message in the format the API expects.
    fn add_user_message(&self, store: &SessionStore, session_id: &str, text: &str) -> Result<()>;

    /// Persist the assistant response.
    fn save_assistant_response(
        &self,
        store: &SessionStore,
        session_id: &str,
        response: &ApiResponse,
    ) -> Result<()>;

    /// Extract tool_use blocks from the response content.
    fn extract_tool_uses(&self, response: &ApiResponse) -> Vec<ToolUse>;

    /// Queue tool results for the next API call.
    fn add_tool_results(
        &self,
        store: &SessionStore,
        session_id: &str,
        tool_uses: &[ToolUse],
        results: &[String],
    ) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ApiRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TaskEntry {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Runner for API-style backends: one conversation task per session.
pub struct ApiRunner<B: ApiBackend> {
    backend: Arc<B>,
    store: Arc<SessionStore>,
    executor: ToolExecutor,
    events: Arc<dyn RunnerEvents>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl<B: ApiBackend> ApiRunner<B> {
    pub fn new(
        backend: B,
        store: Arc<SessionStore>,
        executor: ToolExecutor,
        events: Arc<dyn RunnerEvents>,
    ) -> Self {
        Self::from_shared(Arc::new(backend), store, executor, events)
    }

    /// Build from an already-shared backend (lets callers keep a handle).
    pub fn from_shared(
        backend: Arc<B>,
        store: Arc<SessionStore>,
        executor: ToolExecutor,
        events: Arc<dyn RunnerEvents>,
    ) -> Self {
        Self {
            backend,
            store,
            executor,
            events,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_conversation(&self, session_id: &str, emit_header: bool) {
        let cancel = CancellationToken::new();
        let worker = ConversationWorker {
            backend: self.backend.clone(),
            store: self.store.clone(),
            executor: self.executor.clone(),
            events: self.events.clone(),
            session_id: session_id.to_owned(),
            emit_header,
        };
        let handle = tokio::spawn(worker.run(cancel.clone()));
        self.tasks
            .lock()
            .insert(session_id.to_owned(), TaskEntry { handle, cancel });
    }

    fn task_is_live(&self, session_id: &str) -> bool {
        self.tasks
            .lock()
            .get(session_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl<B: ApiBackend> Runner for ApiRunner<B> {
    fn runner_type(&self) -> &'static str {
        self.backend.runner_type()
    }

    async fn start(&self, session_id: &str, prompt: &str, _approval_choice: u8) -> Result<()> {
        self.store.clear_stop_requested(session_id);
        self.tasks.lock().remove(session_id);

        self.backend
            .add_user_message(&self.store, session_id, prompt)?;
        self.spawn_conversation(session_id, true);
        Ok(())
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.backend
            .add_user_message(&self.store, session_id, text)?;
        if !self.task_is_live(session_id) {
            self.store.clear_stop_requested(session_id);
            self.spawn_conversation(session_id, false);
        }
        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<Option<i32>> {
        self.store.request_stop(session_id);

        let entry = self.tasks.lock().remove(session_id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let abort = entry.handle.abort_handle();
            if tokio::time::timeout(STOP_GRACE, entry.handle).await.is_err() {
                tracing::warn!(session_id, "conversation task did not stop in time");
                abort.abort();
            }
        }

        self.store.clear_stop_requested(session_id);
        Ok(Some(0))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConversationWorker<B: ApiBackend> {
    backend: Arc<B>,
    store: Arc<SessionStore>,
    executor: ToolExecutor,
    events: Arc<dyn RunnerEvents>,
    session_id: String,
    emit_header: bool,
}

impl<B: ApiBackend> ConversationWorker<B> {
    async fn run(self, cancel: CancellationToken) {
        if self.emit_header {
            self.events
                .on_header(&self.session_id, self.backend.header())
                .await;
        }

        let started = Instant::now();
        let heartbeat = self.spawn_heartbeat(started);

        // The loop body is raced against cancellation so a stop interrupts
        // waits (API streams, tool subprocesses) at any suspension point;
        // the terminal emissions below run on either path.
        tokio::select! {
            _ = self.loop_body() => {}
            _ = cancel.cancelled() => {
                tracing::info!(session_id = %self.session_id, "conversation cancelled");
            }
        }

        heartbeat.abort();
        let elapsed = started.elapsed().as_secs_f64();
        self.events
            .on_heartbeat(&self.session_id, elapsed, true)
            .await;

        if self.store.is_stop_requested(&self.session_id) {
            self.events.on_exit(&self.session_id, Some(0)).await;
        } else {
            self.events.on_awaiting_input(&self.session_id).await;
        }
    }

    fn spawn_heartbeat(&self, started: Instant) -> JoinHandle<()> {
        let events = self.events.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                let elapsed = started.elapsed().as_secs_f64();
                events.on_heartbeat(&session_id, elapsed, false).await;
            }
        })
    }

    async fn loop_body(&self) {
        let session_id = self.session_id.as_str();
        let ctx = BackendContext {
            store: self.store.clone(),
            events: self.events.clone(),
        };

        loop {
            if self.store.is_stop_requested(session_id) {
                break;
            }
            let Some(session) = self.store.get_session(session_id) else {
                break;
            };
            if session.state != SessionState::Running {
                break;
            }
            let messages = self.store.get_messages(session_id);
            if messages.is_empty() {
                break;
            }

            let response = match self.backend.call_api(&ctx, session_id, &messages).await {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(session_id, error = %e, "conversation failed");
                    self.events
                        .on_error(session_id, "RUNNER_ERROR", &e.to_string())
                        .await;
                    break;
                }
            };

            if let Some(usage) = response.usage {
                self.events
                    .on_metadata(
                        session_id,
                        "tokens",
                        serde_json::json!({
                            "input": usage.input_tokens,
                            "output": usage.output_tokens,
                        }),
                        &format!(
                            "input: {}, output: {}",
                            usage.input_tokens, usage.output_tokens
                        ),
                    )
                    .await;
            }

            if let Err(e) = self
                .backend
                .save_assistant_response(&self.store, session_id, &response)
            {
                self.events
                    .on_error(session_id, "RUNNER_ERROR", &e.to_string())
                    .await;
                break;
            }

            let tool_uses = self.backend.extract_tool_uses(&response);
            if !tool_uses.is_empty() {
                let results = self.execute_and_emit_tools(session_id, &tool_uses).await;
                if let Err(e) =
                    self.backend
                        .add_tool_results(&self.store, session_id, &tool_uses, &results)
                {
                    self.events
                        .on_error(session_id, "RUNNER_ERROR", &e.to_string())
                        .await;
                    break;
                }
                continue;
            }

            match response.stop_reason.as_deref() {
                Some("end_turn") => break,
                Some("max_tokens") => {
                    self.events
                        .on_output(
                            session_id,
                            "\n[max tokens reached]\n",
                            OutputKind::Step,
                            false,
                        )
                        .await;
                    break;
                }
                // Unknown stop reason: do not loop forever.
                _ => break,
            }
        }
    }

    /// Execute tool uses in order, echoing each call and its truncated
    /// result as step output.  Returns the result text per tool use.
    async fn execute_and_emit_tools(&self, session_id: &str, tool_uses: &[ToolUse]) -> Vec<String> {
        let mut results = Vec::with_capacity(tool_uses.len());
        for tool_use in tool_uses {
            let input_json =
                serde_json::to_string(&tool_use.input).unwrap_or_else(|_| "{}".into());
            self.events
                .on_output(
                    session_id,
                    &format!("[tool: {}] {}\n", tool_use.name, input_json),
                    OutputKind::Step,
                    false,
                )
                .await;

            let outcome = self
                .executor
                .execute(session_id, &tool_use.name, &tool_use.input)
                .await;
            let content = outcome.content_for_model();

            self.events
                .on_output(
                    session_id,
                    &format!("[result] {}\n", truncate_chars(&content, RESULT_PREVIEW_CHARS)),
                    OutputKind::Step,
                    false,
                )
                .await;

            results.push(content);
        }
        results
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text_verbatim() {
        assert_eq!(truncate_chars("short", 500), "short");
    }

    #[test]
    fn truncate_appends_ellipsis() {
        let long = "x".repeat(600);
        let out = truncate_chars(&long, 500);
        assert_eq!(out.chars().count(), 503);
        assert!(out.ends_with("..."));
    }
}
