//! Runner adapter contract and event callbacks.

use async_trait::async_trait;
use serde_json::Value;

use tether_domain::error::Result;
use tether_domain::event::OutputKind;

/// Structured banner a runner reports when a backend session opens.
#[derive(Debug, Clone, Default)]
pub struct RunnerHeader {
    pub title: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub sandbox: Option<String>,
    pub approval: Option<String>,
    /// Backend-side session id, when the backend has one.
    pub thread_id: Option<String>,
}

/// Callbacks invoked by runners to report activity and terminal state.
///
/// The control plane implements this to translate callbacks into state
/// transitions and canonical events; runners never touch session state
/// directly.
#[async_trait]
pub trait RunnerEvents: Send + Sync {
    async fn on_output(&self, session_id: &str, text: &str, kind: OutputKind, is_final: bool);

    /// Turn-level concatenated output, reported by backends that deliver
    /// whole turns (the streaming loop derives it instead).
    async fn on_output_final(&self, session_id: &str, text: &str);

    async fn on_header(&self, session_id: &str, header: RunnerHeader);

    async fn on_error(&self, session_id: &str, code: &str, message: &str);

    async fn on_exit(&self, session_id: &str, exit_code: Option<i32>);

    /// The agent finished a turn and is waiting for user input.
    async fn on_awaiting_input(&self, session_id: &str);

    async fn on_metadata(&self, session_id: &str, key: &str, value: Value, raw: &str);

    async fn on_heartbeat(&self, session_id: &str, elapsed_s: f64, done: bool);

    /// A tool approval prompt that must be answered out-of-band.
    async fn on_permission_request(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
    );
}

/// Adapter interface for agent backends.
#[async_trait]
pub trait Runner: Send + Sync {
    /// High-level backend identifier (e.g. `"claude_api"`).
    fn runner_type(&self) -> &'static str;

    /// Emit a header, queue the prompt as a user message, and spawn the
    /// per-session conversation task.
    async fn start(&self, session_id: &str, prompt: &str, approval_choice: u8) -> Result<()>;

    /// Queue a user message; restarts the conversation task when the
    /// previous one exited cleanly.  Empty or whitespace-only text is a
    /// no-op.
    async fn send_input(&self, session_id: &str, text: &str) -> Result<()>;

    /// Request a stop: set the stop flag, cancel the task with a 5-second
    /// grace window, clear the flag.  Returns the exit code (0).
    async fn stop(&self, session_id: &str) -> Result<Option<i32>>;
}
