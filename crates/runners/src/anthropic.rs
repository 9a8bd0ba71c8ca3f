//! Claude backend via the Anthropic Messages API.
//!
//! Streams the response: text deltas are forwarded as final output while
//! the completed content blocks, stop reason, and usage are assembled for
//! the conversation loop.  A stop requested mid-stream abandons the call
//! and returns `None` without saving partial content.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tether_domain::error::{Error, Result};
use tether_domain::event::OutputKind;
use tether_domain::message::{ContentBlock, Role, StoredMessage};
use tether_store::SessionStore;

use crate::api_base::{ApiBackend, ApiResponse, BackendContext, TokenUsage, ToolUse};
use crate::prompts::SYSTEM_PROMPT;
use crate::protocol::RunnerHeader;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Runner backend that calls the Anthropic Messages API directly.
pub struct ClaudeBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeBackend {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model,
            max_tokens,
        })
    }

    /// Point the backend at a different API host (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_body(&self, messages: &[StoredMessage]) -> Result<Value> {
        let mut api_messages = Vec::with_capacity(messages.len());
        for message in messages {
            let role = match message.role {
                Role::Assistant => "assistant",
                // Tool results are stored as user messages already; anything
                // else rides as user content.
                Role::User | Role::Tool => "user",
            };
            let blocks = message.blocks()?;
            api_messages.push(json!({
                "role": role,
                "content": serde_json::to_value(&blocks)?,
            }));
        }

        let tools: Vec<Value> = tether_tools::tool_definitions()
            .iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "input_schema": d.input_schema,
                })
            })
            .collect();

        Ok(json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": api_messages,
            "tools": tools,
            "stream": true,
        }))
    }
}

#[async_trait]
impl ApiBackend for ClaudeBackend {
    fn runner_type(&self) -> &'static str {
        "claude_api"
    }

    fn header(&self) -> RunnerHeader {
        RunnerHeader {
            title: "Claude API".into(),
            model: Some(self.model.clone()),
            provider: Some("Anthropic".into()),
            ..Default::default()
        }
    }

    async fn call_api(
        &self,
        ctx: &BackendContext,
        session_id: &str,
        messages: &[StoredMessage],
    ) -> Result<Option<ApiResponse>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(messages)?;

        tracing::debug!(session_id, url = %url, "anthropic stream request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Runner {
                runner_type: "claude_api".into(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let mut resp = resp;
        let mut buffer = String::new();
        let mut state = StreamState::default();

        loop {
            if ctx.store.is_stop_requested(session_id) {
                return Ok(None);
            }
            match resp.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        if let Some(text) = state.apply(&data)? {
                            ctx.events
                                .on_output(session_id, &text, OutputKind::Final, true)
                                .await;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(Error::Http(e.to_string())),
            }
        }

        // Flush a trailing partial event, if any.
        if !buffer.trim().is_empty() {
            buffer.push_str("\n\n");
            for data in drain_data_lines(&mut buffer) {
                if let Some(text) = state.apply(&data)? {
                    ctx.events
                        .on_output(session_id, &text, OutputKind::Final, true)
                        .await;
                }
            }
        }

        Ok(Some(state.finish()))
    }

    fn add_user_message(&self, store: &SessionStore, session_id: &str, text: &str) -> Result<()> {
        store.add_message(session_id, Role::User, &[ContentBlock::text(text)])?;
        Ok(())
    }

    fn save_assistant_response(
        &self,
        store: &SessionStore,
        session_id: &str,
        response: &ApiResponse,
    ) -> Result<()> {
        store.add_message(session_id, Role::Assistant, &response.content)?;
        Ok(())
    }

    fn extract_tool_uses(&self, response: &ApiResponse) -> Vec<ToolUse> {
        response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn add_tool_results(
        &self,
        store: &SessionStore,
        session_id: &str,
        tool_uses: &[ToolUse],
        results: &[String],
    ) -> Result<()> {
        let blocks: Vec<ContentBlock> = tool_uses
            .iter()
            .zip(results)
            .map(|(tool_use, content)| ContentBlock::ToolResult {
                tool_use_id: tool_use.id.clone(),
                content: content.clone(),
            })
            .collect();
        store.add_message(session_id, Role::User, &blocks)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles completed content blocks from Anthropic streaming events.
#[derive(Default)]
struct StreamState {
    content: Vec<ContentBlock>,
    current_text: String,
    /// Active tool_use block: (id, name, partial-json buffer).
    current_tool: Option<(String, String, String)>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamState {
    /// Apply one SSE `data:` payload; returns text to forward as a delta.
    fn apply(&mut self, data: &str) -> Result<Option<String>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            // Tolerate unparseable frames (e.g. ping payloads).
            Err(_) => return Ok(None),
        };
        match v.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                self.input_tokens = v
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            "content_block_start" => {
                if let Some(block) = v.get("content_block") {
                    match block.get("type").and_then(Value::as_str).unwrap_or("") {
                        "text" => self.current_text.clear(),
                        "tool_use" => {
                            let id = block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            let name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            self.current_tool = Some((id, name, String::new()));
                        }
                        _ => {}
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = v.get("delta") {
                    match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                self.current_text.push_str(text);
                                if !text.is_empty() {
                                    return Ok(Some(text.to_string()));
                                }
                            }
                        }
                        "input_json_delta" => {
                            if let (Some(partial), Some(tool)) = (
                                delta.get("partial_json").and_then(Value::as_str),
                                self.current_tool.as_mut(),
                            ) {
                                tool.2.push_str(partial);
                            }
                        }
                        _ => {}
                    }
                }
            }
            "content_block_stop" => {
                if let Some((id, name, args)) = self.current_tool.take() {
                    let input: Value =
                        serde_json::from_str(&args).unwrap_or(Value::Object(Default::default()));
                    self.content.push(ContentBlock::ToolUse { id, name, input });
                } else if !self.current_text.is_empty() {
                    self.content.push(ContentBlock::text(std::mem::take(
                        &mut self.current_text,
                    )));
                }
            }
            "message_delta" => {
                if let Some(reason) = v
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(output) = v
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.output_tokens = output;
                }
            }
            "error" => {
                let message = v
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::Runner {
                    runner_type: "claude_api".into(),
                    message: message.to_string(),
                });
            }
            // ping / message_stop / unknown types.
            _ => {}
        }
        Ok(None)
    }

    fn finish(mut self) -> ApiResponse {
        if !self.current_text.is_empty() {
            self.content
                .push(ContentBlock::text(std::mem::take(&mut self.current_text)));
        }
        ApiResponse {
            content: self.content,
            stop_reason: self.stop_reason,
            usage: Some(TokenUsage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            }),
        }
    }
}

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter.  The buffer
/// is drained in place, leaving any trailing partial event for the next
/// chunk.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}
