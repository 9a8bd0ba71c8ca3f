//! Conversation messages and content blocks.
//!
//! Messages are stored with their content JSON-encoded as a list of
//! [`ContentBlock`]s, the same block set the Anthropic Messages API uses,
//! which is also the superset the other backends map into.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Encode content blocks into the stored JSON form.
pub fn encode_blocks(blocks: &[ContentBlock]) -> String {
    serde_json::to_string(blocks).unwrap_or_else(|_| "[]".into())
}

/// Join the text of all `Text` blocks, skipping everything else.
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A durable conversation message, ordered per session by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    /// JSON-encoded list of [`ContentBlock`]s.
    pub content: String,
    pub seq: u64,
    pub created_at: String,
}

impl StoredMessage {
    /// Decode the content blocks.
    pub fn blocks(&self) -> Result<Vec<ContentBlock>> {
        Ok(serde_json::from_str(&self.content)?)
    }
}
