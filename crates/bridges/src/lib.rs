//! Chat-platform bridges.
//!
//! A [`Bridge`] is a platform bot (Telegram, Slack, Discord) the control
//! plane talks to through a small verb set.  The [`BridgeManager`] is the
//! process-wide registry, and the [`BridgeSubscriber`] consumes session
//! events and routes them to the bound bridge.  Concrete bot clients live
//! outside this crate.

mod manager;
mod subscriber;

use async_trait::async_trait;
use serde_json::Value;

use tether_domain::error::Result;

pub use manager::BridgeManager;
pub use subscriber::BridgeSubscriber;

/// What kind of answer an approval prompt expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    /// Pick one of several options.
    Choice,
    /// Allow or deny a tool invocation.
    Permission,
}

/// A tool-approval prompt bubbled out to the user on a chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub kind: ApprovalKind,
    pub request_id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
}

/// A platform thread bound to a session.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub platform: String,
}

/// Verbs a platform bridge must implement.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Deliver a final assistant message.
    async fn on_output(&self, session_id: &str, text: &str);

    /// Surface an approval prompt (choice or allow/deny).
    async fn on_approval_request(&self, session_id: &str, request: ApprovalRequest);

    /// Report a status change (currently only `"error"`).
    async fn on_status_change(&self, session_id: &str, status: &str, details: Option<Value>);

    /// The agent started working.
    async fn on_typing(&self, session_id: &str);

    /// The agent stopped working.
    async fn on_typing_stopped(&self, session_id: &str);

    /// The session was unbound or deleted; clean up platform state.
    async fn on_session_removed(&self, session_id: &str);

    /// Create a platform thread for a session.
    async fn create_thread(&self, session_id: &str, session_name: &str) -> Result<ThreadInfo>;
}
