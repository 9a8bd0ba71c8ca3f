//! Session metadata and lifecycle states.
//!
//! A [`Session`] is the durable row tracked by the store: lifecycle state,
//! timestamps, runner metadata, working directory, and an optional chat
//! platform binding.  Timestamps are ISO-8601 UTC strings with second
//! precision so they round-trip byte-identically through the store.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Maximum length of a session display name.
pub const SESSION_NAME_MAX: usize = 80;

/// Prefix for generated session ids.
pub const SESSION_ID_PREFIX: &str = "sess_";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle states for a supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Running,
    AwaitingInput,
    Interrupting,
    Error,
}

impl SessionState {
    /// The wire/storage name of the state (e.g. `"AWAITING_INPUT"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Running => "RUNNING",
            SessionState::AwaitingInput => "AWAITING_INPUT",
            SessionState::Interrupting => "INTERRUPTING",
            SessionState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference to a repository target (path or URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl RepoRef {
    pub fn path(value: impl Into<String>) -> Self {
        Self {
            kind: "path".into(),
            value: value.into(),
        }
    }
}

/// Metadata describing an external agent whose session was attached for
/// observation (name/type/icon/workspace as reported by the rollout file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalAgent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

/// A supervised agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub repo_ref: RepoRef,
    pub state: SessionState,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    pub last_activity_at: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Latest runner banner line (not written to the event log).
    #[serde(default)]
    pub runner_header: Option<String>,
    #[serde(default)]
    pub runner_type: Option<String>,
    /// Backend-side session id; globally unique when set.
    #[serde(default)]
    pub runner_session_id: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub directory_has_git: bool,
    /// Whether the working directory was provisioned by the agent itself.
    #[serde(default)]
    pub workdir_managed: bool,
    /// Approval mode: 0 interactive, 1 auto-approve edits, 2 bypass all.
    #[serde(default)]
    pub approval_mode: Option<u8>,
    /// Backend adapter name; immutable after creation.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub external_agent: Option<ExternalAgent>,
    /// Chat platform binding ("telegram" | "slack" | "discord").
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub platform_thread_id: Option<String>,
}

impl Session {
    /// Build a fresh session in CREATED state.
    pub fn new(id: String, repo_ref: RepoRef) -> Self {
        let ts = now_ts();
        Self {
            id,
            repo_ref,
            state: SessionState::Created,
            name: None,
            created_at: ts.clone(),
            started_at: None,
            ended_at: None,
            last_activity_at: ts,
            exit_code: None,
            runner_header: None,
            runner_type: None,
            runner_session_id: None,
            directory: None,
            directory_has_git: false,
            workdir_managed: false,
            approval_mode: None,
            adapter: None,
            external_agent: None,
            platform: None,
            platform_thread_id: None,
        }
    }
}

/// Current timestamp in the canonical session format
/// (`2026-01-31T08:15:00Z`, second precision).
pub fn now_ts() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_to_screaming_snake() {
        let json = serde_json::to_string(&SessionState::AwaitingInput).unwrap();
        assert_eq!(json, "\"AWAITING_INPUT\"");
        let back: SessionState = serde_json::from_str("\"INTERRUPTING\"").unwrap();
        assert_eq!(back, SessionState::Interrupting);
    }

    #[test]
    fn new_session_is_created_with_no_terminal_timestamps() {
        let s = Session::new("sess_abc".into(), RepoRef::path("/tmp/r"));
        assert_eq!(s.state, SessionState::Created);
        assert!(s.started_at.is_none());
        assert!(s.ended_at.is_none());
        assert!(s.exit_code.is_none());
        assert_eq!(s.created_at, s.last_activity_at);
    }

    #[test]
    fn timestamp_has_second_precision() {
        let ts = now_ts();
        // 2026-01-31T08:15:00Z: 20 chars, no fractional seconds.
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
    }
}
