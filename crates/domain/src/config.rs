//! Environment-driven settings.
//!
//! All agent configuration is read from `TETHER_AGENT_*` environment
//! variables (backend credentials keep their unprefixed external names).
//! `.env` layering: process env wins, then `./.env`, then the user config
//! env file, then built-in defaults.  Files never overwrite variables that
//! are already set.

use std::path::{Path, PathBuf};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly console lines (default).
    Console,
    /// Structured JSON lines.
    Json,
}

/// Resolved agent settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Development mode disables the bearer-token requirement.
    /// Env: `TETHER_AGENT_DEV_MODE`.
    pub dev_mode: bool,
    /// Bearer token for API authentication; empty = allow all.
    /// Env: `TETHER_AGENT_TOKEN`.
    pub token: String,
    /// Host to bind the HTTP server to. Env: `TETHER_AGENT_HOST`.
    pub host: String,
    /// Port to bind the HTTP server to. Env: `TETHER_AGENT_PORT`.
    pub port: u16,
    /// Directory for persistent data (sessions, messages, event logs).
    /// Env: `TETHER_AGENT_DATA_DIR`.
    pub data_dir: PathBuf,
    /// Default runner adapter. Env: `TETHER_AGENT_ADAPTER`.
    pub adapter: String,
    /// Log level filter. Env: `TETHER_AGENT_LOG_LEVEL`.
    pub log_level: String,
    /// Log format. Env: `TETHER_AGENT_LOG_FORMAT` ("console" | "json").
    pub log_format: LogFormat,
    /// Days to retain idle sessions before pruning.
    /// Env: `TETHER_AGENT_SESSION_RETENTION_DAYS`.
    pub session_retention_days: i64,
    /// Seconds of inactivity before a RUNNING session is interrupted;
    /// 0 disables. Env: `TETHER_AGENT_SESSION_IDLE_SECONDS`.
    pub session_idle_seconds: u64,
    /// Claude model for the API runner. Env: `TETHER_AGENT_CLAUDE_MODEL`.
    pub claude_model: String,
    /// Max output tokens for Claude responses.
    /// Env: `TETHER_AGENT_CLAUDE_MAX_TOKENS`.
    pub claude_max_tokens: u32,
    /// Anthropic API key. Env: `ANTHROPIC_API_KEY` (external credential,
    /// no prefix).
    pub anthropic_api_key: String,
    /// Base URL of the agent sidecar service.
    /// Env: `TETHER_AGENT_SIDECAR_URL`.
    pub sidecar_url: String,
    /// Auth token for the sidecar service. Env: `TETHER_AGENT_SIDECAR_TOKEN`.
    pub sidecar_token: String,
}

impl Settings {
    /// Read settings from the current process environment.
    pub fn from_env() -> Self {
        Self {
            dev_mode: env_bool("TETHER_AGENT_DEV_MODE", false),
            token: env_str("TETHER_AGENT_TOKEN", ""),
            host: env_str("TETHER_AGENT_HOST", "0.0.0.0"),
            port: env_int("TETHER_AGENT_PORT", 8787) as u16,
            data_dir: PathBuf::from(env_str("TETHER_AGENT_DATA_DIR", "data")),
            adapter: env_str("TETHER_AGENT_ADAPTER", "claude_api").to_lowercase(),
            log_level: env_str("TETHER_AGENT_LOG_LEVEL", "info"),
            log_format: match env_str("TETHER_AGENT_LOG_FORMAT", "console").as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Console,
            },
            session_retention_days: env_int("TETHER_AGENT_SESSION_RETENTION_DAYS", 7),
            session_idle_seconds: env_int("TETHER_AGENT_SESSION_IDLE_SECONDS", 0).max(0) as u64,
            claude_model: env_str("TETHER_AGENT_CLAUDE_MODEL", "claude-sonnet-4-20250514"),
            claude_max_tokens: env_int("TETHER_AGENT_CLAUDE_MAX_TOKENS", 4096).max(1) as u32,
            anthropic_api_key: env_str("ANTHROPIC_API_KEY", ""),
            sidecar_url: env_str("TETHER_AGENT_SIDECAR_URL", "http://localhost:8788"),
            sidecar_token: env_str("TETHER_AGENT_SIDECAR_TOKEN", ""),
        }
    }

    /// Whether bearer-token auth is enforced.
    pub fn auth_enabled(&self) -> bool {
        !self.dev_mode && !self.token.is_empty()
    }
}

fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => parse_bool(&v).unwrap_or(default),
        _ => default,
    }
}

fn env_int(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// .env layering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load `.env` layers into the process environment.
///
/// Order: `./.env` first, then `$HOME/.config/tether/env`.  A variable is
/// only set when it is absent from the environment, so the process env
/// always wins and earlier files shadow later ones.  Returns how many
/// variables were applied.
pub fn load_env_layers() -> usize {
    let mut applied = 0;
    applied += apply_env_file(Path::new(".env"));
    if let Ok(home) = std::env::var("HOME") {
        applied += apply_env_file(&Path::new(&home).join(".config/tether/env"));
    }
    applied
}

fn apply_env_file(path: &Path) -> usize {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return 0;
    };
    let mut applied = 0;
    for (key, value) in parse_env_lines(&raw) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, &value);
            applied += 1;
        }
    }
    if applied > 0 {
        tracing::debug!(path = %path.display(), applied, "applied env file");
    }
    applied
}

/// Parse `KEY=VALUE` lines.  Comments and blank lines are skipped, a
/// leading `export ` is tolerated, and single/double quotes around the
/// value are stripped.
fn parse_env_lines(raw: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}
