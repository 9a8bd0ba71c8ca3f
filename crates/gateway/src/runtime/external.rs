//! External (attached) session sync.
//!
//! External agents write rollout files on disk; the format is theirs and
//! versioned, so parsing here is deliberately tolerant: JSONL records with
//! `role` and `text`, anything else skipped.  Sync imports only records
//! beyond the messages already stored, which makes replay idempotent even
//! when the in-memory sync counter was lost to a restart.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use tether_domain::error::{Error, Result};
use tether_domain::event::OutputKind;
use tether_domain::message::{ContentBlock, Role};
use tether_domain::session::Session;
use tether_store::SessionStore;

use super::emit;

/// One record of an external rollout file.
#[derive(Debug, Clone, Deserialize)]
pub struct RolloutRecord {
    pub role: String,
    pub text: String,
}

/// Where an external agent's rollout file lives for an attached session.
pub fn rollout_path(directory: &str, external_id: &str) -> PathBuf {
    Path::new(directory)
        .join(".agent-sessions")
        .join(format!("{external_id}.jsonl"))
}

/// Read a rollout file, skipping malformed lines.
pub fn read_rollout(path: &Path) -> Result<Vec<RolloutRecord>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("rollout file {}: {e}", path.display())))?;
    let mut records = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RolloutRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping rollout line");
            }
        }
    }
    Ok(records)
}

/// Re-scan the rollout file and import messages not yet stored.
///
/// Returns `(synced, total)`: how many records were newly imported and how
/// many the file holds.  Each imported record becomes a stored message and
/// an `output` event flagged `is_history` (assistant text as final output,
/// everything else as a step).
pub fn sync_external_session(store: &SessionStore, session: &Session) -> Result<(usize, usize)> {
    let directory = session
        .directory
        .as_deref()
        .ok_or_else(|| Error::Store("external session has no directory".into()))?;
    let external_id = session
        .runner_session_id
        .as_deref()
        .ok_or_else(|| Error::Store("session has no external id".into()))?;

    let path = rollout_path(directory, external_id);
    let records = if path.exists() {
        read_rollout(&path)?
    } else {
        Vec::new()
    };

    let total = records.len();
    let already = store.get_message_count(&session.id);
    let mut synced = 0;

    for record in records.iter().skip(already) {
        let (role, kind, is_final) = match record.role.as_str() {
            "assistant" => (Role::Assistant, OutputKind::Final, true),
            "tool" => (Role::Tool, OutputKind::Step, false),
            _ => (Role::User, OutputKind::Step, false),
        };
        store.add_message(&session.id, role, &[ContentBlock::text(&record.text)])?;
        emit::emit_output(store, &session.id, &record.text, kind, is_final, Some(true))?;
        synced += 1;
    }

    store.set_synced_count(&session.id, total);
    Ok((synced, total))
}
