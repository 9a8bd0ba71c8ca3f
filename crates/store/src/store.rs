//! The session store.
//!
//! Durable state lives under the data directory: `sessions.json` holds the
//! session rows (flushed on mutation and periodically), and each session
//! gets append-only JSONL files for its messages and its event log.  Event
//! `seq` numbers are allocated and fanned out to subscriber queues under a
//! single lock, so the log and every queue observe the same order.
//!
//! Volatile state (subscriber queues, pending inputs, stop flags, workdir
//! registry, pending permission ids, sync counters) dies with the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_domain::error::{Error, Result};
use tether_domain::event::{EventPayload, EventRecord};
use tether_domain::message::{encode_blocks, ContentBlock, Role, StoredMessage};
use tether_domain::session::{now_ts, RepoRef, Session, SESSION_ID_PREFIX};

/// How many recent final outputs are kept per session (feeds the
/// `input_required` event's `last_output`).
const RECENT_OUTPUT_CAP: usize = 20;

/// On-disk layout revision.  Bumped together with an upgrade step in
/// [`upgrade_layout`]; opening a newer layout than we understand is fatal.
const SCHEMA_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live subscriber queue for one consumer (SSE client or bridge router).
///
/// The queue is unbounded: the emitter never blocks on a slow consumer.
/// Dropping the receiver detaches the subscriber; the sender side is also
/// swept from the fan-out list on the next emit.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<EventRecord>,
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::UnboundedSender<EventRecord>,
}

struct Workdir {
    path: String,
    #[allow(dead_code)]
    managed: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<StoredMessage>>,
    events: HashMap<String, Vec<EventRecord>>,
    subscribers: HashMap<String, Vec<SubscriberHandle>>,
    pending_inputs: HashMap<String, VecDeque<String>>,
    stop_requested: HashSet<String>,
    workdirs: HashMap<String, Workdir>,
    /// session id -> runner session id (values are globally unique).
    runner_session_ids: HashMap<String, String>,
    pending_permissions: HashSet<String>,
    synced_counts: HashMap<String, usize>,
    recent_output: HashMap<String, Vec<String>>,
    next_subscriber_id: u64,
    dirty: bool,
}

/// Durable sessions, messages, and per-session event logs, plus the
/// volatile runtime registries the conversation loop and routers use.
pub struct SessionStore {
    data_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl SessionStore {
    /// Open (or create) the store under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir.join("messages"))?;
        std::fs::create_dir_all(data_dir.join("events"))?;
        upgrade_layout(data_dir)?;

        let sessions_path = data_dir.join("sessions.json");
        let sessions: HashMap<String, Session> = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        let mut messages = HashMap::new();
        let mut events = HashMap::new();
        let mut runner_session_ids = HashMap::new();
        for (id, session) in &sessions {
            messages.insert(
                id.clone(),
                read_jsonl::<StoredMessage>(&data_dir.join("messages").join(format!("{id}.jsonl"))),
            );
            events.insert(
                id.clone(),
                read_jsonl::<EventRecord>(&data_dir.join("events").join(format!("{id}.jsonl"))),
            );
            if let Some(rsid) = &session.runner_session_id {
                runner_session_ids.insert(id.clone(), rsid.clone());
            }
        }

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            inner: Mutex::new(Inner {
                sessions,
                messages,
                events,
                subscribers: HashMap::new(),
                pending_inputs: HashMap::new(),
                stop_requested: HashSet::new(),
                workdirs: HashMap::new(),
                runner_session_ids,
                pending_permissions: HashSet::new(),
                synced_counts: HashMap::new(),
                recent_output: HashMap::new(),
                next_subscriber_id: 1,
                dirty: false,
            }),
        })
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Create a new session in CREATED state and persist it.
    pub fn create_session(&self, repo_ref: RepoRef) -> Result<Session> {
        let id = format!("{SESSION_ID_PREFIX}{}", uuid::Uuid::new_v4().as_simple());
        let session = Session::new(id.clone(), repo_ref);
        {
            let mut inner = self.inner.lock();
            inner.sessions.insert(id.clone(), session.clone());
            inner.messages.insert(id.clone(), Vec::new());
            inner.events.insert(id, Vec::new());
            inner.dirty = true;
        }
        self.flush()?;
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Persist an updated session row.  Unknown ids are ignored (the
    /// session was deleted underneath a concurrent writer).
    pub fn update_session(&self, session: &Session) {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&session.id) {
            inner.sessions.insert(session.id.clone(), session.clone());
            inner.dirty = true;
        }
    }

    /// Delete a session and everything attached to it (messages, event log,
    /// runtime registries).  Returns whether the session existed.
    pub fn delete_session(&self, session_id: &str) -> bool {
        let existed = {
            let mut inner = self.inner.lock();
            let existed = inner.sessions.remove(session_id).is_some();
            inner.messages.remove(session_id);
            inner.events.remove(session_id);
            inner.subscribers.remove(session_id);
            inner.pending_inputs.remove(session_id);
            inner.stop_requested.remove(session_id);
            inner.workdirs.remove(session_id);
            inner.runner_session_ids.remove(session_id);
            inner.synced_counts.remove(session_id);
            inner.recent_output.remove(session_id);
            if existed {
                inner.dirty = true;
            }
            existed
        };
        if existed {
            let _ = std::fs::remove_file(self.messages_path(session_id));
            let _ = std::fs::remove_file(self.events_path(session_id));
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "session flush after delete failed");
            }
        }
        existed
    }

    /// Remove sessions idle longer than `retention_days`.  Returns how many
    /// were deleted.
    pub fn prune_sessions(&self, retention_days: i64) -> usize {
        if retention_days <= 0 {
            return 0;
        }
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let stale: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| {
                    parse_ts(&s.last_activity_at)
                        .map(|t| t < cutoff.naive_utc())
                        .unwrap_or(false)
                })
                .map(|s| s.id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in stale {
            if self.delete_session(&id) {
                removed += 1;
            }
        }
        removed
    }

    // ── Messages ───────────────────────────────────────────────────

    /// Append a message; `seq` is per-session monotonic starting at 1.
    pub fn add_message(
        &self,
        session_id: &str,
        role: Role,
        blocks: &[ContentBlock],
    ) -> Result<StoredMessage> {
        let message = {
            let mut inner = self.inner.lock();
            if !inner.sessions.contains_key(session_id) {
                return Err(Error::Store(format!("unknown session: {session_id}")));
            }
            let list = inner.messages.entry(session_id.to_owned()).or_default();
            let message = StoredMessage {
                id: format!("msg_{}", uuid::Uuid::new_v4().as_simple()),
                session_id: session_id.to_owned(),
                role,
                content: encode_blocks(blocks),
                seq: list.len() as u64 + 1,
                created_at: now_ts(),
            };
            list.push(message.clone());
            message
        };
        append_jsonl(&self.messages_path(session_id), &message)?;
        Ok(message)
    }

    pub fn get_messages(&self, session_id: &str) -> Vec<StoredMessage> {
        self.inner
            .lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_message_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .messages
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ── Event log + fan-out ────────────────────────────────────────

    /// Emit an event: allocate the next `seq`, append to the durable log,
    /// and push the same record to every live subscriber queue.
    ///
    /// Seq allocation, log append, and fan-out happen under one lock so the
    /// log and every queue observe identical order.
    pub fn append_event(&self, session_id: &str, payload: EventPayload) -> Result<EventRecord> {
        let record = {
            let mut inner = self.inner.lock();
            if !inner.sessions.contains_key(session_id) {
                return Err(Error::Store(format!("unknown session: {session_id}")));
            }
            let log = inner.events.entry(session_id.to_owned()).or_default();
            let record = EventRecord {
                seq: log.last().map(|e| e.seq).unwrap_or(0) + 1,
                payload,
                created_at: now_ts(),
            };
            log.push(record.clone());
            if let Some(subs) = inner.subscribers.get_mut(session_id) {
                subs.retain(|s| s.tx.send(record.clone()).is_ok());
            }
            record
        };
        append_jsonl(&self.events_path(session_id), &record)?;
        Ok(record)
    }

    /// Read stored events with `seq > since_seq`, up to `limit`.
    pub fn read_event_log(
        &self,
        session_id: &str,
        since_seq: u64,
        limit: Option<usize>,
    ) -> Vec<EventRecord> {
        let inner = self.inner.lock();
        let Some(log) = inner.events.get(session_id) else {
            return Vec::new();
        };
        let iter = log.iter().filter(|e| e.seq > since_seq).cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn event_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .events
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Register a subscriber queue.  The queue is visible to the emitter
    /// before this returns, so an event emitted afterwards is guaranteed to
    /// be delivered.
    pub fn new_subscriber(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner
            .subscribers
            .entry(session_id.to_owned())
            .or_default()
            .push(SubscriberHandle { id, tx });
        Subscription { id, rx }
    }

    pub fn remove_subscriber(&self, session_id: &str, subscriber_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(session_id) {
            subs.retain(|s| s.id != subscriber_id);
            if subs.is_empty() {
                inner.subscribers.remove(session_id);
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ── Workdir registry ───────────────────────────────────────────

    pub fn set_workdir(&self, session_id: &str, path: &str, managed: bool) {
        let mut inner = self.inner.lock();
        inner.workdirs.insert(
            session_id.to_owned(),
            Workdir {
                path: path.to_owned(),
                managed,
            },
        );
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.directory = Some(path.to_owned());
            session.workdir_managed = managed;
            inner.dirty = true;
        }
    }

    pub fn get_workdir(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .workdirs
            .get(session_id)
            .map(|w| w.path.clone())
            .or_else(|| {
                inner
                    .sessions
                    .get(session_id)
                    .and_then(|s| s.directory.clone())
            })
    }

    // ── Pending input queue ────────────────────────────────────────

    pub fn add_pending_input(&self, session_id: &str, text: &str) {
        self.inner
            .lock()
            .pending_inputs
            .entry(session_id.to_owned())
            .or_default()
            .push_back(text.to_owned());
    }

    pub fn pop_next_pending_input(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .pending_inputs
            .get_mut(session_id)?
            .pop_front()
    }

    // ── Stop flags ─────────────────────────────────────────────────

    pub fn request_stop(&self, session_id: &str) {
        self.inner.lock().stop_requested.insert(session_id.to_owned());
    }

    pub fn is_stop_requested(&self, session_id: &str) -> bool {
        self.inner.lock().stop_requested.contains(session_id)
    }

    pub fn clear_stop_requested(&self, session_id: &str) {
        self.inner.lock().stop_requested.remove(session_id);
    }

    // ── Runner session ids ─────────────────────────────────────────

    /// Record the backend-side session id.  Values are globally unique;
    /// binding a value already held by another session is an error.
    pub fn set_runner_session_id(&self, session_id: &str, runner_session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some((other, _)) = inner
            .runner_session_ids
            .iter()
            .find(|(sid, rsid)| rsid.as_str() == runner_session_id && sid.as_str() != session_id)
        {
            return Err(Error::Store(format!(
                "runner session id {runner_session_id} already bound to {other}"
            )));
        }
        inner
            .runner_session_ids
            .insert(session_id.to_owned(), runner_session_id.to_owned());
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.runner_session_id = Some(runner_session_id.to_owned());
            inner.dirty = true;
        }
        Ok(())
    }

    pub fn get_runner_session_id(&self, session_id: &str) -> Option<String> {
        self.inner.lock().runner_session_ids.get(session_id).cloned()
    }

    pub fn clear_runner_session_id(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        inner.runner_session_ids.remove(session_id);
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.runner_session_id = None;
            inner.dirty = true;
        }
    }

    /// Find the session currently bound to a runner session id.
    pub fn find_by_runner_session_id(&self, runner_session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .runner_session_ids
            .iter()
            .find(|(_, rsid)| rsid.as_str() == runner_session_id)
            .map(|(sid, _)| sid.clone())
    }

    // ── Pending permission requests ────────────────────────────────

    pub fn add_pending_permission(&self, request_id: &str) {
        self.inner
            .lock()
            .pending_permissions
            .insert(request_id.to_owned());
    }

    pub fn resolve_pending_permission(&self, request_id: &str) -> bool {
        self.inner.lock().pending_permissions.remove(request_id)
    }

    pub fn is_pending_permission(&self, request_id: &str) -> bool {
        self.inner.lock().pending_permissions.contains(request_id)
    }

    // ── Sync counters (external sessions) ──────────────────────────

    pub fn get_synced_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .synced_counts
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_synced_count(&self, session_id: &str, count: usize) {
        self.inner
            .lock()
            .synced_counts
            .insert(session_id.to_owned(), count);
    }

    // ── Recent output ──────────────────────────────────────────────

    pub fn push_recent_output(&self, session_id: &str, text: &str) {
        let mut inner = self.inner.lock();
        let recent = inner.recent_output.entry(session_id.to_owned()).or_default();
        recent.push(text.to_owned());
        if recent.len() > RECENT_OUTPUT_CAP {
            let excess = recent.len() - RECENT_OUTPUT_CAP;
            recent.drain(..excess);
        }
    }

    pub fn last_recent_output(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .recent_output
            .get(session_id)
            .and_then(|v| v.last().cloned())
    }

    /// Drain and join the recent final output of the current turn.
    pub fn take_recent_output(&self, session_id: &str) -> Option<String> {
        let joined = self
            .inner
            .lock()
            .recent_output
            .remove(session_id)
            .map(|v| v.join(""));
        joined.filter(|s| !s.is_empty())
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Write `sessions.json` if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            serde_json::to_string_pretty(&inner.sessions)?
        };
        std::fs::write(self.data_dir.join("sessions.json"), snapshot)?;
        Ok(())
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("messages").join(format!("{session_id}.jsonl"))
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("events").join(format!("{session_id}.jsonl"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bring an existing data directory up to the current layout.
///
/// `meta.json` records the layout revision.  A missing file means either a
/// fresh directory or a pre-versioning one; both are stamped as current
/// (revision 1 is the first versioned layout).  Upgrade steps go here as
/// the layout evolves, applied in order.
fn upgrade_layout(data_dir: &Path) -> Result<()> {
    let meta_path = data_dir.join("meta.json");
    let on_disk: u32 = std::fs::read_to_string(&meta_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.get("schema").and_then(|s| s.as_u64()))
        .map(|v| v as u32)
        .unwrap_or(0);

    if on_disk > SCHEMA_VERSION {
        return Err(Error::Store(format!(
            "data dir uses layout {on_disk}, this build understands up to {SCHEMA_VERSION}"
        )));
    }
    if on_disk < SCHEMA_VERSION {
        std::fs::write(
            &meta_path,
            serde_json::to_string_pretty(&serde_json::json!({ "schema": SCHEMA_VERSION }))?,
        )?;
    }
    Ok(())
}

fn parse_ts(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ").ok()
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed line");
            }
        }
    }
    items
}

fn append_jsonl<T: serde::Serialize>(path: &Path, item: &T) -> Result<()> {
    let mut line = serde_json::to_string(item)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tether_domain::session::SessionState;
    use tempfile::TempDir;

    fn fresh_store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = SessionStore::new(dir.path()).expect("store");
        (dir, store)
    }

    fn heartbeat(elapsed_s: f64) -> EventPayload {
        EventPayload::Heartbeat {
            elapsed_s,
            done: false,
        }
    }

    #[test]
    fn create_session_starts_in_created_state() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        assert!(session.id.starts_with("sess_"));
        assert_eq!(session.state, SessionState::Created);
        assert!(session.started_at.is_none());
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn get_and_update_session() {
        let (_dir, store) = fresh_store();
        let mut session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        session.name = Some("Updated Name".into());
        session.state = SessionState::Running;
        store.update_session(&session);

        let got = store.get_session(&session.id).unwrap();
        assert_eq!(got.name.as_deref(), Some("Updated Name"));
        assert_eq!(got.state, SessionState::Running);
        assert!(store.get_session("nonexistent").is_none());
    }

    #[test]
    fn delete_session_cascades() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        store
            .add_message(&session.id, Role::User, &[ContentBlock::text("hi")])
            .unwrap();
        store.append_event(&session.id, heartbeat(1.0)).unwrap();

        assert!(store.delete_session(&session.id));
        assert!(store.get_session(&session.id).is_none());
        assert_eq!(store.get_message_count(&session.id), 0);
        assert_eq!(store.event_count(&session.id), 0);
        assert!(!store.delete_session(&session.id));
    }

    #[test]
    fn seq_is_monotonic_and_gap_free_from_one() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        for i in 1..=5u64 {
            let record = store.append_event(&session.id, heartbeat(i as f64)).unwrap();
            assert_eq!(record.seq, i);
        }
        let log = store.read_event_log(&session.id, 0, None);
        for pair in log.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
    }

    #[test]
    fn seq_isolated_per_session() {
        let (_dir, store) = fresh_store();
        let a = store.create_session(RepoRef::path("/tmp/a")).unwrap();
        let b = store.create_session(RepoRef::path("/tmp/b")).unwrap();
        store.append_event(&a.id, heartbeat(1.0)).unwrap();
        store.append_event(&a.id, heartbeat(2.0)).unwrap();
        let third = store.append_event(&a.id, heartbeat(3.0)).unwrap();
        let first_b = store.append_event(&b.id, heartbeat(1.0)).unwrap();
        assert_eq!(third.seq, 3);
        assert_eq!(first_b.seq, 1);
    }

    #[test]
    fn read_event_log_honors_since_and_limit() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        for i in 1..=10u64 {
            store.append_event(&session.id, heartbeat(i as f64)).unwrap();
        }
        let events = store.read_event_log(&session.id, 5, Some(500));
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);

        let limited = store.read_event_log(&session.id, 0, Some(3));
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[2].seq, 3);
    }

    #[tokio::test]
    async fn subscriber_registered_before_emit_observes_the_event() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();

        let mut sub = store.new_subscriber(&session.id);
        let emitted = store.append_event(&session.id, heartbeat(1.0)).unwrap();

        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received, emitted);
    }

    #[tokio::test]
    async fn queue_delivery_is_fifo_and_matches_log_order() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        let mut sub = store.new_subscriber(&session.id);
        for i in 1..=4u64 {
            store.append_event(&session.id, heartbeat(i as f64)).unwrap();
        }
        for expected in 1..=4u64 {
            assert_eq!(sub.rx.recv().await.unwrap().seq, expected);
        }
    }

    #[test]
    fn dropped_subscriber_is_swept_on_next_emit() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        let sub = store.new_subscriber(&session.id);
        assert_eq!(store.subscriber_count(&session.id), 1);
        drop(sub);
        store.append_event(&session.id, heartbeat(1.0)).unwrap();
        assert_eq!(store.subscriber_count(&session.id), 0);
    }

    #[test]
    fn remove_subscriber_detaches_only_that_queue() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        let a = store.new_subscriber(&session.id);
        let _b = store.new_subscriber(&session.id);
        store.remove_subscriber(&session.id, a.id);
        assert_eq!(store.subscriber_count(&session.id), 1);
    }

    #[test]
    fn pending_inputs_are_fifo() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        store.add_pending_input(&session.id, "input1");
        store.add_pending_input(&session.id, "input2");
        assert_eq!(store.pop_next_pending_input(&session.id).as_deref(), Some("input1"));
        assert_eq!(store.pop_next_pending_input(&session.id).as_deref(), Some("input2"));
        assert_eq!(store.pop_next_pending_input(&session.id), None);
    }

    #[test]
    fn stop_flag_lifecycle() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        assert!(!store.is_stop_requested(&session.id));
        store.request_stop(&session.id);
        assert!(store.is_stop_requested(&session.id));
        store.clear_stop_requested(&session.id);
        assert!(!store.is_stop_requested(&session.id));
    }

    #[test]
    fn runner_session_id_is_globally_unique() {
        let (_dir, store) = fresh_store();
        let a = store.create_session(RepoRef::path("/tmp/a")).unwrap();
        let b = store.create_session(RepoRef::path("/tmp/b")).unwrap();

        store.set_runner_session_id(&a.id, "runner_123").unwrap();
        assert_eq!(
            store.get_runner_session_id(&a.id).as_deref(),
            Some("runner_123")
        );
        assert!(store.set_runner_session_id(&b.id, "runner_123").is_err());
        // Rebinding the same session is fine.
        assert!(store.set_runner_session_id(&a.id, "runner_123").is_ok());

        store.clear_runner_session_id(&a.id);
        assert!(store.get_runner_session_id(&a.id).is_none());
        assert!(store.set_runner_session_id(&b.id, "runner_123").is_ok());
    }

    #[test]
    fn workdir_registry() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        assert!(store.get_workdir(&session.id).is_none());
        store.set_workdir(&session.id, "/tmp/r", false);
        assert_eq!(store.get_workdir(&session.id).as_deref(), Some("/tmp/r"));
        let row = store.get_session(&session.id).unwrap();
        assert_eq!(row.directory.as_deref(), Some("/tmp/r"));
    }

    #[test]
    fn pending_permissions_set() {
        let (_dir, store) = fresh_store();
        store.add_pending_permission("req_1");
        assert!(store.is_pending_permission("req_1"));
        assert!(store.resolve_pending_permission("req_1"));
        assert!(!store.is_pending_permission("req_1"));
        assert!(!store.resolve_pending_permission("req_1"));
    }

    #[test]
    fn messages_have_monotonic_seq_and_round_trip() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        let m1 = store
            .add_message(&session.id, Role::User, &[ContentBlock::text("hi")])
            .unwrap();
        let m2 = store
            .add_message(&session.id, Role::Assistant, &[ContentBlock::text("hello")])
            .unwrap();
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
        let messages = store.get_messages(&session.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].blocks().unwrap(), vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn store_reloads_durable_state_from_disk() {
        let dir = TempDir::new().unwrap();
        let session_id = {
            let store = SessionStore::new(dir.path()).unwrap();
            let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
            store
                .add_message(&session.id, Role::User, &[ContentBlock::text("hi")])
                .unwrap();
            store.append_event(&session.id, heartbeat(1.0)).unwrap();
            store.append_event(&session.id, heartbeat(2.0)).unwrap();
            store.flush().unwrap();
            session.id
        };

        let reopened = SessionStore::new(dir.path()).unwrap();
        assert!(reopened.get_session(&session_id).is_some());
        assert_eq!(reopened.get_message_count(&session_id), 1);
        assert_eq!(reopened.event_count(&session_id), 2);
        // Seq continues after the last persisted record.
        let next = reopened.append_event(&session_id, heartbeat(3.0)).unwrap();
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn prune_removes_only_stale_sessions() {
        let (_dir, store) = fresh_store();
        let stale = store.create_session(RepoRef::path("/tmp/old")).unwrap();
        let fresh = store.create_session(RepoRef::path("/tmp/new")).unwrap();

        let mut row = store.get_session(&stale.id).unwrap();
        row.last_activity_at = "2020-01-01T00:00:00Z".into();
        store.update_session(&row);

        let removed = store.prune_sessions(7);
        assert_eq!(removed, 1);
        assert!(store.get_session(&stale.id).is_none());
        assert!(store.get_session(&fresh.id).is_some());
    }

    #[test]
    fn recent_output_tracks_last_and_drains() {
        let (_dir, store) = fresh_store();
        let session = store.create_session(RepoRef::path("/tmp/r")).unwrap();
        assert!(store.take_recent_output(&session.id).is_none());
        store.push_recent_output(&session.id, "hel");
        store.push_recent_output(&session.id, "lo");
        assert_eq!(store.last_recent_output(&session.id).as_deref(), Some("lo"));
        assert_eq!(store.take_recent_output(&session.id).as_deref(), Some("hello"));
        assert!(store.last_recent_output(&session.id).is_none());
    }
}
