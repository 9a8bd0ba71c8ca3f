//! Bridges runner callbacks into state transitions and canonical events.
//!
//! Each callback acquires the per-session lock, so runner tasks never race
//! HTTP handlers on the same session row.  Transition failures inside
//! callbacks are logged and skipped: a runner reporting against a session
//! that moved on must not crash the conversation task.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tether_domain::event::OutputKind;
use tether_domain::lifecycle::{transition, TransitionOptions};
use tether_domain::session::{now_ts, SessionState};
use tether_runners::{RunnerEvents, RunnerHeader};
use tether_store::SessionStore;

use super::emit;
use super::locks::SessionLockMap;

/// The control plane's implementation of [`RunnerEvents`].
pub struct GatewayRunnerEvents {
    store: Arc<SessionStore>,
    locks: Arc<SessionLockMap>,
}

impl GatewayRunnerEvents {
    pub fn new(store: Arc<SessionStore>, locks: Arc<SessionLockMap>) -> Self {
        Self { store, locks }
    }

    fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.store.get_session(session_id) {
            session.last_activity_at = now_ts();
            self.store.update_session(&session);
        }
    }
}

#[async_trait]
impl RunnerEvents for GatewayRunnerEvents {
    async fn on_output(&self, session_id: &str, text: &str, kind: OutputKind, is_final: bool) {
        let _permit = self.locks.acquire(session_id).await;
        let Some(mut session) = self.store.get_session(session_id) else {
            return;
        };
        if kind == OutputKind::Header {
            // Banner text updates the session row and is never logged.
            session.runner_header = Some(text.to_string());
            self.store.update_session(&session);
            return;
        }
        session.last_activity_at = now_ts();
        self.store.update_session(&session);
        if let Err(e) = emit::emit_output(&self.store, session_id, text, kind, is_final, None) {
            tracing::error!(session_id, error = %e, "emit output failed");
        }
    }

    async fn on_output_final(&self, session_id: &str, text: &str) {
        let _permit = self.locks.acquire(session_id).await;
        if self.store.get_session(session_id).is_none() {
            return;
        }
        self.touch(session_id);
        if let Err(e) = emit::emit_output_final(&self.store, session_id, text, None) {
            tracing::error!(session_id, error = %e, "emit output_final failed");
        }
    }

    async fn on_header(&self, session_id: &str, header: RunnerHeader) {
        let _permit = self.locks.acquire(session_id).await;
        let Some(mut session) = self.store.get_session(session_id) else {
            return;
        };
        session.runner_header = Some(header.title.clone());
        self.store.update_session(&session);

        // Capture the backend session id for attach/resume; first write
        // wins so reconnects don't clobber it.
        if let Some(thread_id) = header.thread_id.as_deref() {
            if thread_id != "unknown" && self.store.get_runner_session_id(session_id).is_none() {
                if let Err(e) = self.store.set_runner_session_id(session_id, thread_id) {
                    tracing::warn!(session_id, error = %e, "runner session id not recorded");
                }
            }
        }

        if let Err(e) = emit::emit_header(&self.store, session_id, &header) {
            tracing::error!(session_id, error = %e, "emit header failed");
        }
    }

    async fn on_error(&self, session_id: &str, code: &str, message: &str) {
        let _permit = self.locks.acquire(session_id).await;
        let Some(mut session) = self.store.get_session(session_id) else {
            return;
        };
        if session.state != SessionState::Error {
            let opts = TransitionOptions {
                set_ended_at: true,
                ..Default::default()
            };
            match transition(&mut session, SessionState::Error, opts) {
                Ok(()) => {
                    self.store.update_session(&session);
                    let _ = emit::emit_state(&self.store, &session);
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "error transition rejected");
                }
            }
        }
        if let Err(e) = emit::emit_error(&self.store, session_id, code, message) {
            tracing::error!(session_id, error = %e, "emit error failed");
        }
    }

    async fn on_exit(&self, session_id: &str, exit_code: Option<i32>) {
        let _permit = self.locks.acquire(session_id).await;
        let Some(mut session) = self.store.get_session(session_id) else {
            return;
        };
        // Already idle or terminal; clean exits are handled by the
        // following on_awaiting_input (or the interrupt path).
        if matches!(
            session.state,
            SessionState::AwaitingInput | SessionState::Interrupting | SessionState::Error
        ) {
            return;
        }
        let Some(code) = exit_code else { return };
        if code == 0 {
            return;
        }
        let opts = TransitionOptions {
            set_ended_at: true,
            exit_code: Some(code),
            ..Default::default()
        };
        match transition(&mut session, SessionState::Error, opts) {
            Ok(()) => {
                self.store.update_session(&session);
                let _ = emit::emit_state(&self.store, &session);
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "exit transition rejected");
            }
        }
    }

    async fn on_awaiting_input(&self, session_id: &str) {
        let _permit = self.locks.acquire(session_id).await;
        let Some(mut session) = self.store.get_session(session_id) else {
            return;
        };
        if matches!(
            session.state,
            SessionState::AwaitingInput | SessionState::Error
        ) {
            return;
        }
        match transition(
            &mut session,
            SessionState::AwaitingInput,
            TransitionOptions::default(),
        ) {
            Ok(()) => {
                self.store.update_session(&session);
                let _ = emit::emit_state(&self.store, &session);
                if let Err(e) = emit::emit_input_required(&self.store, session_id) {
                    tracing::error!(session_id, error = %e, "emit input_required failed");
                }
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "awaiting_input transition rejected");
            }
        }
    }

    async fn on_metadata(&self, session_id: &str, key: &str, value: Value, raw: &str) {
        let _permit = self.locks.acquire(session_id).await;
        if self.store.get_session(session_id).is_none() {
            return;
        }
        self.touch(session_id);
        if let Err(e) = emit::emit_metadata(&self.store, session_id, key, value, raw) {
            tracing::error!(session_id, error = %e, "emit metadata failed");
        }
    }

    async fn on_heartbeat(&self, session_id: &str, elapsed_s: f64, done: bool) {
        let _permit = self.locks.acquire(session_id).await;
        if self.store.get_session(session_id).is_none() {
            return;
        }
        self.touch(session_id);
        if let Err(e) = emit::emit_heartbeat(&self.store, session_id, elapsed_s, done) {
            tracing::error!(session_id, error = %e, "emit heartbeat failed");
        }
    }

    async fn on_permission_request(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
    ) {
        let _permit = self.locks.acquire(session_id).await;
        if self.store.get_session(session_id).is_none() {
            return;
        }
        self.touch(session_id);
        if let Err(e) =
            emit::emit_permission_request(&self.store, session_id, request_id, tool_name, tool_input)
        {
            tracing::error!(session_id, error = %e, "emit permission_request failed");
        }
    }
}
