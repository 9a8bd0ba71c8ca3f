//! Typed emit helpers over the store's event log.
//!
//! Each helper builds the canonical payload for one event kind and appends
//! it through [`SessionStore::append_event`], which allocates the seq and
//! fans the record out to subscribers.  Emitter failures are fatal to the
//! calling handler.

use serde_json::Value;

use tether_domain::error::Result;
use tether_domain::event::{EventPayload, EventRecord, OutputKind};
use tether_domain::session::Session;
use tether_runners::RunnerHeader;
use tether_store::SessionStore;

pub fn emit_output(
    store: &SessionStore,
    session_id: &str,
    text: &str,
    kind: OutputKind,
    is_final: bool,
    is_history: Option<bool>,
) -> Result<EventRecord> {
    if is_final && is_history.is_none() {
        store.push_recent_output(session_id, text);
    }
    store.append_event(
        session_id,
        EventPayload::Output {
            text: text.to_string(),
            kind,
            is_final,
            is_history,
        },
    )
}

pub fn emit_output_final(
    store: &SessionStore,
    session_id: &str,
    text: &str,
    is_history: Option<bool>,
) -> Result<EventRecord> {
    store.append_event(
        session_id,
        EventPayload::OutputFinal {
            text: text.to_string(),
            is_history,
        },
    )
}

pub fn emit_state(store: &SessionStore, session: &Session) -> Result<EventRecord> {
    store.append_event(
        &session.id,
        EventPayload::SessionState {
            state: session.state,
        },
    )
}

pub fn emit_error(
    store: &SessionStore,
    session_id: &str,
    code: &str,
    message: &str,
) -> Result<EventRecord> {
    store.append_event(
        session_id,
        EventPayload::Error {
            code: code.to_string(),
            message: message.to_string(),
        },
    )
}

pub fn emit_header(
    store: &SessionStore,
    session_id: &str,
    header: &RunnerHeader,
) -> Result<EventRecord> {
    store.append_event(
        session_id,
        EventPayload::Header {
            title: header.title.clone(),
            model: header.model.clone(),
            provider: header.provider.clone(),
            sandbox: header.sandbox.clone(),
            approval: header.approval.clone(),
        },
    )
}

pub fn emit_metadata(
    store: &SessionStore,
    session_id: &str,
    key: &str,
    value: Value,
    raw: &str,
) -> Result<EventRecord> {
    store.append_event(
        session_id,
        EventPayload::Metadata {
            key: key.to_string(),
            value,
            raw: raw.to_string(),
        },
    )
}

pub fn emit_heartbeat(
    store: &SessionStore,
    session_id: &str,
    elapsed_s: f64,
    done: bool,
) -> Result<EventRecord> {
    store.append_event(session_id, EventPayload::Heartbeat { elapsed_s, done })
}

/// Emit `input_required`, carrying the turn's accumulated final output.
/// Draining the buffer here scopes `last_output` to the turn that just
/// ended.
pub fn emit_input_required(store: &SessionStore, session_id: &str) -> Result<EventRecord> {
    let last_output = store.take_recent_output(session_id);
    store.append_event(session_id, EventPayload::InputRequired { last_output })
}

/// Emit a permission request and register its id in the pending set (the
/// SSE replay filter drops requests that are no longer pending).
pub fn emit_permission_request(
    store: &SessionStore,
    session_id: &str,
    request_id: &str,
    tool_name: &str,
    tool_input: Value,
) -> Result<EventRecord> {
    store.add_pending_permission(request_id);
    store.append_event(
        session_id,
        EventPayload::PermissionRequest {
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
        },
    )
}
