//! Session management endpoints.
//!
//! Every state-mutating handler acquires the per-session lock before
//! inspecting state and holds it across the awaits that observe or mutate
//! the session, so concurrent start/input/stop cannot interleave into
//! impossible transitions.

use std::path::Path as FsPath;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use tether_domain::lifecycle::{maybe_set_session_name, transition, TransitionOptions};
use tether_domain::session::{RepoRef, Session, SessionState, SESSION_NAME_MAX};
use tether_store::SessionStore;

use crate::api::errors::{ApiError, ApiResult};
use crate::runtime::{emit, external};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_approval_choice")]
    pub approval_choice: u8,
}

fn default_approval_choice() -> u8 {
    2
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachSessionRequest {
    pub external_id: String,
    pub runner_type: String,
    pub directory: String,
}

/// Session data returned by API endpoints.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub state: SessionState,
    pub name: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub last_activity_at: String,
    pub exit_code: Option<i32>,
    pub runner_header: Option<String>,
    pub runner_type: Option<String>,
    pub runner_session_id: Option<String>,
    pub directory: Option<String>,
    pub directory_has_git: bool,
    pub adapter: Option<String>,
    pub approval_mode: Option<u8>,
    pub platform: Option<String>,
    pub platform_thread_id: Option<String>,
    pub message_count: usize,
}

impl SessionResponse {
    pub fn from_session(store: &SessionStore, session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            state: session.state,
            name: session.name.clone(),
            created_at: session.created_at.clone(),
            started_at: session.started_at.clone(),
            ended_at: session.ended_at.clone(),
            last_activity_at: session.last_activity_at.clone(),
            exit_code: session.exit_code,
            runner_header: session.runner_header.clone(),
            runner_type: session.runner_type.clone(),
            runner_session_id: session.runner_session_id.clone(),
            directory: session.directory.clone(),
            directory_has_git: session.directory_has_git,
            adapter: session.adapter.clone(),
            approval_mode: session.approval_mode,
            platform: session.platform.clone(),
            platform_thread_id: session.platform_thread_id.clone(),
            message_count: store.get_message_count(&session.id),
        }
    }
}

fn load_session(state: &AppState, session_id: &str) -> ApiResult<Session> {
    state
        .store
        .get_session(session_id)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

fn session_body(state: &AppState, session: &Session) -> Json<serde_json::Value> {
    Json(json!({ "session": SessionResponse::from_session(&state.store, session) }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions, POST /sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let mut sessions = state.store.list_sessions();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let items: Vec<SessionResponse> = sessions
        .iter()
        .map(|s| SessionResponse::from_session(&state.store, s))
        .collect();
    Json(json!({ "sessions": items }))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(directory) = body.directory.as_deref() {
        if !FsPath::new(directory).is_dir() {
            return Err(ApiError::validation(format!(
                "Directory does not exist: {directory}"
            )));
        }
    }

    let repo_ref = match (&body.directory, &body.repo_id) {
        (Some(directory), _) => RepoRef::path(directory.clone()),
        (None, Some(repo_id)) => RepoRef {
            kind: "repo".into(),
            value: repo_id.clone(),
        },
        (None, None) => {
            return Err(ApiError::validation("repo_id or directory is required"));
        }
    };

    let session = state.store.create_session(repo_ref)?;

    if let Some(directory) = body.directory.as_deref() {
        state.store.set_workdir(&session.id, directory, false);
    }

    let mut session = load_session(&state, &session.id)?;
    session.directory_has_git = session
        .directory
        .as_deref()
        .map(|d| FsPath::new(d).join(".git").exists())
        .unwrap_or(false);
    session.adapter = Some(state.runners.default_adapter().to_string());
    state.store.update_session(&session);

    Ok((StatusCode::CREATED, session_body(&state, &session)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET / DELETE /sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = load_session(&state, &session_id)?;
    Ok(session_body(&state, &session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    // Stop any live runner before taking the lock: stop waits for the
    // conversation task, and its callbacks need the session lock.
    let session = load_session(&state, &session_id)?;
    if matches!(
        session.state,
        SessionState::Running | SessionState::Interrupting
    ) {
        if let Ok(runner) = state.runners.get(session.adapter.as_deref()) {
            let _ = runner.stop(&session_id).await;
        }
    }

    let platform = {
        let _permit = state.session_locks.acquire(&session_id).await;
        let session = load_session(&state, &session_id)?;
        state.store.delete_session(&session_id);
        session.platform
    };

    state.session_locks.remove(&session_id);
    state
        .bridge_subscriber
        .unsubscribe(&session_id, platform.as_deref())
        .await;

    Ok(Json(json!({ "ok": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StartSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.approval_choice > 2 {
        return Err(ApiError::validation("approval_choice must be 0, 1, or 2"));
    }

    let _permit = state.session_locks.acquire(&session_id).await;
    let mut session = load_session(&state, &session_id)?;

    if session.directory.is_none() {
        return Err(ApiError::validation("Session has no working directory"));
    }
    let runner = state.runners.get(session.adapter.as_deref())?;

    let opts = TransitionOptions {
        set_started_at: true,
        ..Default::default()
    };
    transition(&mut session, SessionState::Running, opts)?;
    maybe_set_session_name(&mut session, &body.prompt);
    session.approval_mode = Some(body.approval_choice);
    state.store.update_session(&session);

    if let Err(e) = runner
        .start(&session_id, &body.prompt, body.approval_choice)
        .await
    {
        // The runner never came up; park the session in ERROR so a retry
        // stays legal (ERROR -> RUNNING).
        if let Some(mut session) = state.store.get_session(&session_id) {
            let opts = TransitionOptions {
                set_ended_at: true,
                ..Default::default()
            };
            if transition(&mut session, SessionState::Error, opts).is_ok() {
                state.store.update_session(&session);
                let _ = emit::emit_state(&state.store, &session);
            }
            let _ = emit::emit_error(&state.store, &session_id, "RUNNER_ERROR", &e.to_string());
        }
        return Err(e.into());
    }

    let session = load_session(&state, &session_id)?;
    Ok(session_body(&state, &session))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<InputRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.text.trim().is_empty() {
        return Err(ApiError::validation("text must not be empty"));
    }

    let _permit = state.session_locks.acquire(&session_id).await;
    let mut session = load_session(&state, &session_id)?;

    match session.state {
        SessionState::Running => {}
        SessionState::AwaitingInput | SessionState::Error => {
            let opts = TransitionOptions {
                set_started_at: true,
                ..Default::default()
            };
            transition(&mut session, SessionState::Running, opts)?;
            state.store.update_session(&session);
            emit::emit_state(&state.store, &session)
                .map_err(|e| ApiError::internal(e.to_string()))?;
        }
        SessionState::Created | SessionState::Interrupting => {
            return Err(ApiError::invalid_state(format!(
                "Cannot send input in state {}",
                session.state
            )));
        }
    }

    maybe_set_session_name(&mut session, &body.text);
    state.store.update_session(&session);

    let runner = state.runners.get(session.adapter.as_deref())?;
    runner.send_input(&session_id, &body.text).await?;

    Ok(Json(json!({ "ok": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let runner = {
        let _permit = state.session_locks.acquire(&session_id).await;
        let mut session = load_session(&state, &session_id)?;

        transition(
            &mut session,
            SessionState::Interrupting,
            TransitionOptions::default(),
        )?;
        state.store.update_session(&session);
        emit::emit_state(&state.store, &session)
            .map_err(|e| ApiError::internal(e.to_string()))?;

        state.runners.get(session.adapter.as_deref())?
    };

    // The lock must not be held here: stop waits for the conversation task
    // to unwind, and its terminal callbacks take the same lock.
    let exit_code = runner.stop(&session_id).await.ok().flatten();

    let _permit = state.session_locks.acquire(&session_id).await;
    let mut session = load_session(&state, &session_id)?;
    let opts = TransitionOptions {
        set_ended_at: true,
        exit_code,
        ..Default::default()
    };
    if transition(&mut session, SessionState::AwaitingInput, opts).is_ok() {
        state.store.update_session(&session);
        emit::emit_state(&state.store, &session)
            .map_err(|e| ApiError::internal(e.to_string()))?;
    }

    Ok(Json(json!({ "ok": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PATCH /sessions/:id/rename
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<RenameSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = body.name.trim();
    if name.is_empty() || name.chars().count() > SESSION_NAME_MAX {
        return Err(ApiError::validation(format!(
            "name must be 1..{SESSION_NAME_MAX} characters"
        )));
    }

    let mut session = load_session(&state, &session_id)?;
    session.name = Some(name.to_string());
    state.store.update_session(&session);
    Ok(session_body(&state, &session))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/attach, POST /sessions/:id/sync
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn attach_session(
    State(state): State<AppState>,
    Json(body): Json<AttachSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.external_id.trim().is_empty() {
        return Err(ApiError::validation("external_id must not be empty"));
    }

    // Re-attaching a known external session hands back the existing row.
    if let Some(existing_id) = state.store.find_by_runner_session_id(&body.external_id) {
        let session = load_session(&state, &existing_id)?;
        return Ok((StatusCode::CREATED, session_body(&state, &session)));
    }

    let session = state
        .store
        .create_session(RepoRef::path(body.directory.clone()))?;
    state.store.set_workdir(&session.id, &body.directory, false);
    state
        .store
        .set_runner_session_id(&session.id, &body.external_id)
        .map_err(|e| ApiError::invalid_state(e.to_string()))?;

    let mut session = load_session(&state, &session.id)?;
    session.runner_type = Some(body.runner_type.clone());
    session.external_agent = Some(tether_domain::session::ExternalAgent {
        name: Some(body.runner_type.clone()),
        agent_type: Some(body.runner_type),
        ..Default::default()
    });
    state.store.update_session(&session);

    Ok((StatusCode::CREATED, session_body(&state, &session)))
}

pub async fn sync_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let _permit = state.session_locks.acquire(&session_id).await;
    let session = load_session(&state, &session_id)?;

    let (synced, total) = external::sync_external_session(&state.store, &session)
        .map_err(|e| ApiError::validation(e.to_string()))?;

    Ok(Json(json!({ "synced": synced, "total": total })))
}
