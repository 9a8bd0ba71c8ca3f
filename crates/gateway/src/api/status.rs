//! Bridge and session status endpoints.

use std::collections::HashMap;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::api::sessions::SessionResponse;
use crate::state::AppState;

const EXPECTED_PLATFORMS: [&str; 3] = ["telegram", "slack", "discord"];

/// GET /status/bridges — which platform bridges are running.
pub async fn bridge_status(State(state): State<AppState>) -> impl IntoResponse {
    let registered = state.bridges.list_bridges();
    let bridges: Vec<_> = EXPECTED_PLATFORMS
        .iter()
        .map(|platform| {
            let status = if registered.iter().any(|p| p == platform) {
                "running"
            } else {
                "not_configured"
            };
            json!({ "platform": platform, "status": status })
        })
        .collect();
    Json(json!({ "bridges": bridges }))
}

/// GET /status/sessions — aggregate counts and recent activity.
pub async fn session_stats(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.store.list_sessions();

    let mut by_state: HashMap<String, usize> = HashMap::new();
    let mut by_platform: HashMap<String, usize> = HashMap::new();
    for session in &sessions {
        *by_state.entry(session.state.to_string()).or_default() += 1;
        let platform = session.platform.clone().unwrap_or_else(|| "none".into());
        *by_platform.entry(platform).or_default() += 1;
    }

    let mut recent = sessions.clone();
    recent.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
    let recent_activity: Vec<SessionResponse> = recent
        .iter()
        .take(10)
        .map(|s| SessionResponse::from_session(&state.store, s))
        .collect();

    Json(json!({
        "total": sessions.len(),
        "by_state": by_state,
        "by_platform": by_platform,
        "recent_activity": recent_activity,
    }))
}
