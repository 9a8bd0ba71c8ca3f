pub mod auth;
pub mod errors;
pub mod events;
pub mod health;
pub mod sessions;
pub mod status;

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the `/api` router.
///
/// `/api/health` is public; everything else sits behind the bearer-token
/// middleware (a no-op in dev mode / with an empty token).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/api/health", get(health::health));

    let protected = Router::new()
        // Sessions
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions", post(sessions::create_session))
        .route("/api/sessions/attach", post(sessions::attach_session))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/sessions/:id", delete(sessions::delete_session))
        .route("/api/sessions/:id/start", post(sessions::start_session))
        .route("/api/sessions/:id/input", post(sessions::send_input))
        .route("/api/sessions/:id/stop", post(sessions::stop_session))
        .route("/api/sessions/:id/rename", patch(sessions::rename_session))
        .route("/api/sessions/:id/sync", post(sessions::sync_session))
        // Events (SSE)
        .route("/api/events/sessions/:id", get(events::session_events))
        // Status
        .route("/api/status/bridges", get(status::bridge_status))
        .route("/api/status/sessions", get(status::session_stats))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}
