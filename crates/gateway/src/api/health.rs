//! Health probe.

use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Wire protocol revision for UI/bridge compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
    }))
}
