use std::sync::Arc;

use tether_bridges::{BridgeManager, BridgeSubscriber};
use tether_domain::config::Settings;
use tether_runners::RunnerRegistry;
use tether_store::SessionStore;

use crate::runtime::locks::SessionLockMap;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — settings, store
/// - **Runners** — registry of backend adapters
/// - **Bridges** — platform registry + per-session event routers
/// - **Concurrency** — per-session mutexes
/// - **Security** — token digest computed once at startup
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub settings: Arc<Settings>,
    pub store: Arc<SessionStore>,

    // ── Runners ───────────────────────────────────────────────────────
    pub runners: Arc<RunnerRegistry>,

    // ── Bridges ───────────────────────────────────────────────────────
    pub bridges: Arc<BridgeManager>,
    pub bridge_subscriber: Arc<BridgeSubscriber>,

    // ── Concurrency ───────────────────────────────────────────────────
    pub session_locks: Arc<SessionLockMap>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token.  `None` = auth disabled
    /// (dev mode or empty token).
    pub api_token_hash: Option<Vec<u8>>,
}
