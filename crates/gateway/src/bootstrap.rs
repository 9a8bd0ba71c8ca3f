//! Startup wiring shared by the binary and the integration tests.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use sha2::{Digest, Sha256};

use tether_bridges::{BridgeManager, BridgeSubscriber};
use tether_domain::config::Settings;
use tether_runners::RunnerRegistry;
use tether_store::SessionStore;
use tether_tools::ToolExecutor;

use crate::api;
use crate::runtime::locks::SessionLockMap;
use crate::runtime::runner_events::GatewayRunnerEvents;
use crate::state::AppState;

/// Build the application state from settings: store, locks, runner
/// registry, bridge manager, and the token digest.
pub fn build_state(settings: Settings) -> anyhow::Result<AppState> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {}", settings.data_dir.display()))?;

    let store = Arc::new(SessionStore::new(&settings.data_dir).context("opening session store")?);
    let session_locks = Arc::new(SessionLockMap::new());

    let runner_events = Arc::new(GatewayRunnerEvents::new(
        store.clone(),
        session_locks.clone(),
    ));
    let runners = Arc::new(RunnerRegistry::new(
        settings.clone(),
        store.clone(),
        ToolExecutor::new(store.clone()),
        runner_events,
    ));

    let bridges = Arc::new(BridgeManager::new());
    let bridge_subscriber = Arc::new(BridgeSubscriber::new(store.clone(), bridges.clone()));

    let api_token_hash = if settings.auth_enabled() {
        tracing::info!("API bearer-token auth enabled");
        Some(Sha256::digest(settings.token.as_bytes()).to_vec())
    } else {
        tracing::warn!("API bearer-token auth DISABLED (dev mode or empty TETHER_AGENT_TOKEN)");
        None
    };

    Ok(AppState {
        settings: Arc::new(settings),
        store,
        runners,
        bridges,
        bridge_subscriber,
        session_locks,
        api_token_hash,
    })
}

/// Build the HTTP application.
pub fn build_app(state: AppState) -> Router {
    api::router(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Reattach bridge subscribers for sessions that carry a platform binding.
/// Called once at startup so restarts don't orphan bound sessions.
pub fn resubscribe_platform_sessions(state: &AppState) {
    for session in state.store.list_sessions() {
        if let Some(platform) = session.platform.as_deref() {
            state.bridge_subscriber.subscribe(&session.id, platform);
            tracing::info!(
                session_id = %session.id,
                platform,
                "resubscribed bridge for session"
            );
        }
    }
}
