//! Background maintenance: retention pruning and idle-session interrupts.

use std::time::Duration;

use chrono::{NaiveDateTime, Utc};

use tether_domain::lifecycle::{transition, TransitionOptions};
use tether_domain::session::SessionState;

use crate::runtime::emit;
use crate::state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically prune stale sessions and interrupt idle runs.
pub async fn maintenance_loop(state: AppState) {
    let retention_days = state.settings.session_retention_days;
    let idle_timeout_s = state.settings.session_idle_seconds;

    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;

        let removed = state.store.prune_sessions(retention_days);
        if removed > 0 {
            tracing::info!(count = removed, "pruned sessions");
        }
        state.session_locks.prune_idle();

        if idle_timeout_s > 0 {
            interrupt_idle_sessions(&state, idle_timeout_s).await;
        }
    }
}

async fn interrupt_idle_sessions(state: &AppState, idle_timeout_s: u64) {
    let now = Utc::now().naive_utc();
    for session in state.store.list_sessions() {
        if session.state != SessionState::Running {
            continue;
        }
        let Some(last) = parse_ts(&session.last_activity_at) else {
            continue;
        };
        let idle = (now - last).num_seconds();
        if idle <= idle_timeout_s as i64 {
            continue;
        }

        tracing::warn!(
            session_id = %session.id,
            idle_s = idle,
            "idle timeout reached; interrupting session"
        );

        let runner = {
            let _permit = state.session_locks.acquire(&session.id).await;
            // Re-read under the lock; the session may have moved on.
            let Some(mut session) = state.store.get_session(&session.id) else {
                continue;
            };
            if session.state != SessionState::Running {
                continue;
            }

            if transition(
                &mut session,
                SessionState::Interrupting,
                TransitionOptions::default(),
            )
            .is_err()
            {
                continue;
            }
            state.store.update_session(&session);
            let _ = emit::emit_state(&state.store, &session);

            match state.runners.get(session.adapter.as_deref()) {
                Ok(runner) => runner,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "no runner for idle stop");
                    continue;
                }
            }
        };

        // Stop outside the lock: the conversation task's terminal
        // callbacks need it to unwind.
        let exit_code = runner.stop(&session.id).await.ok().flatten();

        let _permit = state.session_locks.acquire(&session.id).await;
        if let Some(mut session) = state.store.get_session(&session.id) {
            let opts = TransitionOptions {
                set_ended_at: true,
                exit_code,
                ..Default::default()
            };
            if transition(&mut session, SessionState::AwaitingInput, opts).is_ok() {
                state.store.update_session(&session);
                let _ = emit::emit_state(&state.store, &session);
            }
        }
    }
}

fn parse_ts(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ").ok()
}
