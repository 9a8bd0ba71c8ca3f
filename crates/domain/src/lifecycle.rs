//! Session lifecycle state machine.
//!
//! [`transition`] is the only way session state changes: it validates the
//! move against the permitted-transition table, stamps timestamps, and
//! mutates the row in place.  Callers persist the row afterwards and hold
//! the per-session lock for the whole read-transition-write window.

use crate::session::{now_ts, Session, SessionState, SESSION_NAME_MAX};

/// Destinations permitted from a given state.
pub fn permitted(from: SessionState) -> &'static [SessionState] {
    use SessionState::*;
    match from {
        Created => &[Running],
        Running => &[AwaitingInput, Interrupting, Error],
        AwaitingInput => &[Running, Error],
        Interrupting => &[AwaitingInput, Error],
        Error => &[Running],
    }
}

/// A rejected state transition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Session already {0}")]
    AlreadyInState(SessionState),

    #[error("Invalid state transition {from} -> {to}")]
    Forbidden {
        from: SessionState,
        to: SessionState,
    },
}

/// Side effects applied together with a successful transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionOptions {
    /// Permit a no-op self-transition instead of rejecting it.
    pub allow_same: bool,
    /// Stamp `started_at` (first entry to RUNNING only; later entries keep
    /// the original value).
    pub set_started_at: bool,
    /// Stamp `ended_at`.
    pub set_ended_at: bool,
    /// Record an exit code.
    pub exit_code: Option<i32>,
}

/// Validate and apply a state transition.
///
/// On success the session's `state` and `last_activity_at` are updated,
/// plus whatever [`TransitionOptions`] requested.  On failure nothing is
/// mutated.
pub fn transition(
    session: &mut Session,
    to: SessionState,
    opts: TransitionOptions,
) -> Result<(), TransitionError> {
    if session.state == to {
        if !opts.allow_same {
            return Err(TransitionError::AlreadyInState(to));
        }
    } else if !permitted(session.state).contains(&to) {
        return Err(TransitionError::Forbidden {
            from: session.state,
            to,
        });
    }

    let ts = now_ts();
    session.state = to;
    session.last_activity_at = ts.clone();
    if opts.set_started_at && session.started_at.is_none() {
        session.started_at = Some(ts.clone());
    }
    if opts.set_ended_at {
        session.ended_at = Some(ts);
    }
    if let Some(code) = opts.exit_code {
        session.exit_code = Some(code);
    }
    Ok(())
}

/// Stamp the session name from the first non-empty prompt.
///
/// Whitespace is collapsed and the result truncated to 80 characters.
/// Does nothing when a name is already set.  Returns whether the name
/// changed (so the caller knows to persist).
pub fn maybe_set_session_name(session: &mut Session, prompt: &str) -> bool {
    if session.name.is_some() {
        return false;
    }
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return false;
    }
    let title: String = collapsed.chars().take(SESSION_NAME_MAX).collect();
    session.name = Some(title);
    true
}
