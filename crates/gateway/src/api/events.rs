//! SSE event stream for a session.
//!
//! The subscriber queue is registered *before* the backlog is replayed,
//! closing the gap between catch-up and live tail; the `last_seq` cursor
//! deduplicates the overlap.  Stale permission requests (no longer in the
//! pending set) are dropped during replay so they cannot reappear after a
//! restart.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_core::Stream;
use serde::Deserialize;

use tether_domain::event::{EventPayload, EventRecord};
use tether_store::SessionStore;

use crate::api::errors::{ApiError, ApiResult};
use crate::state::AppState;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
const DEFAULT_LIMIT: usize = 500;
const MAX_LIMIT: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Removes the subscriber when the stream is dropped (client disconnect).
struct SubscriberGuard {
    store: Arc<SessionStore>,
    session_id: String,
    subscriber_id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.store
            .remove_subscriber(&self.session_id, self.subscriber_id);
    }
}

pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get_session(&session_id).is_none() {
        return Err(ApiError::not_found("Session not found"));
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    // Register the live queue first, then read the backlog: an event
    // emitted in between shows up in both and is dropped by the seq cursor.
    let subscription = state.store.new_subscriber(&session_id);
    let backlog = state
        .store
        .read_event_log(&session_id, query.since, Some(limit));

    let stream = event_stream(
        state.store.clone(),
        session_id,
        query.since,
        backlog,
        subscription,
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text(" keepalive")))
}

fn event_stream(
    store: Arc<SessionStore>,
    session_id: String,
    since: u64,
    backlog: Vec<EventRecord>,
    mut subscription: tether_store::Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = SubscriberGuard {
            store: store.clone(),
            session_id,
            subscriber_id: subscription.id,
        };

        let mut last_seq = since;
        for record in backlog {
            if is_stale_permission(&store, &record.payload) {
                continue;
            }
            if record.seq <= last_seq {
                continue;
            }
            last_seq = record.seq;
            yield Ok(to_frame(&record));
        }

        while let Some(record) = subscription.rx.recv().await {
            if record.seq <= last_seq {
                continue;
            }
            last_seq = record.seq;
            yield Ok(to_frame(&record));
        }
    }
}

/// During replay, drop permission requests that are no longer pending.
fn is_stale_permission(store: &SessionStore, payload: &EventPayload) -> bool {
    match payload {
        EventPayload::PermissionRequest { request_id, .. } => {
            !store.is_pending_permission(request_id)
        }
        _ => false,
    }
}

fn to_frame(record: &EventRecord) -> Event {
    let data = serde_json::to_string(record).unwrap_or_else(|_| "{}".into());
    Event::default().data(data)
}
