//! Per-session concurrency control.
//!
//! Every handler that may trigger a state transition (start, input, stop,
//! delete, external sync) and every runner callback acquires the session's
//! lock before inspecting state, and holds it across the awaits that
//! observe or mutate the session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Manages per-session mutexes (a `Semaphore(1)` each), created lazily.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for a session.  The permit auto-releases on drop.
    pub async fn acquire(&self, session_id: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        match sem.acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => unreachable!("session lock semaphore closed"),
        }
    }

    /// Drop the lock entry for a deleted session.
    pub fn remove(&self, session_id: &str) {
        self.locks.lock().remove(session_id);
    }

    /// Remove entries that aren't currently held.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_access() {
        let map = SessionLockMap::new();
        let p1 = map.acquire("s1").await;
        drop(p1);
        let p2 = map.acquire("s1").await;
        drop(p2);
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let map = SessionLockMap::new();
        let _p1 = map.acquire("s1").await;
        let _p2 = map.acquire("s2").await;
        assert_eq!(map.session_count(), 2);
    }

    #[tokio::test]
    async fn same_session_waits_for_release() {
        let map = Arc::new(SessionLockMap::new());
        let p1 = map.acquire("s1").await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p2 = map2.acquire("s1").await;
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = SessionLockMap::new();
        let _held = map.acquire("busy").await;
        let released = map.acquire("idle").await;
        drop(released);

        map.prune_idle();
        assert_eq!(map.session_count(), 1);
    }
}
