//! In-memory registry of submitted item lists.
//!
//! The registry bridges a submission request, which carries the item list in
//! its body, and the later streaming request, which cannot carry a body. It is
//! constructed once at startup and shared by every handler through
//! [`SessionRegistry`]'s cheap `Clone`.
//!
//! Sessions are never edited in place: they are inserted by [`create`],
//! removed by [`take`] when a stream opens or by [`release`] on cancellation,
//! and optionally evicted by the sweeper once they outlive a TTL.
//!
//! [`create`]: SessionRegistry::create
//! [`take`]: SessionRegistry::take
//! [`release`]: SessionRegistry::release

use core::time::Duration;
use ferroid::{base32::Base32UlidExt, id::ULID};
use parking_lot::RwLock;
use serde_json::Value;
use sluice_core::{Error, types::SessionId};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A submitted item list awaiting its stream.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub items: Vec<Value>,
    pub created_at: Instant,
}

/// Shared, thread-safe map from session id to [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `items` under a freshly generated identifier and returns it.
    ///
    /// Identifiers are ULIDs rendered in Crockford base32. An identifier that
    /// is already live is never reused.
    pub fn create(&self, items: Vec<Value>) -> SessionId {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = ULID::now().encode().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                items,
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Returns a copy of the items stored under `id` without removing them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if no such session is live.
    pub fn consume(&self, id: &str) -> Result<Vec<Value>, Error> {
        self.sessions
            .read()
            .get(id)
            .map(|session| session.items.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Removes and returns the items stored under `id` in one step.
    ///
    /// This is what the stream endpoint uses: two concurrent streams for the
    /// same id cannot both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if no such session is live.
    pub fn take(&self, id: &str) -> Result<Vec<Value>, Error> {
        self.sessions
            .write()
            .remove(id)
            .map(|session| session.items)
            .ok_or_else(|| not_found(id))
    }

    /// Removes the session, returning whether it existed.
    pub fn release(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Evicts sessions created more than `ttl` before `now`, returning how
    /// many were removed.
    pub fn sweep_expired(&self, ttl: Duration, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| now.saturating_duration_since(session.created_at) < ttl);
        before - sessions.len()
    }

    /// Spawns a background task evicting sessions older than `ttl` every
    /// `period` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        &self,
        ttl: Duration,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_expired(ttl, Instant::now());
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = registry.len(), "Evicted expired sessions");
                        }
                    }
                }
            }
            tracing::debug!("Session sweeper stopped");
        })
    }
}

fn not_found(id: &str) -> Error {
    Error::SessionNotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn create_then_take_exactly_once() {
        let registry = SessionRegistry::new();
        let id = registry.create(vec![json!("a"), json!("b")]);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.consume(&id).unwrap(), vec![json!("a"), json!("b")]);
        assert_eq!(registry.len(), 1, "lookup alone must not remove");

        assert_eq!(registry.take(&id).unwrap().len(), 2);
        assert_eq!(
            registry.take(&id),
            Err(Error::SessionNotFound { id: id.clone() })
        );
        assert!(registry.consume(&id).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn release_removes_session() {
        let registry = SessionRegistry::new();
        let id = registry.create(vec![]);
        assert!(registry.release(&id));
        assert!(!registry.release(&id));
        assert!(registry.take(&id).is_err());
    }

    #[test]
    fn ids_are_opaque_base32_tokens() {
        let registry = SessionRegistry::new();
        let id = registry.create(vec![]);
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_submissions_get_distinct_ids() {
        const TASKS: usize = 16;
        const PER_TASK: usize = 500;

        let registry = SessionRegistry::new();
        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    (0..PER_TASK)
                        .map(|i| registry.create(vec![json!(i)]))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(ids.insert(id), "duplicate session id");
            }
        }
        assert_eq!(ids.len(), TASKS * PER_TASK);
        assert_eq!(registry.len(), TASKS * PER_TASK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_takes_of_one_session_succeed_once() {
        const TAKERS: usize = 32;

        for _ in 0..20 {
            let registry = SessionRegistry::new();
            let id = registry.create(vec![json!("a"), json!("b")]);
            let barrier = Arc::new(tokio::sync::Barrier::new(TAKERS));

            let tasks: Vec<_> = (0..TAKERS)
                .map(|_| {
                    let registry = registry.clone();
                    let barrier = Arc::clone(&barrier);
                    let id = id.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        registry.take(&id)
                    })
                })
                .collect();

            let mut won = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(items) => {
                        assert_eq!(items, vec![json!("a"), json!("b")]);
                        won += 1;
                    }
                    Err(e) => assert_eq!(e, Error::SessionNotFound { id: id.clone() }),
                }
            }
            assert_eq!(won, 1);
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn sweep_evicts_only_expired_sessions() {
        let registry = SessionRegistry::new();
        let old = registry.create(vec![]);
        std::thread::sleep(Duration::from_millis(30));
        let fresh = registry.create(vec![]);

        let now = registry.sessions.read()[&fresh].created_at;
        let evicted = registry.sweep_expired(Duration::from_millis(20), now);
        assert_eq!(evicted, 1);
        assert!(registry.consume(&old).is_err());
        assert!(registry.consume(&fresh).is_ok());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let registry = SessionRegistry::new();
        let shutdown = CancellationToken::new();
        let handle = registry.spawn_sweeper(
            Duration::from_secs(60),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        registry.create(vec![]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
