//! Resumable sessions and the per-session event cache.
//!
//! A session is created by IDENTIFY and owned by the registry, not by the
//! connection that created it: the socket can drop and a later connection
//! can reclaim the session with RESUME, replaying everything it missed out
//! of the bounded ring.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::model::ids::UserId;
use crate::utils::random_session_id;

use super::payload::ConnectionProperties;

/// The resume window: how many dispatched events a session keeps. A client
/// that fell further behind than this has to IDENTIFY again.
pub const RESUME_MAX_EVENTS: usize = 60;

/// Attempts at generating an unused session id before giving up.
const MAX_SESSION_ID_TRIES: usize = 20;

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub token: String,
    pub user_id: UserId,
    pub bot: bool,
    /// `(shard_id, shard_count)`
    pub shard: (u32, u32),
    /// whether READY gets zlib-deflated for this session
    pub compress: bool,
    /// guilds over this size only stream online members
    pub large_threshold: usize,
    pub properties: ConnectionProperties,
    /// atomic desktop clients only join viewer sets via GUILD_SYNC
    pub atomic: bool,
    inner: Mutex<SessionInner>,
}

/// Everything guarded by the session's dispatch lock: the sequence counters
/// and the replay ring. Holding the guard while enqueueing a send is what
/// serializes events per connection and keeps RESUME's replay from
/// interleaving with live dispatches.
#[derive(Debug, Default)]
pub struct SessionInner {
    /// last seq dispatched to the client
    pub sent_seq: u64,
    /// last seq the client acknowledged via HEARTBEAT
    pub recv_seq: u64,
    ring: VecDeque<Arc<Value>>,
}

impl SessionInner {
    /// Record a dispatched frame. READY and RESUMED are bootstraps, not
    /// replayable events; the caller skips them.
    pub fn record(&mut self, frame: Arc<Value>) {
        if self.ring.len() == RESUME_MAX_EVENTS {
            self.ring.pop_front();
        }
        self.ring.push_back(frame);
    }

    /// The cached frames with `s > after`, in dispatch order.
    pub fn replay_after(&self, after: u64) -> Vec<Arc<Value>> {
        self.ring
            .iter()
            .filter(|frame| frame.get("s").and_then(Value::as_u64).map_or(false, |s| s > after))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}

impl Session {
    pub fn new(
        session_id: String,
        token: String,
        user_id: UserId,
        bot: bool,
        shard: (u32, u32),
        compress: bool,
        large_threshold: usize,
        properties: ConnectionProperties,
    ) -> Self {
        // stock desktop clients subscribe to guilds lazily via GUILD_SYNC
        let atomic = properties.browser.as_deref() == Some("Discord Client");
        Self {
            session_id,
            token,
            user_id,
            bot,
            shard,
            compress,
            large_threshold,
            properties,
            atomic,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Acquire the dispatch lock.
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }
}

/// The process-wide `session_id -> Session` mapping.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a session id no live session is using. `None` after
    /// `MAX_SESSION_ID_TRIES` collisions in a row.
    pub async fn generate_id(&self) -> Option<String> {
        let sessions = self.sessions.read().await;
        for _ in 0..MAX_SESSION_ID_TRIES {
            let candidate = random_session_id();
            if !sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
    }

    pub async fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn session() -> Session {
        Session::new(
            random_session_id(),
            "token".into(),
            UserId(1),
            false,
            (0, 1),
            false,
            250,
            ConnectionProperties::default(),
        )
    }

    #[tokio::test]
    async fn ring_is_bounded_and_ordered() {
        let session = session();
        let mut inner = session.lock().await;
        for seq in 1..=(RESUME_MAX_EVENTS as u64 + 10) {
            inner.sent_seq = seq;
            inner.record(Arc::new(json!({"op": 0, "s": seq, "t": "X", "d": {}})));
        }
        assert_eq!(inner.ring_len(), RESUME_MAX_EVENTS);

        let replay = inner.replay_after(0);
        assert_eq!(replay.len(), RESUME_MAX_EVENTS);
        let seqs: Vec<u64> = replay.iter().map(|f| f["s"].as_u64().unwrap()).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "replay must preserve dispatch order");
        assert_eq!(*seqs.first().unwrap(), 11);
        assert_eq!(*seqs.last().unwrap(), RESUME_MAX_EVENTS as u64 + 10);
    }

    #[tokio::test]
    async fn replay_after_matching_seq_is_empty() {
        let session = session();
        let mut inner = session.lock().await;
        for seq in 1..=5 {
            inner.sent_seq = seq;
            inner.record(Arc::new(json!({"op": 0, "s": seq, "t": "X", "d": {}})));
        }
        assert!(inner.replay_after(5).is_empty());
        assert_eq!(inner.replay_after(3).len(), 2);
    }

    #[tokio::test]
    async fn registry_ids_are_unique_and_removable() {
        let registry = SessionRegistry::new();
        let id = registry.generate_id().await.unwrap();
        assert_eq!(id.len(), 32);

        let session = Arc::new(Session::new(
            id.clone(),
            "t".into(),
            UserId(7),
            false,
            (0, 1),
            false,
            250,
            ConnectionProperties::default(),
        ));
        registry.insert(Arc::clone(&session)).await;
        assert!(registry.lookup(&id).await.is_some());
        assert_eq!(registry.len().await, 1);

        registry.remove(&id).await;
        assert!(registry.lookup(&id).await.is_none());
    }

    #[test]
    fn desktop_browser_marks_atomic() {
        let props = ConnectionProperties {
            os: None,
            browser: Some("Discord Client".into()),
            device: None,
        };
        let desktop = Session::new(
            "sid".into(), "t".into(), UserId(1), false, (0, 1), false, 250, props,
        );
        assert!(desktop.atomic);
        assert!(!session().atomic);
    }
}
