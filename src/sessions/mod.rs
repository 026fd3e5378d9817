//! Session registry
//!
//! In-memory directory of live, authenticated connections indexed by
//! session id and user id. The registry exclusively owns every session;
//! callers hold ids and re-resolve before each operation, because a
//! session can be removed concurrently by the staleness sweep or a
//! transport error. Never cache a resolved [`Session`] past one
//! operation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::Gauge;

/// Close reason sent when the sweep expires a session.
pub const CLOSE_REASON_TIMEOUT: &str = "timeout";
/// Close reason sent during process shutdown.
pub const CLOSE_REASON_SHUTDOWN: &str = "server shutdown";

/// Transport send failure; the connection is gone.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// Handle to one live connection's outbound side.
///
/// Implementations must swallow their own close errors; the registry
/// treats `close` as best-effort.
pub trait SessionTransport: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), TransportClosed>;
    fn close(&self, reason: &str);
    fn is_open(&self) -> bool;
}

/// One live, authenticated connection.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    pub transport: Arc<dyn SessionTransport>,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub metadata: Option<Value>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("user_email", &self.user_email)
            .field("connected_at", &self.connected_at)
            .field("last_heartbeat", &self.last_heartbeat)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionRegistryConfig {
    pub sweep_interval: Duration,
    pub session_timeout: Duration,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, HashSet<String>>,
}

/// Registry of live sessions plus the staleness sweeper.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    config: SessionRegistryConfig,
    active: Gauge,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: SessionRegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
            active: Gauge::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Register a freshly authenticated connection and index it under its
    /// user id. Returns a snapshot of the new session.
    pub fn create_session(
        &self,
        transport: Arc<dyn SessionTransport>,
        user_id: &str,
        user_email: &str,
        metadata: Option<Value>,
    ) -> Session {
        let now = Instant::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_email: user_email.to_string(),
            transport,
            connected_at: now,
            last_heartbeat: now,
            metadata,
        };
        let mut inner = self.inner.write();
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        self.active.inc();
        debug!(target: "sessions", session = %session.id, user = %user_id, "session created");
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let inner = self.inner.read();
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First session matching the email; emails are not unique across
    /// sessions (one user, many tabs), any match serves.
    pub fn session_by_email(&self, email: &str) -> Option<Session> {
        self.inner
            .read()
            .sessions
            .values()
            .find(|s| s.user_email == email)
            .cloned()
    }

    /// Bump the heartbeat; false means the session is gone and the
    /// caller should stop pinging it.
    pub fn update_heartbeat(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session and its user-index entry. Idempotent.
    pub fn remove_session(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.remove(id) else {
            return false;
        };
        if let Some(ids) = inner.by_user.get_mut(&session.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_user.remove(&session.user_id);
            }
        }
        self.active.dec();
        debug!(target: "sessions", session = %id, "session removed");
        true
    }

    pub fn active_count(&self) -> u64 {
        self.active.get()
    }

    /// Expire every session whose heartbeat is older than the timeout.
    ///
    /// Transports get a best-effort close with a timeout reason; removal
    /// proceeds regardless. Returns how many sessions were expired.
    pub fn sweep_once(&self) -> usize {
        let stale: Vec<Session> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter(|s| s.last_heartbeat.elapsed() > self.config.session_timeout)
                .cloned()
                .collect()
        };
        for session in &stale {
            warn!(
                target: "sessions",
                session = %session.id,
                user = %session.user_id,
                "heartbeat timeout, closing session"
            );
            session.transport.close(CLOSE_REASON_TIMEOUT);
            self.remove_session(&session.id);
        }
        stale.len()
    }

    /// Start the periodic staleness sweep. Stopped by [`shutdown`].
    ///
    /// [`shutdown`]: SessionRegistry::shutdown
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_once();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweeper, close every live transport, and clear all state.
    /// Called once at process termination.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            let drained = inner.sessions.drain().map(|(_, s)| s).collect();
            inner.by_user.clear();
            drained
        };
        let count = sessions.len();
        for session in sessions {
            session.transport.close(CLOSE_REASON_SHUTDOWN);
        }
        self.active.set(0);
        info!(target: "sessions", closed = count, "session registry shut down");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(SessionRegistryConfig {
            sweep_interval: Duration::from_millis(10),
            session_timeout: Duration::from_millis(50),
        }))
    }

    #[test]
    fn test_create_and_index_session() {
        let reg = registry();
        let t = RecordingTransport::new(true);
        let session = reg.create_session(t, "u1", "u1@example.com", None);

        assert!(reg.get_session(&session.id).is_some());
        let for_user = reg.sessions_for_user("u1");
        assert_eq!(for_user.len(), 1);
        assert_eq!(for_user[0].id, session.id);
        assert_eq!(
            reg.session_by_email("u1@example.com").map(|s| s.id),
            Some(session.id)
        );
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn test_remove_session_is_idempotent_and_cleans_index() {
        let reg = registry();
        let session = reg.create_session(RecordingTransport::new(true), "u1", "a@b.c", None);

        assert!(reg.remove_session(&session.id));
        assert!(!reg.remove_session(&session.id));
        assert!(reg.sessions_for_user("u1").is_empty());
        // empty per-user set is gone entirely
        assert!(reg.inner.read().by_user.get("u1").is_none());
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn test_multiple_sessions_per_user() {
        let reg = registry();
        let a = reg.create_session(RecordingTransport::new(true), "u1", "a@b.c", None);
        let b = reg.create_session(RecordingTransport::new(true), "u1", "a@b.c", None);
        assert_ne!(a.id, b.id);
        assert_eq!(reg.sessions_for_user("u1").len(), 2);

        reg.remove_session(&a.id);
        let remaining = reg.sessions_for_user("u1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
    }

    #[test]
    fn test_heartbeat_update_moves_forward() {
        let reg = registry();
        let session = reg.create_session(RecordingTransport::new(true), "u1", "a@b.c", None);
        let before = reg.get_session(&session.id).unwrap().last_heartbeat;
        std::thread::sleep(Duration::from_millis(5));
        assert!(reg.update_heartbeat(&session.id));
        let after = reg.get_session(&session.id).unwrap().last_heartbeat;
        assert!(after > before);
        assert!(!reg.update_heartbeat("missing"));
    }

    #[test]
    fn test_sweep_expires_only_stale_sessions() {
        let reg = registry();
        let stale_transport = RecordingTransport::new(true);
        let stale = reg.create_session(stale_transport.clone(), "u1", "a@b.c", None);
        std::thread::sleep(Duration::from_millis(60));
        let fresh = reg.create_session(RecordingTransport::new(true), "u2", "x@y.z", None);

        let expired = reg.sweep_once();
        assert_eq!(expired, 1);
        assert!(reg.get_session(&stale.id).is_none());
        assert!(reg.get_session(&fresh.id).is_some());
        assert_eq!(
            stale_transport.close_reasons.lock().as_slice(),
            &[CLOSE_REASON_TIMEOUT.to_string()]
        );
    }

    #[test]
    fn test_heartbeat_keeps_session_alive_through_sweep() {
        let reg = registry();
        let session = reg.create_session(RecordingTransport::new(true), "u1", "a@b.c", None);
        std::thread::sleep(Duration::from_millis(40));
        reg.update_heartbeat(&session.id);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reg.sweep_once(), 0);
        assert!(reg.get_session(&session.id).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let reg = registry();
        reg.spawn_sweeper();
        let t1 = RecordingTransport::new(true);
        let t2 = RecordingTransport::new(true);
        reg.create_session(t1.clone(), "u1", "a@b.c", None);
        reg.create_session(t2.clone(), "u2", "x@y.z", None);

        reg.shutdown();
        assert_eq!(reg.active_count(), 0);
        assert!(reg.sessions_for_user("u1").is_empty());
        assert_eq!(
            t1.close_reasons.lock().as_slice(),
            &[CLOSE_REASON_SHUTDOWN.to_string()]
        );
        assert_eq!(
            t2.close_reasons.lock().as_slice(),
            &[CLOSE_REASON_SHUTDOWN.to_string()]
        );
    }
}
