//! Live connection handles per session.
//!
//! The registry tracks the currently attached client connection for each
//! (user, tab) so a new attachment can force-close a stale one (stale-tab
//! takeover) and sandbox teardown can close everything a user owns.
//!
//! One lock guards the whole table; it is only held to look up, insert, or
//! remove handles, never across a close callback.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tsm_core::SessionKey;

/// A live duplex-stream handle the registry can force-close.
///
/// `close` must be cheap and non-blocking: implementations should signal the
/// underlying transport (e.g. queue a WebSocket close frame) rather than
/// perform I/O inline.
pub trait TerminalConnection: Send + Sync {
    fn close(&self, reason: &str);
}

type ConnectionMap = HashMap<String, HashMap<String, Arc<dyn TerminalConnection>>>;

/// Concurrent map of active connections, keyed by user then session.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<ConnectionMap>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active connection for a session, if any.
    pub async fn get_active(&self, key: &SessionKey) -> Option<Arc<dyn TerminalConnection>> {
        let active = self.active.lock().await;
        active.get(key.user())?.get(key.session()).cloned()
    }

    /// Registers a connection, replacing and force-closing any pre-existing
    /// handle for the same key (stale-tab takeover).
    pub async fn register(&self, key: &SessionKey, conn: Arc<dyn TerminalConnection>) {
        let replaced = {
            let mut active = self.active.lock().await;
            let sessions = active.entry(key.user().to_string()).or_default();
            sessions
                .insert(key.session().to_string(), conn.clone())
                .filter(|old| !Arc::ptr_eq(old, &conn))
        };

        if let Some(old) = replaced {
            old.close("session replaced");
        }
        info!(user_id = key.user(), session_id = key.session(), "terminal session registered");
    }

    /// Removes a connection, but only if `conn` is the currently registered
    /// handle. A stale unregister racing a newer registration is a no-op.
    pub async fn unregister(&self, key: &SessionKey, conn: &Arc<dyn TerminalConnection>) {
        let mut active = self.active.lock().await;
        let Some(sessions) = active.get_mut(key.user()) else {
            return;
        };
        let Some(current) = sessions.get(key.session()) else {
            return;
        };
        if !Arc::ptr_eq(current, conn) {
            debug!(
                user_id = key.user(),
                session_id = key.session(),
                "stale unregister ignored"
            );
            return;
        }
        sessions.remove(key.session());
        if sessions.is_empty() {
            active.remove(key.user());
        }
        info!(user_id = key.user(), session_id = key.session(), "terminal session unregistered");
    }

    /// Force-closes every connection for a user (sandbox teardown).
    pub async fn close_all(&self, user_id: &str) {
        let removed = {
            let mut active = self.active.lock().await;
            active.remove(user_id)
        };
        let Some(sessions) = removed else {
            return;
        };
        for (session_id, conn) in sessions {
            conn.close("session closed");
            info!(user_id, session_id = %session_id, "terminal session closed");
        }
    }

    /// Number of registered connections across all users.
    pub async fn len(&self) -> usize {
        let active = self.active.lock().await;
        active.values().map(HashMap::len).sum()
    }

    /// Returns true when no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConn {
        closes: AtomicUsize,
    }

    impl FakeConn {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closes: AtomicUsize::new(0),
            })
        }

        fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl TerminalConnection for FakeConn {
        fn close(&self, _reason: &str) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_register_and_get_active() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("u1", "s1");
        let conn = FakeConn::new();

        registry.register(&key, conn.clone()).await;
        assert!(registry.get_active(&key).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_replaces_and_closes_stale() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("u1", "s1");
        let old = FakeConn::new();
        let new = FakeConn::new();

        registry.register(&key, old.clone()).await;
        registry.register(&key, new.clone()).await;

        assert_eq!(old.close_count(), 1);
        assert_eq!(new.close_count(), 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_unregister_is_noop() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("u1", "s1");
        let current = FakeConn::new();
        let stale = FakeConn::new();

        registry.register(&key, current.clone()).await;
        let stale_handle: Arc<dyn TerminalConnection> = stale;
        registry.unregister(&key, &stale_handle).await;

        // The newer registration survives a slow stale unregister.
        assert!(registry.get_active(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_matching_unregister_removes() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("u1", "s1");
        let conn = FakeConn::new();

        registry.register(&key, conn.clone()).await;
        let handle: Arc<dyn TerminalConnection> = conn;
        registry.unregister(&key, &handle).await;

        assert!(registry.get_active(&key).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all_for_user() {
        let registry = SessionRegistry::new();
        let a = FakeConn::new();
        let b = FakeConn::new();
        let other = FakeConn::new();

        registry.register(&SessionKey::new("u1", "s1"), a.clone()).await;
        registry.register(&SessionKey::new("u1", "s2"), b.clone()).await;
        registry.register(&SessionKey::new("u2", "s1"), other.clone()).await;

        registry.close_all("u1").await;

        assert_eq!(a.close_count(), 1);
        assert_eq!(b.close_count(), 1);
        assert_eq!(other.close_count(), 0);
        assert_eq!(registry.len().await, 1);
    }
}
