use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;
#[cfg(test)]
use crate::bson::Document;

/// A LIFO pool of server sessions. Checking out returns the most recently used session, which
/// is the one most likely to still be warm in the server's session cache.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool, skipping any sessions close enough to
    /// expiration that the server may have already discarded them. Creates a fresh session
    /// when none survive.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks a server session back into the pool. Dirty and nearly-expired sessions are
    /// discarded rather than reused; expired sessions already in the pool are trimmed from the
    /// cold end.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;

        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// Drains the pool, returning all session documents for an endSessions sweep.
    pub(crate) async fn drain(&self) -> Vec<ServerSession> {
        self.pool.lock().await.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[tokio::test]
    async fn pool_is_lifo() {
        let pool = ServerSessionPool::new();

        let first = ServerSession::new();
        let second = ServerSession::new();
        let first_id = first.id.clone();
        let second_id = second.id.clone();

        pool.check_in(first, TIMEOUT).await;
        pool.check_in(second, TIMEOUT).await;

        // The most recently checked in session comes back first.
        let checked_out = pool.check_out(TIMEOUT).await;
        assert_eq!(checked_out.id, second_id);
        let checked_out = pool.check_out(TIMEOUT).await;
        assert_eq!(checked_out.id, first_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        let mut session = ServerSession::new();
        session.dirty = true;
        let id = session.id.clone();

        pool.check_in(session, TIMEOUT).await;
        assert!(!pool.contains(&id).await);
    }

    #[tokio::test]
    async fn nearly_expired_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        let session = ServerSession::new();
        let id = session.id.clone();

        // With a 30-second timeout, a fresh session is within the one minute guard band of
        // expiry and must not be pooled.
        pool.check_in(session, Some(Duration::from_secs(30))).await;
        assert!(!pool.contains(&id).await);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn check_out_creates_when_empty() {
        let pool = ServerSessionPool::new();
        let session = pool.check_out(TIMEOUT).await;
        assert_eq!(session.txn_number, 0);
        assert!(!session.dirty);
    }
}
