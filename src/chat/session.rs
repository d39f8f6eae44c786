//! The chat session id, stored under a fixed key with a five minute TTL.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::session::{ResponseStatus, SessionResult, SyncedValue, TtlStore};

/// Store key holding the session id.
pub const SESSION_KEY: &str = "chat_session_id";

/// Session lifetime, extended on every successful exchange.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Typed view of the chat session id.
pub struct ChatSession {
    id: SyncedValue<String>,
}

impl ChatSession {
    /// Open this context's view of the session id.
    pub async fn open(store: TtlStore) -> Self {
        Self {
            id: SyncedValue::open(store, SESSION_KEY, SESSION_TTL).await,
        }
    }

    /// Current session id, read through the store so an expired id is dropped.
    pub async fn current_id(&self) -> Option<String> {
        self.id.refresh().await;
        self.id.value()
    }

    /// Adopt and persist a session id.
    ///
    /// # Errors
    /// Returns an error if the id cannot be stored.
    pub async fn set_id(&self, id: impl Into<String>) -> SessionResult<()> {
        self.id.save(id.into()).await
    }

    /// Forget the session id.
    ///
    /// # Errors
    /// Returns an error if the record cannot be removed.
    pub async fn clear_id(&self) -> SessionResult<()> {
        self.id.clear().await
    }

    /// Extend the session lifetime. Returns `false` if no live session exists.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn refresh(&self) -> SessionResult<bool> {
        self.id.touch().await
    }

    /// Observe session id changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.id.subscribe()
    }

    /// Run `operation`, clearing the session if it fails and extending it otherwise.
    ///
    /// # Errors
    /// Returns the failure that caused the session to be cleared.
    pub async fn touch_on_success<F, Fut, R, E>(&self, operation: F) -> SessionResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: ResponseStatus,
        E: Display,
    {
        self.id.touch_on_success(operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::{ChangeBus, MemoryBackend};
    use std::sync::Arc;

    fn store(clock: Arc<ManualClock>) -> TtlStore {
        TtlStore::with_clock(Arc::new(MemoryBackend::new()), ChangeBus::default(), clock)
    }

    #[tokio::test]
    async fn test_set_and_clear() {
        let session = ChatSession::open(store(Arc::new(ManualClock::new(0)))).await;
        assert_eq!(session.current_id().await, None);

        session.set_id("abc").await.unwrap();
        assert_eq!(session.current_id().await.as_deref(), Some("abc"));

        session.clear_id().await.unwrap();
        assert_eq!(session.current_id().await, None);
    }

    #[tokio::test]
    async fn test_expires_after_five_minutes() {
        let clock = Arc::new(ManualClock::new(0));
        let session = ChatSession::open(store(Arc::clone(&clock))).await;
        session.set_id("abc").await.unwrap();

        clock.advance(Duration::from_secs(4 * 60));
        assert!(session.refresh().await.unwrap());

        clock.advance(Duration::from_secs(4 * 60));
        assert_eq!(session.current_id().await.as_deref(), Some("abc"));

        clock.advance(Duration::from_secs(2 * 60));
        assert_eq!(session.current_id().await, None);
        assert!(!session.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_current_id_drops_idle_session_without_notification() {
        let clock = Arc::new(ManualClock::new(0));
        let session = ChatSession::open(store(Arc::clone(&clock))).await;
        session.set_id("abc").await.unwrap();
        let updates = session.subscribe();

        clock.advance(SESSION_TTL + Duration::from_secs(1));

        assert_eq!(session.current_id().await, None);
        assert_eq!(*updates.borrow(), None);
    }

    #[tokio::test]
    async fn test_failed_operation_clears_id() {
        let session = ChatSession::open(store(Arc::new(ManualClock::new(0)))).await;
        session.set_id("abc").await.unwrap();

        let result = session
            .touch_on_success(|| async { Err::<(), _>("upstream down") })
            .await;

        assert!(result.is_err());
        assert_eq!(session.current_id().await, None);
    }
}
