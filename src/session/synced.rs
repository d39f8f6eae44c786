//! One context's live view of a single store key.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::errors::SessionResult;
use crate::session::notify::ChangeKind;
use crate::session::store::{ResponseStatus, TtlStore};

/// Cached value of one key, kept in sync with changes made by other contexts.
///
/// A listener task follows the store's [`crate::session::ChangeBus`]: an update
/// from another context makes this view re-read and adopt the stored value
/// (possibly `None`); a touch re-reads and adopts only while a live record exists.
pub struct SyncedValue<T> {
    store: TtlStore,
    key: String,
    ttl: Duration,
    value: Arc<watch::Sender<Option<T>>>,
    listener: JoinHandle<()>,
}

impl<T> SyncedValue<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Load the current value of `key` and start following changes.
    pub async fn open(store: TtlStore, key: impl Into<String>, ttl: Duration) -> Self {
        let key = key.into();
        let initial = read_or_none(&store, &key).await;
        let (tx, _) = watch::channel(initial);
        let value = Arc::new(tx);
        let listener = spawn_listener(store.clone(), key.clone(), Arc::clone(&value));

        Self {
            store,
            key,
            ttl,
            value,
            listener,
        }
    }

    /// Key this view follows.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current cached value.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    /// Observe value changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.value.subscribe()
    }

    /// Persist a new value. The cached value is adopted even if storage fails.
    ///
    /// # Errors
    /// Returns an error if the value cannot be stored.
    pub async fn save(&self, value: T) -> SessionResult<()> {
        let result = self.store.set(&self.key, &value, self.ttl).await;
        adopt(&self.value, Some(value));
        result
    }

    /// Drop the stored value.
    ///
    /// # Errors
    /// Returns an error if the record cannot be removed.
    pub async fn clear(&self) -> SessionResult<()> {
        let result = self.store.clear(&self.key).await;
        adopt(&self.value, None);
        result
    }

    /// Extend the expiry. Returns `false` when there was nothing to extend.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn touch(&self) -> SessionResult<bool> {
        self.store.touch(&self.key, self.ttl).await
    }

    /// Re-read the store and adopt whatever is there.
    pub async fn refresh(&self) {
        let current = read_or_none(&self.store, &self.key).await;
        adopt(&self.value, current);
    }

    /// [`TtlStore::touch_on_success`] bound to this key, keeping the cached
    /// value in step when the session is cleared.
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
        let result = self.store.touch_on_success(&self.key, self.ttl, operation).await;
        if result.is_err() {
            adopt(&self.value, None);
        }
        result
    }
}

impl<T> Drop for SyncedValue<T> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn adopt<T: PartialEq>(slot: &watch::Sender<Option<T>>, next: Option<T>) {
    slot.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn read_or_none<T: DeserializeOwned>(store: &TtlStore, key: &str) -> Option<T> {
    match store.get(key).await {
        Ok(value) => value,
        Err(err) => {
            warn!(%key, %err, "Failed to read session");
            None
        }
    }
}

fn spawn_listener<T>(store: TtlStore, key: String, value: Arc<watch::Sender<Option<T>>>) -> JoinHandle<()>
where
    T: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static,
{
    let mut rx = store.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.key == key && event.origin != store.context_id() => {
                    let current: Option<T> = read_or_none(&store, &key).await;
                    match event.kind {
                        ChangeKind::Update => adopt(&value, current),
                        ChangeKind::Touch => {
                            if current.is_some() {
                                adopt(&value, current);
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%key, skipped, "Session listener lagged, re-reading");
                    let current: Option<T> = read_or_none(&store, &key).await;
                    adopt(&value, current);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::backend::MemoryBackend;
    use crate::session::notify::{ChangeBus, MarkerPoller};

    const TTL: Duration = Duration::from_secs(300);

    fn shared_store() -> (TtlStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = TtlStore::with_clock(Arc::new(MemoryBackend::new()), ChangeBus::default(), clock.clone());
        (store, clock)
    }

    async fn wait_for<T: Clone + PartialEq>(rx: &mut watch::Receiver<Option<T>>, expected: Option<T>) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| *v == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_context_adopts_saved_value() {
        let (store, _clock) = shared_store();
        let tab_a: SyncedValue<String> = SyncedValue::open(store.clone(), "k", TTL).await;
        let tab_b: SyncedValue<String> = SyncedValue::open(store.fork(), "k", TTL).await;
        let mut rx_b = tab_b.subscribe();

        tab_a.save("s-1".to_string()).await.unwrap();
        wait_for(&mut rx_b, Some("s-1".to_string())).await;

        tab_a.clear().await.unwrap();
        wait_for(&mut rx_b, None).await;
        assert!(tab_a.value().is_none());
    }

    #[tokio::test]
    async fn test_open_reads_existing_value() {
        let (store, _clock) = shared_store();
        store.set("k", "s-9", TTL).await.unwrap();

        let view: SyncedValue<String> = SyncedValue::open(store.fork(), "k", TTL).await;
        assert_eq!(view.value().as_deref(), Some("s-9"));
    }

    #[tokio::test]
    async fn test_touch_from_other_context_keeps_value_when_expired() {
        let (store, clock) = shared_store();
        let tab_a: SyncedValue<String> = SyncedValue::open(store.clone(), "k", TTL).await;
        let tab_b: SyncedValue<String> = SyncedValue::open(store.fork(), "k", TTL).await;
        let mut rx_b = tab_b.subscribe();

        tab_a.save("s-1".to_string()).await.unwrap();
        wait_for(&mut rx_b, Some("s-1".to_string())).await;

        clock.advance(TTL + Duration::from_secs(1));
        assert!(!tab_a.touch().await.unwrap());
        assert_eq!(tab_b.value().as_deref(), Some("s-1"));

        tab_b.refresh().await;
        assert!(tab_b.value().is_none());
    }

    #[tokio::test]
    async fn test_touch_from_other_context_adopts_live_value() {
        let (store, _clock) = shared_store();
        let tab_a: SyncedValue<String> = SyncedValue::open(store.clone(), "k", TTL).await;
        let tab_b: SyncedValue<String> = SyncedValue::open(store.fork(), "k", TTL).await;
        let mut rx_b = tab_b.subscribe();

        tab_a.save("s-1".to_string()).await.unwrap();
        wait_for(&mut rx_b, Some("s-1".to_string())).await;

        adopt(&tab_b.value, Some("stale".to_string()));
        assert_eq!(tab_b.value().as_deref(), Some("stale"));

        assert!(tab_a.touch().await.unwrap());
        wait_for(&mut rx_b, Some("s-1".to_string())).await;
    }

    #[tokio::test]
    async fn test_marker_update_from_other_process_reaches_view() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(MemoryBackend::new());
        let writer = TtlStore::with_clock(backend.clone(), ChangeBus::default(), clock.clone());
        let local_bus = ChangeBus::default();
        let reader = TtlStore::with_clock(backend.clone(), local_bus.clone(), clock.clone());

        let view: SyncedValue<String> = SyncedValue::open(reader, "k", TTL).await;
        let mut rx = view.subscribe();
        let poller = MarkerPoller::new(backend, local_bus, "k", Duration::from_millis(10));
        let shutdown = poller.shutdown_token();
        let handle = poller.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;

        clock.advance(Duration::from_secs(1));
        writer.set("k", "s-1", TTL).await.unwrap();
        wait_for(&mut rx, Some("s-1".to_string())).await;

        clock.advance(Duration::from_secs(1));
        writer.clear("k").await.unwrap();
        wait_for(&mut rx, None).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_touch_on_success_failure_resets_cached_value() {
        let (store, _clock) = shared_store();
        let view: SyncedValue<String> = SyncedValue::open(store, "k", TTL).await;
        view.save("s-1".to_string()).await.unwrap();

        let result = view.touch_on_success(|| async { Err::<(), _>("boom") }).await;
        assert!(result.is_err());
        assert!(view.value().is_none());
    }
}
