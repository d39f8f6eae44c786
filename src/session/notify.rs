//! Change notification between contexts sharing one store.
//!
//! In-process contexts are notified through a broadcast [`ChangeBus`]. Writers in
//! other processes are picked up by a [`MarkerPoller`], which watches the
//! `<key>__update` / `<key>__touch` marker items and republishes their changes on
//! the local bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::backend::KvBackend;

/// Default buffered notifications per subscriber.
const DEFAULT_CAPACITY: usize = 64;

/// Marker key signalling a value change (set or clear).
#[must_use]
pub fn update_marker(key: &str) -> String {
    format!("{key}__update")
}

/// Marker key signalling an expiry extension.
#[must_use]
pub fn touch_marker(key: &str) -> String {
    format!("{key}__touch")
}

/// What happened to a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Value written or cleared.
    Update,
    /// Expiry extended, value untouched.
    Touch,
}

/// A change notification for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Store key the change applies to.
    pub key: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Context that made the change; `Uuid::nil()` for changes seen through markers.
    pub origin: Uuid,
}

/// Publish/subscribe channel shared by every context of one origin.
#[derive(Clone, Debug)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeBus {
    /// Create a bus buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a change. Having no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            debug!("No session change subscribers");
        }
    }

    /// Subscribe to future changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

/// Polls marker items written by other processes and republishes them locally.
pub struct MarkerPoller {
    backend: Arc<dyn KvBackend>,
    bus: ChangeBus,
    key: String,
    interval: Duration,
    shutdown: CancellationToken,
}

impl MarkerPoller {
    /// Create a poller for `key`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn KvBackend>,
        bus: ChangeBus,
        key: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            bus,
            key: key.into(),
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the poller when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the poller as a tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(key = %self.key, interval = ?self.interval, "Starting session marker poller");
        let update_key = update_marker(&self.key);
        let touch_key = touch_marker(&self.key);
        let mut last_update = self.read_marker(&update_key).await;
        let mut last_touch = self.read_marker(&touch_key).await;

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {
                    let update = self.read_marker(&update_key).await;
                    if update != last_update {
                        last_update = update;
                        self.publish(ChangeKind::Update);
                    }
                    let touch = self.read_marker(&touch_key).await;
                    if touch != last_touch {
                        last_touch = touch;
                        self.publish(ChangeKind::Touch);
                    }
                }
                () = self.shutdown.cancelled() => {
                    debug!(key = %self.key, "Session marker poller shutting down");
                    break;
                }
            }
        }
    }

    async fn read_marker(&self, marker: &str) -> Option<String> {
        match self.backend.get_item(marker).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%marker, %err, "Failed to read session marker");
                None
            }
        }
    }

    fn publish(&self, kind: ChangeKind) {
        self.bus.publish(ChangeEvent {
            key: self.key.clone(),
            kind,
            origin: Uuid::nil(),
        });
    }
}
