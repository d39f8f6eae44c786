//! TTL key-value store over a [`KvBackend`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, duration_ms};
use crate::session::backend::KvBackend;
use crate::session::errors::{SessionError, SessionResult};
use crate::session::notify::{ChangeBus, ChangeEvent, ChangeKind, touch_marker, update_marker};
use crate::session::record::SessionRecord;

/// Anything that can report whether a remote call succeeded.
///
/// Both accessors default to "not exposed"; a type only reports what it has.
pub trait ResponseStatus {
    /// Boolean success flag, if the result carries one.
    fn ok_flag(&self) -> Option<bool> {
        None
    }

    /// Numeric status, if the result carries one.
    fn status_code(&self) -> Option<i64> {
        None
    }
}

impl ResponseStatus for () {}

impl ResponseStatus for Value {
    fn ok_flag(&self) -> Option<bool> {
        self.get("ok").and_then(Value::as_bool)
    }

    fn status_code(&self) -> Option<i64> {
        self.get("status").and_then(Value::as_i64)
    }
}

impl ResponseStatus for reqwest::Response {
    fn ok_flag(&self) -> Option<bool> {
        Some(self.status().is_success())
    }

    fn status_code(&self) -> Option<i64> {
        Some(i64::from(self.status().as_u16()))
    }
}

/// One context's handle on a TTL store.
///
/// Clones share the context id; use [`TtlStore::fork`] for a new context over
/// the same backend and bus.
#[derive(Clone)]
pub struct TtlStore {
    backend: Arc<dyn KvBackend>,
    bus: ChangeBus,
    clock: Arc<dyn Clock>,
    context: Uuid,
}

impl TtlStore {
    /// Create a store using the system clock.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, bus: ChangeBus) -> Self {
        Self::with_clock(backend, bus, Arc::new(SystemClock))
    }

    /// Create a store with an explicit clock.
    #[must_use]
    pub fn with_clock(backend: Arc<dyn KvBackend>, bus: ChangeBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            bus,
            clock,
            context: Uuid::new_v4(),
        }
    }

    /// A new context over the same backend, bus and clock.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            bus: self.bus.clone(),
            clock: Arc::clone(&self.clock),
            context: Uuid::new_v4(),
        }
    }

    /// Id of this context, carried on every notification it publishes.
    #[must_use]
    pub const fn context_id(&self) -> Uuid {
        self.context
    }

    /// Notification bus shared with the other contexts.
    #[must_use]
    pub const fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Read a live value.
    ///
    /// Missing, malformed, expired or mistyped records yield `None`; all but
    /// the missing case are evicted.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> SessionResult<Option<T>> {
        let Some(record) = self.read_live(key).await? else {
            return Ok(None);
        };
        if record.value.is_null() {
            return Ok(None);
        }
        match serde_json::from_value(record.value) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(%key, %err, "Stored session value has an unexpected shape, evicting");
                self.backend.remove_item(key).await?;
                Ok(None)
            }
        }
    }

    /// Write `value` with a fresh expiry and notify the other contexts.
    ///
    /// # Errors
    /// Returns an error if the value cannot be serialized or stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> SessionResult<()> {
        let record = SessionRecord::new(serde_json::to_value(value)?, self.clock.now_ms(), duration_ms(ttl));
        self.backend.set_item(key, &record.encode()?).await?;
        self.notify(key, ChangeKind::Update).await;
        Ok(())
    }

    /// Extend the expiry of a live record without touching its value.
    ///
    /// Returns `false` (and writes nothing) when there is no live record.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn touch(&self, key: &str, ttl: Duration) -> SessionResult<bool> {
        let Some(mut record) = self.read_live(key).await? else {
            debug!(%key, "Touch skipped, no live session");
            return Ok(false);
        };
        record.expiry = self.clock.now_ms().saturating_add(duration_ms(ttl));
        self.backend.set_item(key, &record.encode()?).await?;
        self.notify(key, ChangeKind::Touch).await;
        Ok(true)
    }

    /// Remove the record and notify the other contexts.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn clear(&self, key: &str) -> SessionResult<()> {
        self.backend.remove_item(key).await?;
        self.notify(key, ChangeKind::Update).await;
        Ok(())
    }

    /// Run `operation` and tie the session's liveness to its outcome.
    ///
    /// The session is cleared and an error returned if the operation fails, its
    /// result reports `ok == false`, or its status falls outside `[200, 300)`.
    /// Otherwise the session is touched and the result returned unchanged.
    ///
    /// # Errors
    /// Returns the failure that caused the session to be cleared.
    pub async fn touch_on_success<F, Fut, R, E>(&self, key: &str, ttl: Duration, operation: F) -> SessionResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: ResponseStatus,
        E: Display,
    {
        let failure = match operation().await {
            Ok(response) => match check_response(&response) {
                Ok(()) => {
                    self.touch(key, ttl).await?;
                    return Ok(response);
                }
                Err(err) => err,
            },
            Err(err) => SessionError::Operation(err.to_string()),
        };

        warn!(%key, error = %failure, "API call failed, clearing session");
        if let Err(err) = self.clear(key).await {
            warn!(%key, %err, "Failed to clear session after API failure");
        }
        Err(failure)
    }

    async fn read_live(&self, key: &str) -> SessionResult<Option<SessionRecord>> {
        let Some(raw) = self.backend.get_item(key).await? else {
            return Ok(None);
        };
        match SessionRecord::decode(&raw) {
            Some(record) if !record.is_expired(self.clock.now_ms()) => Ok(Some(record)),
            Some(_) => {
                debug!(%key, "Session expired, evicting");
                self.backend.remove_item(key).await?;
                Ok(None)
            }
            None => {
                warn!(%key, "Malformed session record, evicting");
                self.backend.remove_item(key).await?;
                Ok(None)
            }
        }
    }

    async fn notify(&self, key: &str, kind: ChangeKind) {
        let marker = match kind {
            ChangeKind::Update => update_marker(key),
            ChangeKind::Touch => touch_marker(key),
        };
        let stamp = self.clock.now_ms().to_string();
        if let Err(err) = self.backend.set_item(&marker, &stamp).await {
            warn!(%marker, %err, "Failed to notify other contexts");
        }
        self.bus.publish(ChangeEvent {
            key: key.to_string(),
            kind,
            origin: self.context,
        });
    }
}

fn check_response<R: ResponseStatus>(response: &R) -> SessionResult<()> {
    if response.ok_flag() == Some(false) {
        return Err(match response.status_code() {
            Some(status) => SessionError::Status(status),
            None => SessionError::NotOk,
        });
    }
    match response.status_code() {
        Some(status) if !(200..300).contains(&status) => Err(SessionError::Status(status)),
        _ => Ok(()),
    }
}
