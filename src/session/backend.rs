//! Raw string storage backends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::session::errors::SessionResult;

/// Boxed future type for backend operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Origin-scoped string storage, shaped like a browser's local storage.
pub trait KvBackend: Send + Sync {
    /// Read a raw item.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_item(&self, key: &str) -> StoreFuture<'_, SessionResult<Option<String>>>;
    /// Write a raw item, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn set_item(&self, key: &str, value: &str) -> StoreFuture<'_, SessionResult<()>>;
    /// Remove an item. Removing a missing item succeeds.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn remove_item(&self, key: &str) -> StoreFuture<'_, SessionResult<()>>;
}

/// In-process backend. Clones share the same map, so several contexts can
/// observe one origin.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    items: Arc<DashMap<String, String>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items, markers included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn get_item(&self, key: &str) -> StoreFuture<'_, SessionResult<Option<String>>> {
        let value = self.items.get(key).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn set_item(&self, key: &str, value: &str) -> StoreFuture<'_, SessionResult<()>> {
        self.items.insert(key.to_string(), value.to_string());
        Box::pin(async { Ok(()) })
    }

    fn remove_item(&self, key: &str) -> StoreFuture<'_, SessionResult<()>> {
        self.items.remove(key);
        Box::pin(async { Ok(()) })
    }
}
