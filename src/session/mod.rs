//! TTL key-value session store.
//!
//! Values live in an origin-wide [`KvBackend`] as `{value, expiry}` records. A
//! record past its expiry is evicted on read, and only explicit touches extend
//! it. Every write also bumps a `<key>__update` or `<key>__touch` marker and is
//! announced on a [`ChangeBus`] so other contexts can follow along.

pub mod backend;
pub mod errors;
pub mod notify;
pub mod record;
pub mod sqlite_backend;
pub mod store;
pub mod synced;

pub use backend::{KvBackend, MemoryBackend, StoreFuture};
pub use errors::{SessionError, SessionResult};
pub use notify::{ChangeBus, ChangeEvent, ChangeKind, MarkerPoller};
pub use record::SessionRecord;
pub use sqlite_backend::SqliteBackend;
pub use store::{ResponseStatus, TtlStore};
pub use synced::SyncedValue;
