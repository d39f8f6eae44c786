//! `SQLite` backend so a session survives process restarts and can be shared
//! between processes pointed at the same file.

use std::path::Path;

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::session::backend::{KvBackend, StoreFuture};
use crate::session::errors::SessionResult;

/// `SQLite` implementation of [`KvBackend`].
pub struct SqliteBackend {
    conn: Connection,
    table: String,
}

impl SqliteBackend {
    /// Table name for stored items.
    pub const DEFAULT_TABLE: &'static str = "folio_kv";

    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::with_connection(conn).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> SessionResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> SessionResult<Self> {
        let table = Self::DEFAULT_TABLE.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

impl KvBackend for SqliteBackend {
    fn get_item(&self, key: &str) -> StoreFuture<'_, SessionResult<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let table = self.table.clone();
            let value = self
                .conn
                .call(move |conn| {
                    let value = conn
                        .query_row(
                            &format!("SELECT value FROM {table} WHERE key = ?1"),
                            rusqlite::params![key],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?;
                    Ok(value)
                })
                .await?;
            Ok(value)
        })
    }

    fn set_item(&self, key: &str, value: &str) -> StoreFuture<'_, SessionResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let table = self.table.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)"),
                        rusqlite::params![key, value],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> StoreFuture<'_, SessionResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let table = self.table.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE key = ?1"),
                        rusqlite::params![key],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_backend_set_get_remove() {
        let backend = SqliteBackend::open_in_memory().await.unwrap();

        assert!(backend.get_item("k").await.unwrap().is_none());
        backend.set_item("k", "one").await.unwrap();
        backend.set_item("k", "two").await.unwrap();
        assert_eq!(backend.get_item("k").await.unwrap().as_deref(), Some("two"));

        backend.remove_item("k").await.unwrap();
        assert!(backend.get_item("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");

        {
            let backend = SqliteBackend::open(&path).await.unwrap();
            backend.set_item("chat_session_id", "{}").await.unwrap();
        }

        let reopened = SqliteBackend::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_item("chat_session_id").await.unwrap().as_deref(),
            Some("{}")
        );
    }
}
