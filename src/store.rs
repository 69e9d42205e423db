//! Queue persistence adapter
//!
//! Snapshot/restore of queue items to a key-value store, keyed
//! `queue_item:<id>` with a JSON value. Terminal items carry an expiry
//! (default 7 days) and are dropped on load and by [`purge_expired`].
//! Backed by SQLite when a store URL is configured, otherwise by an
//! in-memory map with identical semantics. Persistence is best-effort and
//! idempotent at the item level; it is not a durability guarantee.
//!
//! [`purge_expired`]: QueueStore::purge_expired

use crate::error::{Error, Result, StoreError};
use crate::types::{ItemId, QueueItem};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

const KEY_PREFIX: &str = "queue_item:";

fn item_key(id: &ItemId) -> String {
    format!("{KEY_PREFIX}{id}")
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    value: String,
    expires_at: Option<i64>,
}

enum Backend {
    Sqlite(SqlitePool),
    Memory(std::sync::Mutex<HashMap<String, MemoryRecord>>),
}

/// Key-value store for queue item records
pub struct QueueStore {
    backend: Backend,
    terminal_ttl_seconds: i64,
}

impl QueueStore {
    /// Open a SQLite-backed store at the given URL or path
    ///
    /// Accepts either a `sqlite:` URL or a bare filesystem path. The file is
    /// created if missing.
    pub async fn open(url: &str, terminal_ttl_days: u32) -> Result<Self> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite:{url}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| {
                Error::Store(StoreError::ConnectionFailed(format!(
                    "invalid store url '{url}': {e}"
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Store(StoreError::ConnectionFailed(format!(
                "failed to connect to queue store: {e}"
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::ConnectionFailed(format!(
                "failed to create queue_items table: {e}"
            )))
        })?;

        Ok(Self {
            backend: Backend::Sqlite(pool),
            terminal_ttl_seconds: i64::from(terminal_ttl_days) * 86_400,
        })
    }

    /// Create a purely in-memory store
    pub fn in_memory(terminal_ttl_days: u32) -> Self {
        Self {
            backend: Backend::Memory(std::sync::Mutex::new(HashMap::new())),
            terminal_ttl_seconds: i64::from(terminal_ttl_days) * 86_400,
        }
    }

    /// Whether this store survives a process restart
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Sqlite(_))
    }

    /// Write an item record through to the store
    ///
    /// Terminal items get an expiry stamp; non-terminal items never expire.
    pub async fn put_item(&self, item: &QueueItem) -> Result<()> {
        let key = item_key(&item.id);
        let value = serde_json::to_string(item)?;
        let now = Utc::now().timestamp();
        let expires_at = item
            .is_terminal()
            .then_some(now + self.terminal_ttl_seconds);

        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO queue_items (key, value, updated_at, expires_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = ?, updated_at = ?, expires_at = ?
                    "#,
                )
                .bind(&key)
                .bind(&value)
                .bind(now)
                .bind(expires_at)
                .bind(&value)
                .bind(now)
                .bind(expires_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    Error::Store(StoreError::QueryFailed(format!(
                        "failed to save item {key}: {e}"
                    )))
                })?;
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.insert(key, MemoryRecord { value, expires_at });
            }
        }

        Ok(())
    }

    /// Fetch a single item record
    pub async fn get_item(&self, id: &ItemId) -> Result<Option<QueueItem>> {
        let key = item_key(id);
        let now = Utc::now().timestamp();

        let raw: Option<String> = match &self.backend {
            Backend::Sqlite(pool) => sqlx::query_scalar(
                r#"
                SELECT value FROM queue_items
                WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(&key)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(|e| {
                Error::Store(StoreError::QueryFailed(format!(
                    "failed to load item {key}: {e}"
                )))
            })?,
            Backend::Memory(map) => {
                let map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.get(&key)
                    .filter(|r| r.expires_at.is_none_or(|exp| exp > now))
                    .map(|r| r.value.clone())
            }
        };

        match raw {
            Some(json) => {
                let item = serde_json::from_str(&json).map_err(|e| {
                    Error::Store(StoreError::CorruptRecord {
                        key,
                        reason: e.to_string(),
                    })
                })?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Load every unexpired item record
    ///
    /// Corrupt records are logged and skipped rather than failing the load.
    pub async fn load_items(&self) -> Result<Vec<QueueItem>> {
        let now = Utc::now().timestamp();

        let rows: Vec<(String, String)> = match &self.backend {
            Backend::Sqlite(pool) => sqlx::query_as(
                r#"
                SELECT key, value FROM queue_items
                WHERE expires_at IS NULL OR expires_at > ?
                "#,
            )
            .bind(now)
            .fetch_all(pool)
            .await
            .map_err(|e| {
                Error::Store(StoreError::QueryFailed(format!(
                    "failed to load queue items: {e}"
                )))
            })?,
            Backend::Memory(map) => {
                let map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.iter()
                    .filter(|(_, r)| r.expires_at.is_none_or(|exp| exp > now))
                    .map(|(k, r)| (k.clone(), r.value.clone()))
                    .collect()
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        for (key, json) in rows {
            match serde_json::from_str::<QueueItem>(&json) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping corrupt queue item record");
                }
            }
        }

        Ok(items)
    }

    /// Delete an item record
    pub async fn delete_item(&self, id: &ItemId) -> Result<()> {
        let key = item_key(id);
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("DELETE FROM queue_items WHERE key = ?")
                    .bind(&key)
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        Error::Store(StoreError::QueryFailed(format!(
                            "failed to delete item {key}: {e}"
                        )))
                    })?;
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.remove(&key);
            }
        }
        Ok(())
    }

    /// Drop all expired records, returning how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result =
                    sqlx::query("DELETE FROM queue_items WHERE expires_at IS NOT NULL AND expires_at <= ?")
                        .bind(now)
                        .execute(pool)
                        .await
                        .map_err(|e| {
                            Error::Store(StoreError::QueryFailed(format!(
                                "failed to purge expired items: {e}"
                            )))
                        })?;
                Ok(result.rows_affected())
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let before = map.len();
                map.retain(|_, r| r.expires_at.is_none_or(|exp| exp > now));
                Ok((before - map.len()) as u64)
            }
        }
    }

    #[cfg(test)]
    async fn put_raw(&self, key: &str, value: &str, expires_at: Option<i64>) {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO queue_items (key, value, updated_at, expires_at) VALUES (?, ?, ?, ?)",
                )
                .bind(key)
                .bind(value)
                .bind(Utc::now().timestamp())
                .bind(expires_at)
                .execute(pool)
                .await
                .ok();
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.insert(
                    key.to_string(),
                    MemoryRecord {
                        value: value.to_string(),
                        expires_at,
                    },
                );
            }
        }
    }
}
