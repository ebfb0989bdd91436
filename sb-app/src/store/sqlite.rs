use super::{Expect, KeyedStore, Result, StoreError, Versioned, expiry};
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    version    INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
CREATE TABLE IF NOT EXISTS kv_seq (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    next INTEGER NOT NULL
);
INSERT OR IGNORE INTO kv_seq (id, next) VALUES (1, 1);
"#;

/// Store shared by every worker process that opens the same database file.
///
/// Each mutation runs in a `BEGIN IMMEDIATE` transaction, which takes the
/// database write lock up front; read-compare-write therefore cannot
/// interleave across processes. Versions come from a single sequence row so
/// a deleted and recreated key never repeats a version.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(busy_timeout).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
            op(&mut guard).map_err(backend)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl KeyedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let key = key.to_string();
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value, version, expires_at FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| {
                    Ok(Versioned {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                        expires_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn put_if(
        &self,
        key: &str,
        expect: Expect,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let key = key.to_string();
        let value = value.to_string();
        let now = self.clock.now();
        let expires_at = millis(expiry(now, ttl));
        let now = millis(now);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM kv WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            let holds = match (expect, current) {
                (Expect::Absent, None) => true,
                (Expect::Version(want), Some(have)) => have as u64 == want,
                _ => false,
            };
            if !holds {
                return Ok(None);
            }
            let version: i64 =
                tx.query_row("SELECT next FROM kv_seq WHERE id = 1", [], |row| row.get(0))?;
            tx.execute("UPDATE kv_seq SET next = next + 1 WHERE id = 1", [])?;
            tx.execute(
                "INSERT INTO kv (key, value, version, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    version = excluded.version,
                    expires_at = excluded.expires_at",
                params![key, value, version, expires_at],
            )?;
            tx.commit()?;
            Ok(Some(version as u64))
        })
        .await
    }

    async fn delete_if(&self, key: &str, version: u64) -> Result<bool> {
        let key = key.to_string();
        let now = millis(self.clock.now());
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND version = ?2 AND expires_at > ?3",
                params![key, version as i64, now],
            )?;
            tx.commit()?;
            Ok(removed == 1)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = millis(self.clock.now());
        self.with_conn(move |conn| conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now]))
            .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
