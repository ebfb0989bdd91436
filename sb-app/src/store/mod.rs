//! Shared, TTL-capable keyed records.
//!
//! Every piece of cross-worker state (pending batches, intermediate
//! contexts, history) lives behind [`KeyedStore`]. All mutation is
//! compare-and-set on a per-key version, so correctness never depends on an
//! in-process lock.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("stored record is malformed: {0}")]
    Serialization(String),

    #[error("gave up after {attempts} conflicting updates to {key}")]
    Contention { key: String, attempts: usize },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Contention { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// No live record exists (an expired record counts as absent).
    Absent,
    /// The live record still has this version.
    Version(u64),
}

#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Live record for `key`; expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Atomic compare-and-set. Returns the new version, or `None` when the
    /// precondition did not hold.
    async fn put_if(
        &self,
        key: &str,
        expect: Expect,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<u64>>;

    /// Atomic compare-and-delete against a version previously read.
    async fn delete_if(&self, key: &str, version: u64) -> Result<bool>;

    /// Drop expired records; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;

    fn backend_name(&self) -> &'static str;
}

/// Upper bound for compare-and-set loops before reporting contention.
pub const MAX_CAS_ATTEMPTS: usize = 64;

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyedStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(record) => Ok(Some((serde_json::from_str(&record.value)?, record.version))),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn KeyedStore,
    key: &str,
    expect: Expect,
    value: &T,
    ttl: Duration,
) -> Result<Option<u64>> {
    let encoded = serde_json::to_string(value)?;
    store.put_if(key, expect, &encoded, ttl).await
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
