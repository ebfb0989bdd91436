use super::{Expect, KeyedStore, Result, Versioned, expiry};
use crate::clock::Clock;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Single-process store. Per-key atomicity comes from the map's shard lock,
/// so concurrent tasks still observe strict compare-and-set semantics.
pub struct MemoryStore {
    records: DashMap<String, Versioned>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(key)
            .filter(|record| record.expires_at > now)
            .map(|record| record.clone()))
    }

    async fn put_if(
        &self,
        key: &str,
        expect: Expect,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let now = self.clock.now();
        let fresh = |version| Versioned {
            value: value.to_string(),
            version,
            expires_at: expiry(now, ttl),
        };
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                if expect != Expect::Absent {
                    return Ok(None);
                }
                let version = self.bump();
                slot.insert(fresh(version));
                Ok(Some(version))
            }
            Entry::Occupied(mut slot) => {
                let live = slot.get().expires_at > now;
                let holds = match expect {
                    Expect::Absent => !live,
                    Expect::Version(v) => live && slot.get().version == v,
                };
                if !holds {
                    return Ok(None);
                }
                let version = self.bump();
                slot.insert(fresh(version));
                Ok(Some(version))
            }
        }
    }

    async fn delete_if(&self, key: &str, version: u64) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .records
            .remove_if(key, |_, record| {
                record.version == version && record.expires_at > now
            })
            .is_some())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(before.saturating_sub(self.records.len()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
