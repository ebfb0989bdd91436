use crate::store::{self, Expect, KeyedStore, MAX_CAS_ATTEMPTS, StoreError};
use chrono::{DateTime, Utc};
use sb_channels::ConversationKey;
use sb_llm::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            at,
        }
    }

    pub fn assistant(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            at,
        }
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Bounded per-conversation dialogue log shared by all workers.
pub struct HistoryStore {
    store: Arc<dyn KeyedStore>,
    max_messages: usize,
    ttl: Duration,
}

fn storage_key(key: &ConversationKey) -> String {
    format!("hist:{}", key.storage_key())
}

impl HistoryStore {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        max_messages: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            max_messages: max_messages.max(1),
            ttl,
        }
    }

    pub async fn load(&self, key: &ConversationKey) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(
            store::get_json::<Vec<HistoryEntry>>(self.store.as_ref(), &storage_key(key))
                .await?
                .map(|(entries, _)| entries)
                .unwrap_or_default(),
        )
    }

    /// Append entries, keeping only the newest `max_messages`.
    pub async fn append(
        &self,
        key: &ConversationKey,
        entries: &[HistoryEntry],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let storage = storage_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut log, expect) =
                match store::get_json::<Vec<HistoryEntry>>(self.store.as_ref(), &storage).await? {
                    Some((log, version)) => (log, Expect::Version(version)),
                    None => (Vec::new(), Expect::Absent),
                };
            log.extend_from_slice(entries);
            if log.len() > self.max_messages {
                log.drain(..log.len() - self.max_messages);
            }
            if store::put_json(self.store.as_ref(), &storage, expect, &log, self.ttl)
                .await?
                .is_some()
            {
                return Ok(());
            }
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn keeps_the_newest_messages() {
        let clock = Arc::new(ManualClock::new());
        let history = HistoryStore::new(
            Arc::new(MemoryStore::new(clock.clone())),
            3,
            Duration::from_secs(3600),
        );
        let key = ConversationKey::new("salon-1", "79123456789");
        let now = clock.now();
        history
            .append(&key, &[HistoryEntry::user("one", now), HistoryEntry::assistant("two", now)])
            .await
            .expect("append");
        history
            .append(&key, &[HistoryEntry::user("three", now), HistoryEntry::assistant("four", now)])
            .await
            .expect("append");

        let log = history.load(&key).await.expect("load");
        let contents: Vec<_> = log.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three", "four"]);
        assert_eq!(log[0].to_chat(), ChatMessage::assistant("two"));
    }
}
