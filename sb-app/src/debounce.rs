//! Per-conversation debounce of inbound fragments.
//!
//! Customers split one request across several chat bubbles. Fragments for a
//! conversation accumulate in a shared pending batch; a batch becomes ready
//! once the quiet window has elapsed since its newest fragment, or once the
//! oldest fragment reaches the maximum batch age. Claiming a ready batch is
//! a compare-and-delete, so exactly one worker gets it.

use crate::clock::Clock;
use crate::store::{self, Expect, KeyedStore, MAX_CAS_ATTEMPTS, StoreError};
use chrono::{DateTime, Utc};
use sb_channels::{ChannelId, ConversationKey, MessageId, SenderId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub window: Duration,
    pub max_batch_age: Duration,
    pub joiner: String,
    /// Extra lifetime for a pending batch past the point it could have been
    /// claimed. Batches nobody claims within it are dropped.
    pub pending_grace: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2500),
            max_batch_age: Duration::from_secs(15),
            joiner: " ".to_string(),
            pending_grace: Duration::from_secs(60),
        }
    }
}

/// One inbound bubble, with enough routing data to answer it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub channel_id: ChannelId,
    /// Raw sender identifier as the channel delivered it; replies go here.
    pub sender_id: SenderId,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingBatch {
    fragments: Vec<Fragment>,
    first_at: DateTime<Utc>,
    last_at: DateTime<Utc>,
    #[serde(default)]
    deferrals: u32,
}

/// A claimed batch, merged into one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMessage {
    pub key: ConversationKey,
    pub text: String,
    pub fragments: Vec<Fragment>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    /// How many times this batch was put back because the conversation was busy.
    pub deferrals: u32,
}

impl MergedMessage {
    /// The newest fragment decides where the reply is delivered.
    pub fn reply_route(&self) -> Option<&Fragment> {
        self.fragments.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub fragments: usize,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Empty,
    NotReady { ready_at: DateTime<Utc> },
    Claimed(MergedMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub fragments: usize,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
}

pub struct DebounceBatcher {
    store: Arc<dyn KeyedStore>,
    clock: Arc<dyn Clock>,
    config: DebounceConfig,
}

fn storage_key(key: &ConversationKey) -> String {
    format!("batch:{}", key.storage_key())
}

impl DebounceBatcher {
    pub fn new(store: Arc<dyn KeyedStore>, clock: Arc<dyn Clock>, config: DebounceConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    fn ready_at(&self, batch: &PendingBatch) -> DateTime<Utc> {
        let quiet = store::expiry(batch.last_at, self.config.window);
        let forced = store::expiry(batch.first_at, self.config.max_batch_age);
        quiet.min(forced)
    }

    fn ttl(&self) -> Duration {
        self.config.max_batch_age + self.config.window + self.config.pending_grace
    }

    /// Append a fragment to the conversation's pending batch, creating it if
    /// needed. Fragments keep arrival order.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %key))]
    pub async fn ingest(
        &self,
        key: &ConversationKey,
        fragment: Fragment,
    ) -> Result<IngestReceipt, StoreError> {
        let storage = storage_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = store::get_json::<PendingBatch>(self.store.as_ref(), &storage).await?;
            let (batch, expect) = match current {
                Some((mut batch, version)) => {
                    batch.fragments.push(fragment.clone());
                    batch.last_at = now.max(batch.last_at);
                    (batch, Expect::Version(version))
                }
                None => (
                    PendingBatch {
                        fragments: vec![fragment.clone()],
                        first_at: now,
                        last_at: now,
                        deferrals: 0,
                    },
                    Expect::Absent,
                ),
            };
            if store::put_json(self.store.as_ref(), &storage, expect, &batch, self.ttl())
                .await?
                .is_some()
            {
                let receipt = IngestReceipt {
                    fragments: batch.fragments.len(),
                    ready_at: self.ready_at(&batch),
                };
                tracing::debug!(
                    fragments = receipt.fragments,
                    ready_at = %receipt.ready_at,
                    "fragment buffered"
                );
                return Ok(receipt);
            }
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Take the pending batch if it is ready. Losing a race to another
    /// worker, or to a newer fragment, re-evaluates the fresh state.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %key))]
    pub async fn claim(&self, key: &ConversationKey) -> Result<ClaimOutcome, StoreError> {
        let storage = storage_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((batch, version)) =
                store::get_json::<PendingBatch>(self.store.as_ref(), &storage).await?
            else {
                return Ok(ClaimOutcome::Empty);
            };
            let ready_at = self.ready_at(&batch);
            if self.clock.now() < ready_at {
                return Ok(ClaimOutcome::NotReady { ready_at });
            }
            if !self.store.delete_if(&storage, version).await? {
                continue;
            }
            let text = merge_text(&batch.fragments, &self.config.joiner);
            tracing::debug!(fragments = batch.fragments.len(), "batch claimed");
            return Ok(ClaimOutcome::Claimed(MergedMessage {
                key: key.clone(),
                text,
                fragments: batch.fragments,
                first_at: batch.first_at,
                last_at: batch.last_at,
                deferrals: batch.deferrals,
            }));
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Put a claimed batch back in front of anything that arrived since, so
    /// it can be retried later without losing order.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %merged.key))]
    pub async fn requeue(&self, merged: &MergedMessage) -> Result<IngestReceipt, StoreError> {
        let storage = storage_key(&merged.key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = store::get_json::<PendingBatch>(self.store.as_ref(), &storage).await?;
            let mut fragments = merged.fragments.clone();
            let (batch, expect) = match current {
                Some((newer, version)) => {
                    fragments.extend(newer.fragments);
                    (
                        PendingBatch {
                            fragments,
                            first_at: merged.first_at.min(newer.first_at),
                            last_at: now.max(newer.last_at),
                            deferrals: merged.deferrals.max(newer.deferrals) + 1,
                        },
                        Expect::Version(version),
                    )
                }
                None => (
                    PendingBatch {
                        fragments,
                        first_at: merged.first_at,
                        last_at: now,
                        deferrals: merged.deferrals + 1,
                    },
                    Expect::Absent,
                ),
            };
            if store::put_json(self.store.as_ref(), &storage, expect, &batch, self.ttl())
                .await?
                .is_some()
            {
                return Ok(IngestReceipt {
                    fragments: batch.fragments.len(),
                    ready_at: self.ready_at(&batch),
                });
            }
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    pub async fn pending(&self, key: &ConversationKey) -> Result<Option<PendingSummary>, StoreError> {
        let storage = storage_key(key);
        Ok(
            store::get_json::<PendingBatch>(self.store.as_ref(), &storage)
                .await?
                .map(|(batch, _)| PendingSummary {
                    fragments: batch.fragments.len(),
                    first_at: batch.first_at,
                    last_at: batch.last_at,
                    ready_at: self.ready_at(&batch),
                }),
        )
    }
}

/// Join fragment texts in arrival order, skipping blank ones.
pub fn merge_text(fragments: &[Fragment], joiner: &str) -> String {
    fragments
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(joiner)
}
