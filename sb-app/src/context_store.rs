//! Per-conversation processing state shared by all workers.
//!
//! The record is the at-most-one-turn guard: a turn may only start when no
//! live `started` record exists, or when the existing one is older than the
//! abandonment threshold. Every transition after the start is fenced by the
//! turn id, so a worker whose turn was reclaimed cannot clobber its successor.

use crate::clock::Clock;
use crate::history::HistoryEntry;
use crate::store::{self, Expect, KeyedStore, MAX_CAS_ATTEMPTS, StoreError};
use chrono::{DateTime, Utc};
use sb_booking::{BookingRecord, Command, CommandName, CommandStatus, ErrorKind};
use sb_channels::ConversationKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Started,
    Completed,
    Failed,
}

/// What kind of answer the bot's last message invites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReply {
    Confirmation,
    TimeSelection,
    ServiceSelection,
    StaffSelection,
    #[default]
    FreeText,
}

impl ExpectedReply {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Confirmation => "a yes/no confirmation",
            Self::TimeSelection => "a choice of time",
            Self::ServiceSelection => "a choice of service",
            Self::StaffSelection => "a choice of specialist",
            Self::FreeText => "free text",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mentions {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub staff: Vec<String>,
}

impl Mentions {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.staff.is_empty()
    }

    pub fn merge(&mut self, other: Mentions) {
        for service in other.services {
            if !self.services.contains(&service) {
                self.services.push(service);
            }
        }
        for member in other.staff {
            if !self.staff.contains(&member) {
                self.staff.push(member);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub name: CommandName,
    pub status: CommandStatus,
    #[serde(default)]
    pub replayed: bool,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    #[serde(default)]
    pub commands: Vec<CommandSummary>,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<TurnError>,
}

/// Result of a finished turn, written by `complete`.
#[derive(Debug, Clone, Default)]
pub struct TurnCompletion {
    pub outcome: TurnOutcome,
    pub last_question: Option<String>,
    pub expected_reply: ExpectedReply,
    pub recent_bookings: Vec<BookingRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateContext {
    pub status: TurnStatus,
    pub turn_id: Uuid,
    pub worker_id: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history_snapshot: Vec<HistoryEntry>,
    #[serde(default)]
    pub last_question: Option<String>,
    #[serde(default)]
    pub expected_reply: ExpectedReply,
    #[serde(default)]
    pub mentions: Mentions,
    #[serde(default)]
    pub draft_reply: Option<String>,
    #[serde(default)]
    pub pending_commands: Vec<Command>,
    #[serde(default)]
    pub outcome: Option<TurnOutcome>,
    #[serde(default)]
    pub recent_bookings: Vec<BookingRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Started {
        record: IntermediateContext,
        previous: Option<IntermediateContext>,
    },
    /// A stale `started` record was taken over.
    Reclaimed {
        record: IntermediateContext,
        previous: IntermediateContext,
        abandoned_turn: Uuid,
    },
    Busy {
        turn_id: Uuid,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub worker_id: String,
    pub abandon_after: Duration,
    pub terminal_ttl: Duration,
}

pub struct ContextStore {
    store: Arc<dyn KeyedStore>,
    clock: Arc<dyn Clock>,
    config: ContextConfig,
}

fn storage_key(key: &ConversationKey) -> String {
    format!("ctx:{}", key.storage_key())
}

impl ContextStore {
    pub fn new(store: Arc<dyn KeyedStore>, clock: Arc<dyn Clock>, config: ContextConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn is_abandoned(&self, record: &IntermediateContext, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(record.started_at);
        age.to_std().unwrap_or_default() >= self.config.abandon_after
    }

    /// A started record must outlive the abandonment threshold, or a slow
    /// turn would silently lose its guard.
    fn started_ttl(&self) -> Duration {
        self.config.abandon_after + self.config.terminal_ttl
    }

    pub async fn get(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<IntermediateContext>, StoreError> {
        Ok(
            store::get_json::<IntermediateContext>(self.store.as_ref(), &storage_key(key))
                .await?
                .map(|(record, _)| record),
        )
    }

    pub async fn is_processing(&self, key: &ConversationKey) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.get(key).await?.is_some_and(|record| {
            record.status == TurnStatus::Started && !self.is_abandoned(&record, now)
        }))
    }

    /// Try to start a turn for `key`.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %key))]
    pub async fn begin_processing(
        &self,
        key: &ConversationKey,
        message: &str,
    ) -> Result<BeginOutcome, StoreError> {
        let storage = storage_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current =
                store::get_json::<IntermediateContext>(self.store.as_ref(), &storage).await?;

            let (previous, expect, reclaiming) = match current {
                Some((record, _))
                    if record.status == TurnStatus::Started && !self.is_abandoned(&record, now) =>
                {
                    return Ok(BeginOutcome::Busy {
                        turn_id: record.turn_id,
                        started_at: record.started_at,
                    });
                }
                Some((record, version)) => {
                    let reclaiming = record.status == TurnStatus::Started;
                    (Some(record), Expect::Version(version), reclaiming)
                }
                None => (None, Expect::Absent, false),
            };

            let record = IntermediateContext {
                status: TurnStatus::Started,
                turn_id: Uuid::new_v4(),
                worker_id: self.config.worker_id.clone(),
                message: message.to_string(),
                started_at: now,
                updated_at: now,
                finished_at: None,
                history_snapshot: Vec::new(),
                last_question: previous.as_ref().and_then(|p| p.last_question.clone()),
                expected_reply: previous
                    .as_ref()
                    .map(|p| p.expected_reply)
                    .unwrap_or_default(),
                mentions: Mentions::default(),
                draft_reply: None,
                pending_commands: Vec::new(),
                outcome: None,
                recent_bookings: previous
                    .as_ref()
                    .map(|p| p.recent_bookings.clone())
                    .unwrap_or_default(),
            };

            if store::put_json(
                self.store.as_ref(),
                &storage,
                expect,
                &record,
                self.started_ttl(),
            )
            .await?
            .is_none()
            {
                continue;
            }

            return Ok(match previous {
                Some(previous) if reclaiming => {
                    tracing::warn!(
                        abandoned_turn = %previous.turn_id,
                        abandoned_worker = %previous.worker_id,
                        started_at = %previous.started_at,
                        turn = %record.turn_id,
                        "reclaimed abandoned turn"
                    );
                    BeginOutcome::Reclaimed {
                        abandoned_turn: previous.turn_id,
                        record,
                        previous,
                    }
                }
                previous => BeginOutcome::Started { record, previous },
            });
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Apply `change` to the record owned by `turn_id` while it is still
    /// started. Returns false when the turn no longer owns the record.
    async fn update_owned<F>(
        &self,
        key: &ConversationKey,
        turn_id: Uuid,
        ttl: Duration,
        change: F,
    ) -> Result<bool, StoreError>
    where
        F: Fn(&mut IntermediateContext, DateTime<Utc>),
    {
        let storage = storage_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let Some((mut record, version)) =
                store::get_json::<IntermediateContext>(self.store.as_ref(), &storage).await?
            else {
                tracing::warn!(conversation = %key, turn = %turn_id, "context vanished before turn finished");
                return Ok(false);
            };
            if record.turn_id != turn_id || record.status != TurnStatus::Started {
                tracing::warn!(
                    conversation = %key,
                    turn = %turn_id,
                    owner = %record.turn_id,
                    "turn no longer owns the context"
                );
                return Ok(false);
            }
            change(&mut record, now);
            record.updated_at = now;
            if store::put_json(
                self.store.as_ref(),
                &storage,
                Expect::Version(version),
                &record,
                ttl,
            )
            .await?
            .is_some()
            {
                return Ok(true);
            }
        }
        Err(StoreError::Contention {
            key: storage,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Record the history the turn was prompted with. Loaded only once the
    /// turn owns the conversation, so it includes every earlier exchange.
    pub async fn attach_history(
        &self,
        key: &ConversationKey,
        turn_id: Uuid,
        history: &[HistoryEntry],
    ) -> Result<bool, StoreError> {
        self.update_owned(key, turn_id, self.started_ttl(), |record, _| {
            record.history_snapshot = history.to_vec();
        })
        .await
    }

    /// Store the model's draft before any command runs.
    pub async fn record_interpretation(
        &self,
        key: &ConversationKey,
        turn_id: Uuid,
        draft_reply: &str,
        commands: &[Command],
        mentions: Mentions,
    ) -> Result<bool, StoreError> {
        self.update_owned(key, turn_id, self.started_ttl(), |record, _| {
            record.draft_reply = Some(draft_reply.to_string());
            record.pending_commands = commands.to_vec();
            record.mentions.merge(mentions.clone());
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %key, turn = %turn_id))]
    pub async fn complete(
        &self,
        key: &ConversationKey,
        turn_id: Uuid,
        completion: TurnCompletion,
    ) -> Result<bool, StoreError> {
        self.update_owned(key, turn_id, self.config.terminal_ttl, |record, now| {
            record.status = TurnStatus::Completed;
            record.finished_at = Some(now);
            record.pending_commands.clear();
            record.outcome = Some(completion.outcome.clone());
            record.last_question = completion.last_question.clone();
            record.expected_reply = completion.expected_reply;
            record.recent_bookings = completion.recent_bookings.clone();
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %key, turn = %turn_id))]
    pub async fn fail(
        &self,
        key: &ConversationKey,
        turn_id: Uuid,
        outcome: TurnOutcome,
    ) -> Result<bool, StoreError> {
        self.update_owned(key, turn_id, self.config.terminal_ttl, |record, now| {
            record.status = TurnStatus::Failed;
            record.finished_at = Some(now);
            record.draft_reply = None;
            record.pending_commands.clear();
            record.outcome = Some(outcome.clone());
        })
        .await
    }
}
