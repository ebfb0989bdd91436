//! The per-conversation turn: claim, guard, prompt, interpret, execute,
//! persist, reply.

use crate::clock::Clock;
use crate::config::BusyPolicy;
use crate::context_store::{
    BeginOutcome, CommandSummary, ContextStore, IntermediateContext, TurnCompletion, TurnError,
    TurnOutcome,
};
use crate::debounce::{ClaimOutcome, DebounceBatcher, MergedMessage};
use crate::history::{HistoryEntry, HistoryStore};
use crate::interpreter;
use crate::outbound::ChannelRegistry;
use crate::prompt::{DialogueHints, PromptInput, build_prompt};
use crate::reply::{assemble_reply, classify_reply, collect_mentions};
use crate::tenants::{TenantProfile, TenantRegistry};
use chrono::{DateTime, Utc};
use sb_booking::{
    Catalog, CatalogCache, Command, CommandExecutor, CommandStatus, ConversationContext,
    ErrorKind,
};
use sb_channels::{ConversationKey, OutboundMessage};
use sb_llm::{Generation, LanguageModel, LlmError, Prompt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub busy_policy: BusyPolicy,
    pub queue_poll: Duration,
    pub queue_max_wait: Duration,
    pub defer_retry: Duration,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    pub llm_retry_backoff: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::Queue,
            queue_poll: Duration::from_millis(250),
            queue_max_wait: Duration::from_secs(10),
            defer_retry: Duration::from_secs(5),
            llm_timeout: Duration::from_secs(30),
            llm_max_retries: 2,
            llm_retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Summary of a finished turn, for callers and tests.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: Uuid,
    pub key: ConversationKey,
    pub reply: String,
    pub commands: Vec<CommandSummary>,
    pub failed: bool,
    pub reclaimed: bool,
}

#[derive(Debug, Clone)]
pub enum Disposition {
    /// Nothing pending.
    Idle,
    /// A newer fragment moved the deadline; its timer owns the claim.
    Waiting { ready_at: DateTime<Utc> },
    Finished(TurnReport),
    /// Conversation busy; the message is pending again and should be
    /// claimed at `retry_at`.
    Deferred { retry_at: DateTime<Utc> },
}

pub struct TurnController {
    batcher: Arc<DebounceBatcher>,
    contexts: Arc<ContextStore>,
    history: Arc<HistoryStore>,
    tenants: Arc<TenantRegistry>,
    catalog: Arc<CatalogCache>,
    executor: Arc<CommandExecutor>,
    model: Arc<dyn LanguageModel>,
    channels: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    config: TurnConfig,
}

#[allow(clippy::too_many_arguments)]
impl TurnController {
    pub fn new(
        batcher: Arc<DebounceBatcher>,
        contexts: Arc<ContextStore>,
        history: Arc<HistoryStore>,
        tenants: Arc<TenantRegistry>,
        catalog: Arc<CatalogCache>,
        executor: Arc<CommandExecutor>,
        model: Arc<dyn LanguageModel>,
        channels: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        config: TurnConfig,
    ) -> Self {
        Self {
            batcher,
            contexts,
            history,
            tenants,
            catalog,
            executor,
            model,
            channels,
            clock,
            config,
        }
    }

    /// Claim the conversation's pending batch if it is ready and run a turn
    /// for it.
    #[tracing::instrument(level = "info", skip_all, fields(conversation = %key))]
    pub async fn on_ready(&self, key: &ConversationKey) -> anyhow::Result<Disposition> {
        // Without a tenant there is nobody to answer as; the batch stays
        // pending until its TTL rather than being claimed and lost.
        let Some(tenant) = self.tenants.get(key.tenant_id()) else {
            tracing::error!(tenant = %key.tenant_id(), "pending message for unknown tenant left unclaimed");
            return Ok(Disposition::Idle);
        };
        match self.batcher.claim(key).await? {
            ClaimOutcome::Empty => Ok(Disposition::Idle),
            ClaimOutcome::NotReady { ready_at } => Ok(Disposition::Waiting { ready_at }),
            ClaimOutcome::Claimed(merged) => self.process(&tenant, merged).await,
        }
    }

    async fn process(
        &self,
        tenant: &TenantProfile,
        merged: MergedMessage,
    ) -> anyhow::Result<Disposition> {
        let queue_deadline = tokio::time::Instant::now() + self.config.queue_max_wait;
        loop {
            let begun = match self.contexts.begin_processing(&merged.key, &merged.text).await {
                Ok(begun) => begun,
                Err(e) => {
                    tracing::warn!(error = %e, transient = e.is_transient(), "could not start turn");
                    return self.defer(tenant, merged).await;
                }
            };
            match begun {
                BeginOutcome::Started { record, previous } => {
                    return Ok(self.run_turn(tenant, merged, record, previous, false).await);
                }
                BeginOutcome::Reclaimed {
                    record, previous, ..
                } => {
                    return Ok(self
                        .run_turn(tenant, merged, record, Some(previous), true)
                        .await);
                }
                BeginOutcome::Busy {
                    turn_id,
                    started_at,
                } => {
                    if self.config.busy_policy == BusyPolicy::Queue
                        && tokio::time::Instant::now() < queue_deadline
                    {
                        tracing::debug!(running_turn = %turn_id, since = %started_at, "conversation busy, waiting");
                        tokio::time::sleep(self.config.queue_poll).await;
                        continue;
                    }
                    tracing::info!(running_turn = %turn_id, "conversation busy, deferring message");
                    return self.defer(tenant, merged).await;
                }
            }
        }
    }

    /// Put the message back and notify the customer once per batch.
    async fn defer(
        &self,
        tenant: &TenantProfile,
        merged: MergedMessage,
    ) -> anyhow::Result<Disposition> {
        let receipt = match self.batcher.requeue(&merged).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // The message cannot be kept; answer it rather than lose it silently.
                tracing::error!(error = %e, "requeue failed, sending apology");
                self.deliver(tenant, &merged, &tenant.apology_text).await;
                return Err(e.into());
            }
        };
        if merged.deferrals == 0 {
            self.deliver(tenant, &merged, &tenant.busy_text).await;
        }
        let earliest = self.clock.now()
            + chrono::Duration::from_std(self.config.defer_retry).unwrap_or(chrono::Duration::zero());
        Ok(Disposition::Deferred {
            retry_at: receipt.ready_at.max(earliest),
        })
    }

    #[tracing::instrument(
        level = "info",
        name = "turn",
        skip_all,
        fields(conversation = %merged.key, turn = %record.turn_id, worker = %self.contexts.worker_id())
    )]
    async fn run_turn(
        &self,
        tenant: &TenantProfile,
        merged: MergedMessage,
        record: IntermediateContext,
        previous: Option<IntermediateContext>,
        reclaimed: bool,
    ) -> Disposition {
        let started = Instant::now();
        let key = merged.key.clone();
        let turn_id = record.turn_id;

        // Loaded after the guard is held, so an exchange that finished while
        // this message waited is part of the prompt.
        let history = match self.history.load(&key).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "history unavailable, continuing without it");
                Vec::new()
            }
        };
        if let Err(e) = self.contexts.attach_history(&key, turn_id, &history).await {
            tracing::warn!(error = %e, "could not record history snapshot");
        }

        let hints = DialogueHints::from_previous(previous.as_ref());
        let catalog = match self.catalog.get(&tenant.id).await {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!(error = %e, "catalog unavailable, prompting without it");
                Arc::new(Catalog::default())
            }
        };
        let specs = self.executor.specs();
        let prompt = build_prompt(&PromptInput {
            tenant,
            catalog: &catalog,
            specs: &specs,
            history: &history,
            hints: &hints,
            client_name: None,
            now: self.clock.now(),
            message: &merged.text,
        });

        let model_started = Instant::now();
        let generation = match self.generate(&prompt).await {
            Ok(generation) => generation,
            Err(e) => {
                return self
                    .abort_turn(tenant, &merged, turn_id, &e, started, reclaimed)
                    .await;
            }
        };
        let model_latency_ms = model_started.elapsed().as_millis() as u64;

        let parsed = interpreter::parse(&generation.text);
        let mentions = collect_mentions(&catalog, &merged.text, &parsed.commands);
        let owned = match self
            .contexts
            .record_interpretation(&key, turn_id, &parsed.clean_text, &parsed.commands, mentions)
            .await
        {
            Ok(owned) => owned,
            Err(e) => {
                tracing::warn!(error = %e, "could not record interpretation");
                true
            }
        };
        // A successor now owns the conversation; it may be running the same
        // booking, so only read-only commands are still safe.
        let commands: Vec<Command> = if owned {
            parsed.commands.clone()
        } else {
            let (kept, skipped): (Vec<Command>, Vec<Command>) = parsed
                .commands
                .iter()
                .cloned()
                .partition(|c| !c.name.is_mutating());
            tracing::warn!(
                skipped = skipped.len(),
                "turn lost ownership, mutating commands not executed"
            );
            kept
        };

        let ctx = ConversationContext {
            key: key.clone(),
            turn_id,
            client_name: None,
            utc_offset: tenant.utc_offset,
            now: self.clock.now(),
            recent_bookings: record.recent_bookings.clone(),
        };
        let execution = self.executor.execute_all(&commands, &ctx).await;

        let reply = assemble_reply(&parsed.clean_text, &execution.results, tenant);
        let (last_question, expected_reply) = classify_reply(&reply, &execution.results);
        let commands: Vec<CommandSummary> = execution
            .results
            .iter()
            .map(|r| CommandSummary {
                name: r.command.name,
                status: r.status,
                replayed: r.replayed,
                error_kind: r.error.as_ref().map(|e| e.kind),
            })
            .collect();
        let outcome = TurnOutcome {
            reply: reply.clone(),
            commands: commands.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        };

        // History first: once the record leaves `started` a queued turn may
        // begin and must see this exchange.
        self.remember(&key, &merged, &reply).await;
        if let Err(e) = self
            .contexts
            .complete(
                &key,
                turn_id,
                TurnCompletion {
                    outcome,
                    last_question,
                    expected_reply,
                    recent_bookings: execution.bookings,
                },
            )
            .await
        {
            tracing::warn!(error = %e, "could not mark turn completed");
        }
        self.deliver(tenant, &merged, &reply).await;

        let statuses: Vec<String> = commands
            .iter()
            .map(|c| format!("{}:{:?}", c.name, c.status))
            .collect();
        tracing::info!(
            worker = %self.contexts.worker_id(),
            fragments = merged.fragments.len(),
            message_chars = merged.text.chars().count(),
            model = %generation.model,
            model_latency_ms,
            prompt_tokens = generation.usage.prompt_tokens,
            completion_tokens = generation.usage.completion_tokens,
            unknown_tokens = parsed.unknown.len(),
            commands = ?statuses,
            clarifications = commands.iter().filter(|c| c.status == CommandStatus::NeedsClarification).count(),
            reply_chars = reply.chars().count(),
            duration_ms = started.elapsed().as_millis() as u64,
            reclaimed,
            "turn completed"
        );

        Disposition::Finished(TurnReport {
            turn_id,
            key,
            reply,
            commands,
            failed: false,
            reclaimed,
        })
    }

    async fn abort_turn(
        &self,
        tenant: &TenantProfile,
        merged: &MergedMessage,
        turn_id: Uuid,
        error: &LlmError,
        started: Instant,
        reclaimed: bool,
    ) -> Disposition {
        let kind = if error.is_transient() {
            ErrorKind::TransientIo
        } else {
            ErrorKind::Unknown
        };
        let outcome = TurnOutcome {
            reply: tenant.apology_text.clone(),
            commands: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(TurnError {
                kind,
                detail: error.to_string(),
            }),
        };
        self.remember(&merged.key, merged, &tenant.apology_text).await;
        if let Err(e) = self.contexts.fail(&merged.key, turn_id, outcome).await {
            tracing::warn!(error = %e, "could not mark turn failed");
        }
        self.deliver(tenant, merged, &tenant.apology_text).await;
        tracing::error!(
            worker = %self.contexts.worker_id(),
            fragments = merged.fragments.len(),
            error = %error,
            error_kind = ?kind,
            duration_ms = started.elapsed().as_millis() as u64,
            "turn failed"
        );
        Disposition::Finished(TurnReport {
            turn_id,
            key: merged.key.clone(),
            reply: tenant.apology_text.clone(),
            commands: Vec::new(),
            failed: true,
            reclaimed,
        })
    }

    /// Model call with a per-attempt timeout and bounded retries on
    /// transient errors.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.model.model()))]
    async fn generate(&self, prompt: &Prompt) -> Result<Generation, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.llm_timeout,
                self.model.generate(prompt),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(
                    self.config.llm_timeout.as_millis() as u64,
                )),
            };
            match result {
                Ok(generation) => return Ok(generation),
                Err(e) if e.is_transient() && attempt <= self.config.llm_max_retries => {
                    let backoff = self.config.llm_retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "model call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn remember(&self, key: &ConversationKey, merged: &MergedMessage, reply: &str) {
        let now = self.clock.now();
        let entries = [
            HistoryEntry::user(merged.text.clone(), merged.last_at),
            HistoryEntry::assistant(reply, now),
        ];
        if let Err(e) = self.history.append(key, &entries).await {
            tracing::warn!(error = %e, "could not append history");
        }
    }

    /// Send `text` back over the channel the newest fragment came from.
    async fn deliver(&self, tenant: &TenantProfile, merged: &MergedMessage, text: &str) {
        let Some(route) = merged.reply_route() else {
            tracing::error!(conversation = %merged.key, "no fragment to reply to");
            return;
        };
        let Some(adapter) = self.channels.get(route.channel_id.as_str(), &tenant.id) else {
            tracing::error!(channel = %route.channel_id, "no adapter for reply channel");
            return;
        };
        let mut message = OutboundMessage::text(text);
        message.reply_to_message_id = route.message_id.clone();
        if let Err(e) = adapter.send(route.sender_id.as_str(), message).await {
            tracing::error!(channel = %route.channel_id, error = %e, "reply delivery failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context_store::ContextConfig;
    use crate::debounce::{DebounceConfig, Fragment};
    use crate::outbound::recording::RecordingChannel;
    use crate::store::{KeyedStore, MemoryStore};
    use crate::tenants::fixtures::registry;
    use async_trait::async_trait;
    use chrono::FixedOffset;
    use sb_booking::{ExecutorConfig, InMemoryBookingBackend, TenantCatalog};
    use sb_booking::{PriceRange, Service, StaffMember};
    use sb_channels::{ChannelId, SenderId};
    use sb_llm::Usage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a script, recording every prompt it was given.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<Prompt>>,
        delay: Option<Duration>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub fn replying(text: &str) -> Self {
            Self::new(vec![Ok(text.to_string())])
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn prompts(&self) -> Vec<Prompt> {
            self.prompts.lock().expect("prompts lock").clone()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &Prompt) -> sb_llm::Result<Generation> {
            self.prompts.lock().expect("prompts lock").push(prompt.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Ok("Noted.".to_string()));
            next.map(|text| Generation {
                text,
                model: "scripted".to_string(),
                usage: Usage::default(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    pub fn catalog() -> TenantCatalog {
        TenantCatalog {
            services: vec![Service {
                id: "haircut".to_string(),
                name: "Women's haircut".to_string(),
                category: Some("Hair".to_string()),
                price: Some(PriceRange {
                    min: 1500,
                    max: Some(2500),
                }),
                duration_minutes: 60,
                aliases: vec!["haircut".to_string()],
            }],
            staff: vec![StaffMember {
                id: "anna".to_string(),
                name: "Anna".to_string(),
                specialization: Some("Stylist".to_string()),
                service_ids: vec![],
            }],
            portfolio: vec![],
            utc_offset: FixedOffset::east_opt(3 * 3600).expect("offset"),
            opens_at: chrono::NaiveTime::from_hms_opt(10, 0, 0).expect("time"),
            closes_at: chrono::NaiveTime::from_hms_opt(20, 0, 0).expect("time"),
            slot_minutes: 60,
        }
    }

    pub struct Harness {
        pub controller: Arc<TurnController>,
        pub batcher: Arc<DebounceBatcher>,
        pub contexts: Arc<ContextStore>,
        pub history: Arc<HistoryStore>,
        pub backend: Arc<InMemoryBookingBackend>,
        pub model: Arc<ScriptedModel>,
        pub channel: Arc<RecordingChannel>,
        pub clock: Arc<dyn Clock>,
    }

    impl Harness {
        pub fn key(&self) -> ConversationKey {
            ConversationKey::new("salon-1", "79123456789")
        }

        pub fn fragment(&self, text: &str) -> Fragment {
            Fragment {
                text: text.to_string(),
                message_id: None,
                channel_id: ChannelId::new("whatsapp"),
                sender_id: SenderId::new("+7 912 345 67 89"),
                received_at: self.clock.now(),
            }
        }
    }

    pub fn harness_with(
        model: ScriptedModel,
        clock: Arc<dyn Clock>,
        config: TurnConfig,
        debounce: DebounceConfig,
    ) -> Harness {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new(clock.clone()));
        let batcher = Arc::new(DebounceBatcher::new(store.clone(), clock.clone(), debounce));
        let contexts = Arc::new(ContextStore::new(
            store.clone(),
            clock.clone(),
            ContextConfig {
                worker_id: "w1".to_string(),
                abandon_after: Duration::from_secs(120),
                terminal_ttl: Duration::from_secs(3600),
            },
        ));
        let history = Arc::new(HistoryStore::new(
            store,
            20,
            Duration::from_secs(3600),
        ));
        let backend = Arc::new(InMemoryBookingBackend::new().with_tenant("salon-1", catalog()));
        let catalog_cache = Arc::new(CatalogCache::new(backend.clone(), Duration::from_secs(60)));
        let executor = Arc::new(CommandExecutor::with_default_handlers(
            backend.clone(),
            catalog_cache.clone(),
            ExecutorConfig::default(),
        ));
        let channel = Arc::new(RecordingChannel::new("whatsapp"));
        let mut channels = ChannelRegistry::default();
        channels.register(channel.clone());
        let model = Arc::new(model);
        let controller = Arc::new(TurnController::new(
            batcher.clone(),
            contexts.clone(),
            history.clone(),
            Arc::new(registry()),
            catalog_cache,
            executor,
            model.clone(),
            Arc::new(channels),
            clock.clone(),
            config,
        ));
        Harness {
            controller,
            batcher,
            contexts,
            history,
            backend,
            model,
            channel,
            clock,
        }
    }

    pub fn harness(model: ScriptedModel) -> (Harness, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let harness = harness_with(
            model,
            clock.clone(),
            TurnConfig {
                llm_retry_backoff: Duration::from_millis(1),
                ..TurnConfig::default()
            },
            DebounceConfig {
                window: Duration::from_millis(2000),
                ..DebounceConfig::default()
            },
        );
        (harness, clock)
    }
}
