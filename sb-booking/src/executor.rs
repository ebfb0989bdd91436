use crate::backend::BookingBackend;
use crate::catalog::CatalogCache;
use crate::command::{Clarification, Command, CommandName, CommandResult, CommandStatus};
use crate::error::{BookingError, ErrorKind, Result};
use crate::handlers::{CommandHandler, CommandOutcome, Resolution, default_handlers};
use crate::model::{BookingRecord, ConversationContext};
use crate::params::{HandlerSpec, validate};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on each backend-facing step of a command.
    pub call_timeout: Duration,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Bookings seen by one turn: those carried from the previous turn plus
/// those created or replayed now.
#[derive(Debug, Default)]
pub struct TurnLedger {
    previous: Vec<BookingRecord>,
    current: Vec<BookingRecord>,
}

impl TurnLedger {
    pub fn new(previous: Vec<BookingRecord>) -> Self {
        Self {
            previous,
            current: Vec::new(),
        }
    }

    fn find(&self, fingerprint: &crate::model::BookingFingerprint) -> Option<&BookingRecord> {
        self.current
            .iter()
            .chain(self.previous.iter())
            .find(|r| &r.fingerprint == fingerprint)
    }

    fn remember(&mut self, record: BookingRecord) {
        if !self.current.iter().any(|r| r.fingerprint == record.fingerprint) {
            self.current.push(record);
        }
    }

    /// Drop every record of `booking_id` once it is cancelled or moved.
    fn forget(&mut self, booking_id: &str) {
        self.previous.retain(|r| r.booking.id != booking_id);
        self.current.retain(|r| r.booking.id != booking_id);
    }

    /// Records to carry into the next turn.
    pub fn into_records(self) -> Vec<BookingRecord> {
        self.current
    }
}

#[derive(Debug)]
pub struct TurnExecution {
    pub results: Vec<CommandResult>,
    pub bookings: Vec<BookingRecord>,
}

/// Dispatches commands to registered handlers.
pub struct CommandExecutor {
    handlers: HashMap<CommandName, Arc<dyn CommandHandler>>,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            config,
        }
    }

    /// Executor with every built-in command wired to `backend`.
    pub fn with_default_handlers(
        backend: Arc<dyn BookingBackend>,
        catalog: Arc<CatalogCache>,
        config: ExecutorConfig,
    ) -> Self {
        let mut executor = Self::new(config);
        for handler in default_handlers(backend, catalog) {
            executor.register(handler);
        }
        executor
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let name = handler.spec().name;
        if self.handlers.insert(name, handler).is_some() {
            tracing::warn!(command = %name, "handler replaced");
        }
    }

    /// Specs of registered handlers in vocabulary order.
    pub fn specs(&self) -> Vec<HandlerSpec> {
        CommandName::ALL
            .iter()
            .filter_map(|name| self.handlers.get(name).map(|h| h.spec()))
            .collect()
    }

    /// Run commands in order. Failures are captured per command.
    #[tracing::instrument(level = "info", skip_all, fields(conversation = %ctx.key, turn = %ctx.turn_id, commands = commands.len()))]
    pub async fn execute_all(
        &self,
        commands: &[Command],
        ctx: &ConversationContext,
    ) -> TurnExecution {
        let mut ledger = TurnLedger::new(ctx.recent_bookings.clone());
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.execute(command, ctx, &mut ledger).await);
        }
        TurnExecution {
            results,
            bookings: ledger.into_records(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(command = %command.name))]
    pub async fn execute(
        &self,
        command: &Command,
        ctx: &ConversationContext,
        ledger: &mut TurnLedger,
    ) -> CommandResult {
        let started = Instant::now();
        let mut result = self.run(command, ctx, ledger).await;
        result.latency_ms = started.elapsed().as_millis() as u64;
        match result.status {
            CommandStatus::Succeeded => tracing::info!(
                attempts = result.attempts,
                latency_ms = result.latency_ms,
                replayed = result.replayed,
                "command succeeded"
            ),
            CommandStatus::NeedsClarification => {
                tracing::info!(latency_ms = result.latency_ms, "command needs clarification")
            }
            CommandStatus::Failed => tracing::warn!(
                attempts = result.attempts,
                latency_ms = result.latency_ms,
                error = ?result.error,
                "command failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        command: &Command,
        ctx: &ConversationContext,
        ledger: &mut TurnLedger,
    ) -> CommandResult {
        let Some(handler) = self.handlers.get(&command.name) else {
            return CommandResult::failed(
                command.clone(),
                ErrorKind::Unknown,
                format!("no handler registered for {}", command.name),
            );
        };

        let args = match validate(&handler.spec(), &command.params, ctx) {
            Ok(args) => args,
            Err(question) => {
                return CommandResult::clarify(command.clone(), Clarification::new(question));
            }
        };

        let (resolution, attempts) = self.call(true, || handler.resolve(&args, ctx)).await;
        let resolved = match resolution {
            Ok(Resolution::Ready(resolved)) => resolved,
            Ok(Resolution::Clarify(clarification)) => {
                let mut result = CommandResult::clarify(command.clone(), clarification);
                result.attempts = attempts;
                return result;
            }
            Err(e) => return failure(command, e, attempts),
        };

        // Only a booking the backend still reports as held is replayed; a
        // record whose booking has gone is stale.
        if let Some(fingerprint) = resolved.fingerprint.as_ref() {
            let recorded = ledger.find(fingerprint).cloned();
            let held = match (resolved.booking.clone(), recorded) {
                (Some(booking), recorded) => Some(BookingRecord {
                    fingerprint: fingerprint.clone(),
                    booking,
                    turn_id: recorded.map_or(ctx.turn_id, |r| r.turn_id),
                }),
                (None, Some(stale)) => {
                    tracing::info!(booking = %stale.booking.id, "recorded booking no longer held");
                    ledger.forget(&stale.booking.id);
                    None
                }
                (None, None) => None,
            };
            if let Some(record) = held {
                tracing::info!(
                    booking = %record.booking.id,
                    original_turn = %record.turn_id,
                    "duplicate booking request replayed"
                );
                let display = format!(
                    "You're already booked: {}.",
                    crate::handlers::describe_booking(&record.booking)
                );
                let payload = serde_json::json!({ "booking": record.booking });
                let booking = record.booking.clone();
                ledger.remember(record);
                return CommandResult {
                    command: command.clone(),
                    status: CommandStatus::Succeeded,
                    display: Some(display),
                    clarification: None,
                    payload,
                    error: None,
                    booking: Some(booking),
                    attempts,
                    latency_ms: 0,
                    replayed: true,
                };
            }
        }

        let idempotent = !command.name.is_mutating();
        let (outcome, attempts) = self.call(idempotent, || handler.execute(&resolved, ctx)).await;
        match outcome {
            Ok(CommandOutcome::Done {
                display,
                payload,
                booking,
            }) => {
                match (resolved.fingerprint.clone(), booking.as_ref()) {
                    (Some(fingerprint), Some(booking)) => ledger.remember(BookingRecord {
                        fingerprint,
                        booking: booking.clone(),
                        turn_id: ctx.turn_id,
                    }),
                    // A cancelled or moved booking must not be replayed later.
                    (None, _) if command.name.is_mutating() => {
                        if let Some(target) = resolved.booking.as_ref() {
                            ledger.forget(&target.id);
                        }
                    }
                    _ => {}
                }
                CommandResult {
                    command: command.clone(),
                    status: CommandStatus::Succeeded,
                    display: Some(display),
                    clarification: None,
                    payload,
                    error: None,
                    booking,
                    attempts,
                    latency_ms: 0,
                    replayed: false,
                }
            }
            Ok(CommandOutcome::Clarify(clarification)) => {
                let mut result = CommandResult::clarify(command.clone(), clarification);
                result.attempts = attempts;
                result
            }
            Err(e) => failure(command, e, attempts),
        }
    }

    /// Run one step under the call timeout, retrying transient failures with
    /// exponential backoff. Returns the outcome and the attempts made.
    ///
    /// A timed-out mutation may have been applied, so it is only retried when
    /// the step is `idempotent`.
    async fn call<T, F, Fut>(&self, idempotent: bool, mut step: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout_ms = self.config.call_timeout.as_millis() as u64;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.config.call_timeout, step()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BookingError::Timeout(timeout_ms)),
            };
            match outcome {
                Err(e)
                    if e.is_transient()
                        && (idempotent || !matches!(e, BookingError::Timeout(_)))
                        && attempt <= self.config.max_retries =>
                {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient booking failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

fn failure(command: &Command, error: BookingError, attempts: u32) -> CommandResult {
    let mut result = CommandResult::failed(command.clone(), error.kind(), error.to_string());
    result.attempts = attempts;
    result
}
