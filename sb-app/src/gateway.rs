//! Inbound side: every channel feeds fragments into the debounce batcher,
//! and a timer per fragment hands ready batches to the turn controller.

use crate::clock::Clock;
use crate::debounce::{DebounceBatcher, Fragment};
use crate::store::StoreError;
use crate::tenants::TenantRegistry;
use crate::turn::{Disposition, TurnController};
use chrono::{DateTime, Utc};
use sb_channels::{ConversationKey, InboundMessage, InboundMessageKind, TenantId};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("sender {0:?} has no usable identifier")]
    InvalidSender(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestAck {
    pub conversation: String,
    pub fragments: usize,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted(IngestAck),
    Ignored { reason: &'static str },
}

pub struct Gateway {
    tenants: Arc<TenantRegistry>,
    batcher: Arc<DebounceBatcher>,
    controller: Arc<TurnController>,
    clock: Arc<dyn Clock>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        batcher: Arc<DebounceBatcher>,
        controller: Arc<TurnController>,
        clock: Arc<dyn Clock>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tenants,
            batcher,
            controller,
            clock,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            shutdown,
        }
    }

    /// Consume messages pushed by channel adapters until the senders close
    /// or shutdown is requested.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_loop().await;
            tracing::info!("gateway loop exited");
        });
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>) {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return;
            };
            if let Err(e) = self.ingest(inbound).await {
                tracing::warn!(error = %e, "inbound message rejected");
            }
        }
    }

    /// Accept one inbound message into its conversation's pending batch.
    #[tracing::instrument(level = "debug", skip_all, fields(channel = %inbound.channel_id, tenant = %inbound.tenant_id))]
    pub async fn ingest(self: &Arc<Self>, inbound: InboundMessage) -> Result<IngestOutcome, IngestError> {
        if inbound.kind == InboundMessageKind::Reaction {
            return Ok(IngestOutcome::Ignored { reason: "reaction" });
        }
        if inbound.content.trim().is_empty() {
            return Ok(IngestOutcome::Ignored {
                reason: "empty message",
            });
        }
        let tenant = self
            .tenants
            .get(&inbound.tenant_id)
            .ok_or_else(|| IngestError::UnknownTenant(inbound.tenant_id.clone()))?;
        let key = tenant
            .conversation_key(&inbound.sender_id)
            .ok_or_else(|| IngestError::InvalidSender(inbound.sender_id.to_string()))?;

        let fragment = Fragment {
            text: inbound.content,
            message_id: Some(inbound.message_id),
            channel_id: inbound.channel_id,
            sender_id: inbound.sender_id,
            received_at: self.clock.now(),
        };
        let receipt = self.batcher.ingest(&key, fragment).await?;
        tracing::debug!(conversation = %key, fragments = receipt.fragments, ready_at = %receipt.ready_at, "fragment accepted");
        self.schedule(key.clone(), receipt.ready_at);
        Ok(IngestOutcome::Accepted(IngestAck {
            conversation: key.to_string(),
            fragments: receipt.fragments,
            ready_at: receipt.ready_at,
        }))
    }

    fn schedule(self: &Arc<Self>, key: ConversationKey, ready_at: DateTime<Utc>) {
        let gateway = self.clone();
        tokio::spawn(async move { gateway.drive(key, ready_at).await });
    }

    /// Wait for the batch deadline and hand the conversation to the turn
    /// controller, following deferrals until the batch is taken.
    async fn drive(&self, key: ConversationKey, mut ready_at: DateTime<Utc>) {
        loop {
            let delay = (ready_at - self.clock.now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.controller.on_ready(&key).await {
                Ok(Disposition::Deferred { retry_at }) => {
                    tracing::debug!(conversation = %key, retry_at = %retry_at, "batch deferred");
                    ready_at = retry_at;
                }
                Ok(Disposition::Finished(report)) => {
                    tracing::debug!(conversation = %key, turn = %report.turn_id, failed = report.failed, "turn finished");
                    return;
                }
                // A newer fragment's timer owns the batch now.
                Ok(Disposition::Waiting { .. } | Disposition::Idle) => return,
                Err(e) => {
                    tracing::error!(conversation = %key, error = %e, "turn could not run");
                    return;
                }
            }
        }
    }
}
