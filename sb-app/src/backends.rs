//! Construction of the pluggable backends named in the config: the shared
//! conversation store, the booking system and the language model.

use crate::clock::Clock;
use crate::config::{BookingMode, SalonbotConfig, StoreBackend};
use crate::store::{KeyedStore, MemoryStore, SqliteStore};
use anyhow::{Context, Result, anyhow};
use sb_booking::{BookingBackend, HttpBookingBackend, InMemoryBookingBackend};
use sb_llm::{LanguageModel, LlmClient};
use std::sync::Arc;
use std::time::Duration;

pub fn build_store(cfg: &SalonbotConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn KeyedStore>> {
    match cfg.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("memory store selected: state is not shared between workers");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Sqlite => {
            let path = cfg
                .store_path()
                .ok_or_else(|| anyhow!("store.path is required for the sqlite backend"))?;
            let store = SqliteStore::open(
                &path,
                Duration::from_millis(cfg.store.busy_timeout_ms),
                clock,
            )
            .with_context(|| format!("open store {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub fn build_booking_backend(cfg: &SalonbotConfig) -> Result<Arc<dyn BookingBackend>> {
    match cfg.booking.mode {
        BookingMode::Http => {
            let base_url = cfg
                .booking
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow!("booking.base_url is required in http mode"))?;
            let backend = HttpBookingBackend::new(
                base_url,
                cfg.booking.api_token.as_deref(),
                Duration::from_secs(cfg.booking.timeout_seconds),
            )?;
            Ok(Arc::new(backend))
        }
        BookingMode::Memory => {
            let mut backend = InMemoryBookingBackend::new();
            for tenant in &cfg.tenants {
                match tenant.dev_catalog()? {
                    Some(catalog) => {
                        tracing::info!(
                            tenant = %tenant.id,
                            services = catalog.services.len(),
                            staff = catalog.staff.len(),
                            "in-memory booking catalog loaded"
                        );
                        backend = backend.with_tenant(tenant.id.trim(), catalog);
                    }
                    None => tracing::warn!(tenant = %tenant.id, "tenant has no catalog for the in-memory booking backend"),
                }
            }
            Ok(Arc::new(backend))
        }
    }
}

pub fn build_language_model(cfg: &SalonbotConfig) -> Result<Arc<dyn LanguageModel>> {
    let api_key = cfg
        .api_key_for_model()
        .ok_or_else(|| anyhow!("no api key configured for model {}", cfg.llm.model))?;
    let client = LlmClient::new(
        &api_key,
        &cfg.llm.model,
        Duration::from_secs(cfg.llm.timeout_seconds),
    )?
    .with_max_tokens(cfg.llm.max_tokens)
    .with_temperature(cfg.llm.temperature)
    .with_base_url(cfg.llm.base_url.clone());
    Ok(Arc::new(client))
}
