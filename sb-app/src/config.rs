//! salonbot configuration loader.
//!
//! One TOML file, overridable per key from the environment. Every section is
//! optional except `[[tenants]]`; defaults are tuned for a single-host
//! deployment.

use chrono::{FixedOffset, NaiveTime};
use sb_booking::{PortfolioItem, Service, StaffMember, TenantCatalog};
use sb_channels::NumberingPlan;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SalonbotConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub debounce: DebounceSection,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub booking: BookingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    /// Identifies this process in context records. Generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            openai_api_key: None,
            anthropic_api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            timeout_seconds: default_llm_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceSection {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
    #[serde(default = "default_joiner")]
    pub joiner: String,
    #[serde(default = "default_pending_grace_ms")]
    pub pending_grace_ms: u64,
}

impl Default for DebounceSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_batch_age_ms: default_max_batch_age_ms(),
            joiner: default_joiner(),
            pending_grace_ms: default_pending_grace_ms(),
        }
    }
}

fn default_window_ms() -> u64 {
    2500
}

fn default_max_batch_age_ms() -> u64 {
    15_000
}

fn default_joiner() -> String {
    " ".to_string()
}

fn default_pending_grace_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running turn, then fall back to deferring.
    #[default]
    Queue,
    /// Put the message back and tell the customer we're still working.
    Defer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,
    #[serde(default = "default_queue_max_wait_ms")]
    pub queue_max_wait_ms: u64,
    #[serde(default = "default_defer_retry_ms")]
    pub defer_retry_ms: u64,
    #[serde(default = "default_abandon_after_seconds")]
    pub abandon_after_seconds: u64,
    #[serde(default = "default_terminal_ttl_seconds")]
    pub terminal_ttl_seconds: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            queue_poll_ms: default_queue_poll_ms(),
            queue_max_wait_ms: default_queue_max_wait_ms(),
            defer_retry_ms: default_defer_retry_ms(),
            abandon_after_seconds: default_abandon_after_seconds(),
            terminal_ttl_seconds: default_terminal_ttl_seconds(),
        }
    }
}

fn default_queue_poll_ms() -> u64 {
    250
}

fn default_queue_max_wait_ms() -> u64 {
    10_000
}

fn default_defer_retry_ms() -> u64 {
    5_000
}

fn default_abandon_after_seconds() -> u64 {
    120
}

fn default_terminal_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            sweep_interval_seconds: default_sweep_interval_seconds(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_history_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_history_max_messages(),
            ttl_seconds: default_history_ttl_seconds(),
        }
    }
}

fn default_history_max_messages() -> usize {
    20
}

fn default_history_ttl_seconds() -> u64 {
    7 * 24 * 3600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingMode {
    /// In-process backend seeded from each tenant's `catalog`.
    #[default]
    Memory,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    #[serde(default)]
    pub mode: BookingMode,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_booking_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_catalog_ttl_seconds")]
    pub catalog_ttl_seconds: u64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            mode: BookingMode::default(),
            base_url: None,
            api_token: None,
            timeout_seconds: default_booking_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            catalog_ttl_seconds: default_catalog_ttl_seconds(),
        }
    }
}

fn default_booking_timeout_seconds() -> u64 {
    10
}

fn default_catalog_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_max_concurrent_requests() -> usize {
    256
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub log: LogChannelConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    /// Meta app secret used to verify `x-hub-signature-256`.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Channel id the HTTP ingress route uses for its replies.
    #[serde(default = "default_log_channel_id")]
    pub channel_id: String,
}

impl Default for LogChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_id: default_log_channel_id(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_channel_id() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tenant-local offset, e.g. "+03:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,
    #[serde(default = "default_apology_text")]
    pub apology_text: String,
    #[serde(default = "default_busy_text")]
    pub busy_text: String,
    #[serde(default = "default_failure_text")]
    pub failure_text: String,
    #[serde(default)]
    pub whatsapp_phone_number_id: Option<String>,
    #[serde(default)]
    pub numbering: NumberingPlan,
    #[serde(default)]
    pub catalog: Option<CatalogConfig>,
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_fallback_text() -> String {
    "Sorry, I didn't quite get that. Could you rephrase?".to_string()
}

fn default_apology_text() -> String {
    "Sorry, something went wrong on our side. Please try again in a moment.".to_string()
}

fn default_busy_text() -> String {
    "I'm still working on your previous message, one moment please.".to_string()
}

fn default_failure_text() -> String {
    "Part of your request couldn't be completed right now. Please try again shortly.".to_string()
}

/// Catalog for the in-memory booking backend.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub staff: Vec<StaffMember>,
    #[serde(default)]
    pub portfolio: Vec<PortfolioItem>,
    #[serde(default = "default_opens_at")]
    pub opens_at: String,
    #[serde(default = "default_closes_at")]
    pub closes_at: String,
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: u32,
}

fn default_opens_at() -> String {
    "10:00".to_string()
}

fn default_closes_at() -> String {
    "20:00".to_string()
}

fn default_slot_minutes() -> u32 {
    30
}

impl TenantConfig {
    pub fn offset(&self) -> anyhow::Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
            .ok_or_else(|| anyhow::anyhow!("tenants[{}].utc_offset is invalid: {}", self.id, self.utc_offset))
    }

    pub fn dev_catalog(&self) -> anyhow::Result<Option<TenantCatalog>> {
        let Some(catalog) = self.catalog.as_ref() else {
            return Ok(None);
        };
        let time = |field: &str, value: &str| {
            parse_clock_time(value).ok_or_else(|| {
                anyhow::anyhow!("tenants[{}].catalog.{field} is invalid: {value}", self.id)
            })
        };
        Ok(Some(TenantCatalog {
            services: catalog.services.clone(),
            staff: catalog.staff.clone(),
            portfolio: catalog.portfolio.clone(),
            utc_offset: self.offset()?,
            opens_at: time("opens_at", &catalog.opens_at)?,
            closes_at: time("closes_at", &catalog.closes_at)?,
            slot_minutes: catalog.slot_minutes,
        }))
    }
}

/// Accepts `Z`, `UTC`, `+03`, `+0300` and `+03:00`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.chars().next()? {
        '+' => (1, &value[1..]),
        '-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_clock_time(raw: &str) -> Option<NaiveTime> {
    let value = raw.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

impl SalonbotConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(v) = env("SALONBOT_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(v);
        }
        if let Some(v) = env("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(v);
        }
        if let Some(v) = env("SALONBOT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env("SALONBOT_STORE_PATH") {
            self.store.path = Some(v);
            self.store.backend = StoreBackend::Sqlite;
        }
        if let Some(v) = env("SALONBOT_WORKER_ID") {
            self.general.worker_id = Some(v);
        }
        if let Some(v) = env("BOOKING_API_TOKEN") {
            self.booking.api_token = Some(v);
        }
        if let Some(v) = env("WHATSAPP_ACCESS_TOKEN") {
            self.channels.whatsapp.access_token = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = env("WHATSAPP_APP_SECRET") {
            self.channels.whatsapp.app_secret = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.debounce.window_ms == 0 {
            return Err(anyhow::anyhow!("debounce.window_ms must be > 0"));
        }
        if self.debounce.max_batch_age_ms < self.debounce.window_ms {
            return Err(anyhow::anyhow!(
                "debounce.max_batch_age_ms must be >= debounce.window_ms"
            ));
        }
        if self.processing.abandon_after_seconds == 0 {
            return Err(anyhow::anyhow!(
                "processing.abandon_after_seconds must be > 0"
            ));
        }
        if self.processing.queue_poll_ms == 0 {
            return Err(anyhow::anyhow!("processing.queue_poll_ms must be > 0"));
        }
        if self.store.backend == StoreBackend::Sqlite
            && self.store.path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            return Err(anyhow::anyhow!("store.path is required for the sqlite backend"));
        }
        if self.booking.mode == BookingMode::Http
            && self
                .booking
                .base_url
                .as_deref()
                .is_none_or(|u| u.trim().is_empty())
        {
            return Err(anyhow::anyhow!("booking.base_url is required in http mode"));
        }
        if self.channels.whatsapp.enabled && self.channels.whatsapp.access_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.whatsapp.access_token is required when whatsapp is enabled"
            ));
        }
        if self.tenants.is_empty() {
            return Err(anyhow::anyhow!("at least one [[tenants]] entry is required"));
        }

        let mut ids = HashSet::new();
        let mut bindings = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.trim().is_empty() {
                return Err(anyhow::anyhow!("tenants[].id must not be empty"));
            }
            if !ids.insert(tenant.id.trim()) {
                return Err(anyhow::anyhow!("duplicate tenant id: {}", tenant.id));
            }
            tenant.offset()?;
            if let Some(binding) = tenant.whatsapp_phone_number_id.as_deref() {
                if !bindings.insert(binding.trim()) {
                    return Err(anyhow::anyhow!(
                        "whatsapp_phone_number_id {binding} is bound to more than one tenant"
                    ));
                }
            }
            if tenant.numbering.national_length == 0 || tenant.numbering.country_code.is_empty() {
                return Err(anyhow::anyhow!(
                    "tenants[{}].numbering needs a country_code and national_length",
                    tenant.id
                ));
            }
            if self.booking.mode == BookingMode::Memory {
                tenant.dev_catalog()?;
            }
        }
        Ok(())
    }

    /// Key for the configured model's provider.
    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.llm.model.to_ascii_lowercase();
        let key = if model.starts_with("claude-") {
            self.llm.anthropic_api_key.clone()
        } else {
            self.llm.openai_api_key.clone()
        };
        key.filter(|k| !k.trim().is_empty())
    }

    pub fn worker_id(&self) -> String {
        self.general
            .worker_id
            .clone()
            .filter(|w| !w.trim().is_empty())
            .unwrap_or_else(|| format!("worker-{}", ulid::Ulid::new()))
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.path.as_deref().map(expand_home)
    }
}

impl DebounceSection {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_millis(self.pending_grace_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var("SALONBOT_CONFIG")
        .ok()
        .filter(|p| !p.trim().is_empty())
    {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".salonbot").join("config.toml")
}

pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[llm]
model = "claude-3-5-haiku-latest"
anthropic_api_key = "sk-ant-test"

[debounce]
window_ms = 2000

[processing]
busy_policy = "defer"

[store]
backend = "sqlite"
path = "/tmp/salonbot/state.db"

[[tenants]]
id = "salon-1"
name = "Salon Aurora"
utc_offset = "+03:00"
whatsapp_phone_number_id = "1098765"

[tenants.numbering]
country_code = "7"
trunk_prefix = "8"
national_length = 10

[tenants.catalog]
opens_at = "09:00"
closes_at = "21:00"

[[tenants.catalog.services]]
id = "haircut"
name = "Women's haircut"
price = { min = 1500, max = 2500 }

[[tenants.catalog.staff]]
id = "anna"
name = "Anna"
"#;

    #[test]
    fn parses_a_full_file_with_defaults() {
        let cfg = SalonbotConfig::parse(SAMPLE).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.debounce.window_ms, 2000);
        assert_eq!(cfg.debounce.max_batch_age_ms, 15_000);
        assert_eq!(cfg.debounce.joiner, " ");
        assert_eq!(cfg.processing.busy_policy, BusyPolicy::Defer);
        assert_eq!(cfg.processing.abandon_after_seconds, 120);
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-ant-test"));

        let tenant = &cfg.tenants[0];
        assert_eq!(tenant.offset().expect("offset").local_minus_utc(), 3 * 3600);
        let catalog = tenant.dev_catalog().expect("catalog").expect("present");
        assert_eq!(catalog.opens_at, NaiveTime::from_hms_opt(9, 0, 0).expect("time"));
        assert_eq!(catalog.services[0].duration_minutes, 60);
        assert_eq!(catalog.slot_minutes, 30);
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let mut cfg = SalonbotConfig::parse(SAMPLE).expect("parse");
        cfg.debounce.max_batch_age_ms = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = SalonbotConfig::parse(SAMPLE).expect("parse");
        cfg.store.path = None;
        assert!(cfg.validate().is_err());

        let mut cfg = SalonbotConfig::parse(SAMPLE).expect("parse");
        let duplicate = cfg.tenants[0].clone();
        cfg.tenants.push(duplicate);
        let err = cfg.validate().expect_err("duplicate tenant");
        assert!(err.to_string().contains("duplicate tenant id"));

        let mut cfg = SalonbotConfig::parse(SAMPLE).expect("parse");
        cfg.booking.mode = BookingMode::Http;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn offsets_accept_common_spellings() {
        for (raw, seconds) in [
            ("+03:00", 3 * 3600),
            ("+0300", 3 * 3600),
            ("-05", -5 * 3600),
            ("+05:30", 5 * 3600 + 1800),
            ("UTC", 0),
        ] {
            assert_eq!(
                parse_utc_offset(raw).map(|o| o.local_minus_utc()),
                Some(seconds),
                "{raw}"
            );
        }
        assert!(parse_utc_offset("03:00").is_none());
        assert!(parse_utc_offset("+25:00").is_none());
    }
}
