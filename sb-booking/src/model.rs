use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sb_channels::{ConversationKey, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
}

impl fmt::Display for PriceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max > self.min => write!(f, "{}–{}", self.min, max),
            _ => write!(f, "{}", self.min),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<PriceRange>,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u32,
    /// Alternative names customers use ("cut", "trim").
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_duration_minutes() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub specialization: Option<String>,
    /// Services this person performs; empty means all.
    #[serde(default)]
    pub service_ids: Vec<String>,
}

impl StaffMember {
    pub fn performs(&self, service_id: &str) -> bool {
        self.service_ids.is_empty() || self.service_ids.iter().any(|id| id == service_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub staff_id: String,
    pub staff_name: String,
    pub start: DateTime<FixedOffset>,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub service_id: String,
    #[serde(default)]
    pub staff_id: Option<String>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub service_id: String,
    pub staff_id: String,
    pub start: DateTime<FixedOffset>,
    pub client_phone: String,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Forwarded to the backend so transport retries cannot double-book.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub staff_id: String,
    pub staff_name: String,
    pub start: DateTime<FixedOffset>,
    pub duration_minutes: u32,
    pub client_phone: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioItem {
    pub staff_id: String,
    pub title: String,
    pub url: String,
}

/// Identity of a booking side effect: two creates with the same fingerprint
/// are the same booking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingFingerprint {
    pub tenant_id: TenantId,
    pub subscriber_id: String,
    pub service_id: String,
    pub staff_id: String,
    pub start: DateTime<Utc>,
}

impl BookingFingerprint {
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.tenant_id,
            self.subscriber_id,
            self.service_id,
            self.staff_id,
            self.start.timestamp()
        )
    }
}

/// A booking created (or replayed) during a turn, carried into the next turn
/// so a repeated create can be recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub fingerprint: BookingFingerprint,
    pub booking: Booking,
    pub turn_id: Uuid,
}

/// Per-turn facts every handler may need.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub key: ConversationKey,
    pub turn_id: Uuid,
    pub client_name: Option<String>,
    pub utc_offset: FixedOffset,
    pub now: DateTime<Utc>,
    /// Bookings created in the immediately preceding turn.
    pub recent_bookings: Vec<BookingRecord>,
}

impl ConversationContext {
    pub fn tenant_id(&self) -> &TenantId {
        self.key.tenant_id()
    }

    pub fn client_phone(&self) -> &str {
        self.key.subscriber_id().as_str()
    }

    pub fn local_now(&self) -> DateTime<FixedOffset> {
        self.now.with_timezone(&self.utc_offset)
    }

    pub fn today(&self) -> NaiveDate {
        self.local_now().date_naive()
    }
}
