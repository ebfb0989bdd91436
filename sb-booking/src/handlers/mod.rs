mod booking;
mod catalog;
mod slots;

use crate::backend::BookingBackend;
use crate::catalog::CatalogCache;
use crate::command::Clarification;
use crate::error::Result;
use crate::model::{
    Booking, BookingFingerprint, BookingStatus, ConversationContext, Service, StaffMember,
};
use crate::params::{HandlerSpec, StaffRef, ValidatedArgs};
use crate::resolve::{Match, match_service, match_staff};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::sync::Arc;

pub use booking::{
    CancelBookingHandler, CheckBookingHandler, CreateBookingHandler, RescheduleBookingHandler,
};
pub use catalog::{
    ShowPortfolioHandler, ShowPricesHandler, ShowServicesHandler, ShowStaffHandler,
};
pub use slots::SearchSlotsHandler;

/// One command implementation. `resolve` turns validated parameters into
/// concrete catalog entities without side effects; `execute` performs the
/// backend call. The executor sits between the two for idempotency checks.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn spec(&self) -> HandlerSpec;

    async fn resolve(&self, args: &ValidatedArgs, ctx: &ConversationContext)
    -> Result<Resolution>;

    async fn execute(&self, resolved: &Resolved, ctx: &ConversationContext)
    -> Result<CommandOutcome>;
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Ready(Resolved),
    Clarify(Clarification),
}

#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub service: Option<Service>,
    pub staff: Option<StaffMember>,
    pub date: Option<NaiveDate>,
    pub start: Option<DateTime<FixedOffset>>,
    /// Target of a cancel or move, or the live booking a create repeats.
    pub booking: Option<Booking>,
    /// Set by handlers that create bookings.
    pub fingerprint: Option<BookingFingerprint>,
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Done {
        display: String,
        payload: serde_json::Value,
        booking: Option<Booking>,
    },
    Clarify(Clarification),
}

impl CommandOutcome {
    fn done(display: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Done {
            display: display.into(),
            payload,
            booking: None,
        }
    }
}

/// The full command set against one booking backend.
pub fn default_handlers(
    backend: Arc<dyn BookingBackend>,
    catalog: Arc<CatalogCache>,
) -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(SearchSlotsHandler::new(backend.clone(), catalog.clone())),
        Arc::new(CreateBookingHandler::new(backend.clone(), catalog.clone())),
        Arc::new(CancelBookingHandler::new(backend.clone())),
        Arc::new(RescheduleBookingHandler::new(backend.clone(), catalog.clone())),
        Arc::new(CheckBookingHandler::new(backend.clone())),
        Arc::new(ShowPricesHandler::new(catalog.clone())),
        Arc::new(ShowServicesHandler::new(catalog.clone())),
        Arc::new(ShowStaffHandler::new(catalog.clone())),
        Arc::new(ShowPortfolioHandler::new(backend, catalog)),
    ]
}

pub(crate) fn resolve_service(
    services: &[Service],
    query: &str,
) -> std::result::Result<Service, Clarification> {
    match match_service(services, query) {
        Match::Found(service) => Ok(service.clone()),
        Match::Ambiguous(hits) => Err(Clarification::new(format!(
            "Which service do you mean by \"{query}\"?"
        ))
        .with_options(hits.iter().map(|s| s.name.clone()).collect())),
        Match::NotFound => Err(Clarification::new(format!(
            "I couldn't find a service called \"{query}\". Which of these would you like?"
        ))
        .with_options(services.iter().map(|s| s.name.clone()).collect())),
    }
}

/// `Ok(None)` means any specialist will do.
pub(crate) fn resolve_staff(
    candidates: &[&StaffMember],
    staff: &StaffRef,
) -> std::result::Result<Option<StaffMember>, Clarification> {
    let StaffRef::Named(query) = staff else {
        return Ok(None);
    };
    let owned: Vec<StaffMember> = candidates.iter().map(|m| (*m).clone()).collect();
    match match_staff(&owned, query) {
        Match::Found(member) => Ok(Some(member.clone())),
        Match::Ambiguous(hits) => Err(Clarification::new(format!(
            "Which specialist do you mean by \"{query}\"?"
        ))
        .with_options(hits.iter().map(|m| m.name.clone()).collect())),
        Match::NotFound => Err(Clarification::new(format!(
            "\"{query}\" doesn't perform this service. Would one of these specialists suit you?"
        ))
        .with_options(owned.iter().map(|m| m.name.clone()).collect())),
    }
}

pub(crate) fn describe_booking(booking: &Booking) -> String {
    format!(
        "{} with {}, {}",
        booking.service_name,
        booking.staff_name,
        booking.start.format("%Y-%m-%d at %H:%M")
    )
}

/// Confirmed bookings of this client that have not started yet.
pub(crate) fn upcoming(bookings: Vec<Booking>, ctx: &ConversationContext) -> Vec<Booking> {
    bookings
        .into_iter()
        .filter(|b| b.status == BookingStatus::Confirmed && b.start > ctx.now)
        .collect()
}
