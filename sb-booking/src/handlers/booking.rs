use super::slots::list_slots;
use super::{
    CommandHandler, CommandOutcome, Resolution, Resolved, describe_booking, resolve_service,
    resolve_staff, upcoming,
};
use crate::backend::BookingBackend;
use crate::catalog::CatalogCache;
use crate::command::{Clarification, CommandName};
use crate::error::{BookingError, Result};
use crate::model::{
    AvailabilityQuery, Booking, BookingFingerprint, BookingRequest, ConversationContext, Service,
    StaffMember,
};
use crate::params::{HandlerSpec, ParamKind, ParamSpec, ValidatedArgs};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::json;
use std::sync::Arc;

pub struct CreateBookingHandler {
    backend: Arc<dyn BookingBackend>,
    catalog: Arc<CatalogCache>,
}

impl CreateBookingHandler {
    pub fn new(backend: Arc<dyn BookingBackend>, catalog: Arc<CatalogCache>) -> Self {
        Self { backend, catalog }
    }
}

#[async_trait]
impl CommandHandler for CreateBookingHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::CreateBooking,
            summary: "book an appointment once the client has confirmed service, specialist and time",
            params: vec![
                ParamSpec::required("service", ParamKind::Text),
                ParamSpec::required("staff", ParamKind::StaffRef),
                ParamSpec::required("datetime", ParamKind::DateTime),
            ],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        let service = match resolve_service(
            &catalog.services,
            args.text("service").unwrap_or_default(),
        ) {
            Ok(service) => service,
            Err(clarification) => return Ok(Resolution::Clarify(clarification)),
        };
        let wanted = match resolve_staff(&catalog.staff_for(&service.id), &args.staff("staff")) {
            Ok(staff) => staff,
            Err(clarification) => return Ok(Resolution::Clarify(clarification)),
        };
        let Some(start) = args.datetime("datetime") else {
            return Ok(Resolution::Clarify(Clarification::new(
                "What date and time would suit you?",
            )));
        };
        if start.with_timezone(&Utc) <= ctx.now {
            return Ok(Resolution::Clarify(Clarification::new(
                "That time has already passed. Which time would suit you?",
            )));
        }

        // A repeat of a booking the client still holds resolves to that
        // booking, so the executor replays it instead of booking again.
        let existing = self
            .backend
            .list_bookings(ctx.tenant_id(), ctx.client_phone())
            .await?;
        if let Some(held) = upcoming(existing, ctx).into_iter().find(|b| {
            b.service_id == service.id
                && b.start == start
                && wanted.as_ref().is_none_or(|m| m.id == b.staff_id)
        }) {
            if let Some(staff) = catalog.staff.iter().find(|m| m.id == held.staff_id) {
                let mut resolved = ready(ctx, service, staff.clone(), start);
                resolved.booking = Some(held);
                return Ok(Resolution::Ready(resolved));
            }
        }

        // Pin the specialist to someone actually free at that time.
        let slots = self
            .backend
            .search_availability(
                ctx.tenant_id(),
                &AvailabilityQuery {
                    service_id: service.id.clone(),
                    staff_id: wanted.as_ref().map(|m| m.id.clone()),
                    date: start.with_timezone(&ctx.utc_offset).date_naive(),
                },
            )
            .await?;
        let Some(slot) = slots.iter().find(|s| s.start == start) else {
            return Ok(Resolution::Clarify(unavailable(start, &slots)));
        };
        let Some(staff) = catalog
            .staff
            .iter()
            .find(|m| m.id == slot.staff_id)
            .cloned()
        else {
            return Err(BookingError::ResponseFormat(format!(
                "availability returned unknown staff {}",
                slot.staff_id
            )));
        };

        Ok(Resolution::Ready(ready(ctx, service, staff, start)))
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let (Some(service), Some(staff), Some(start), Some(fingerprint)) = (
            resolved.service.as_ref(),
            resolved.staff.as_ref(),
            resolved.start,
            resolved.fingerprint.as_ref(),
        ) else {
            return Err(BookingError::InvalidArguments(
                "create requires a resolved service, specialist and time".to_string(),
            ));
        };
        let request = BookingRequest {
            service_id: service.id.clone(),
            staff_id: staff.id.clone(),
            start,
            client_phone: ctx.client_phone().to_string(),
            client_name: ctx.client_name.clone(),
            comment: None,
            idempotency_key: fingerprint.idempotency_key(),
        };
        let booking = self.backend.create_booking(ctx.tenant_id(), &request).await?;
        Ok(CommandOutcome::Done {
            display: format!("Booked: {}.", describe_booking(&booking)),
            payload: json!({ "booking": booking }),
            booking: Some(booking),
        })
    }
}

fn ready(
    ctx: &ConversationContext,
    service: Service,
    staff: StaffMember,
    start: DateTime<FixedOffset>,
) -> Resolved {
    let fingerprint = BookingFingerprint {
        tenant_id: ctx.tenant_id().clone(),
        subscriber_id: ctx.client_phone().to_string(),
        service_id: service.id.clone(),
        staff_id: staff.id.clone(),
        start: start.with_timezone(&Utc),
    };
    Resolved {
        service: Some(service),
        staff: Some(staff),
        start: Some(start),
        fingerprint: Some(fingerprint),
        ..Resolved::default()
    }
}

pub struct CancelBookingHandler {
    backend: Arc<dyn BookingBackend>,
}

impl CancelBookingHandler {
    pub fn new(backend: Arc<dyn BookingBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CommandHandler for CancelBookingHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::CancelBooking,
            summary: "cancel one of the client's upcoming bookings",
            params: vec![ParamSpec::optional("booking_id", ParamKind::Text)],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let bookings = self
            .backend
            .list_bookings(ctx.tenant_id(), ctx.client_phone())
            .await?;
        Ok(
            match pick_booking(upcoming(bookings, ctx), args.text("booking_id"), "cancel") {
                Ok(booking) => Resolution::Ready(Resolved {
                    booking: Some(booking),
                    ..Resolved::default()
                }),
                Err(clarification) => Resolution::Clarify(clarification),
            },
        )
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let Some(booking) = resolved.booking.as_ref() else {
            return Err(BookingError::InvalidArguments(
                "cancel requires a resolved booking".to_string(),
            ));
        };
        let cancelled = self
            .backend
            .cancel_booking(ctx.tenant_id(), &booking.id)
            .await?;
        Ok(CommandOutcome::done(
            format!("Cancelled: {}.", describe_booking(&cancelled)),
            json!({ "booking": cancelled }),
        ))
    }
}

pub struct RescheduleBookingHandler {
    backend: Arc<dyn BookingBackend>,
    catalog: Arc<CatalogCache>,
}

impl RescheduleBookingHandler {
    pub fn new(backend: Arc<dyn BookingBackend>, catalog: Arc<CatalogCache>) -> Self {
        Self { backend, catalog }
    }
}

#[async_trait]
impl CommandHandler for RescheduleBookingHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::RescheduleBooking,
            summary: "move an upcoming booking to a new time (booking_id 0 = the only upcoming one)",
            params: vec![
                ParamSpec::required("booking_id", ParamKind::Text),
                ParamSpec::required("datetime", ParamKind::DateTime),
            ],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let bookings = self
            .backend
            .list_bookings(ctx.tenant_id(), ctx.client_phone())
            .await?;
        let booking = match pick_booking(upcoming(bookings, ctx), args.text("booking_id"), "move")
        {
            Ok(booking) => booking,
            Err(clarification) => return Ok(Resolution::Clarify(clarification)),
        };
        let Some(start) = args.datetime("datetime") else {
            return Ok(Resolution::Clarify(Clarification::new(
                "Which new time would suit you?",
            )));
        };
        if start.with_timezone(&Utc) <= ctx.now {
            return Ok(Resolution::Clarify(Clarification::new(
                "That time has already passed. Which time would suit you?",
            )));
        }
        if start != booking.start {
            let slots = self
                .backend
                .search_availability(
                    ctx.tenant_id(),
                    &AvailabilityQuery {
                        service_id: booking.service_id.clone(),
                        staff_id: Some(booking.staff_id.clone()),
                        date: start.with_timezone(&ctx.utc_offset).date_naive(),
                    },
                )
                .await?;
            if !slots.iter().any(|s| s.start == start) {
                return Ok(Resolution::Clarify(unavailable(start, &slots)));
            }
        }
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        Ok(Resolution::Ready(Resolved {
            service: catalog
                .services
                .iter()
                .find(|s| s.id == booking.service_id)
                .cloned(),
            start: Some(start),
            booking: Some(booking),
            ..Resolved::default()
        }))
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let (Some(booking), Some(start)) = (resolved.booking.as_ref(), resolved.start) else {
            return Err(BookingError::InvalidArguments(
                "reschedule requires a resolved booking and time".to_string(),
            ));
        };
        let moved = self
            .backend
            .reschedule_booking(ctx.tenant_id(), &booking.id, start)
            .await?;
        Ok(CommandOutcome::done(
            format!("Moved: {}.", describe_booking(&moved)),
            json!({ "booking": moved, "previous_start": booking.start }),
        ))
    }
}

pub struct CheckBookingHandler {
    backend: Arc<dyn BookingBackend>,
}

impl CheckBookingHandler {
    pub fn new(backend: Arc<dyn BookingBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CommandHandler for CheckBookingHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::CheckBooking,
            summary: "show the client's upcoming bookings",
            params: vec![],
        }
    }

    async fn resolve(
        &self,
        _args: &ValidatedArgs,
        _ctx: &ConversationContext,
    ) -> Result<Resolution> {
        Ok(Resolution::Ready(Resolved::default()))
    }

    async fn execute(
        &self,
        _resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let bookings = upcoming(
            self.backend
                .list_bookings(ctx.tenant_id(), ctx.client_phone())
                .await?,
            ctx,
        );
        let display = if bookings.is_empty() {
            "You have no upcoming bookings.".to_string()
        } else {
            let mut text = "Your upcoming bookings:".to_string();
            for booking in &bookings {
                text.push_str("\n• ");
                text.push_str(&describe_booking(booking));
            }
            text
        };
        Ok(CommandOutcome::done(display, json!({ "bookings": bookings })))
    }
}

/// Select the booking a cancel or move refers to. Only the client's own
/// upcoming bookings are candidates.
fn pick_booking(
    candidates: Vec<Booking>,
    booking_id: Option<&str>,
    verb: &str,
) -> std::result::Result<Booking, Clarification> {
    let explicit = booking_id.map(str::trim).filter(|id| !id.is_empty() && *id != "0");
    if let Some(id) = explicit {
        if let Some(booking) = candidates.iter().find(|b| b.id == id) {
            return Ok(booking.clone());
        }
    }
    match (candidates.as_slice(), explicit) {
        ([], _) => Err(Clarification::new(
            "I can't find any upcoming bookings for this number. Which appointment do you mean?",
        )),
        ([only], None) => Ok(only.clone()),
        _ => Err(Clarification::new(format!("Which booking should I {verb}?"))
            .with_options(candidates.iter().map(describe_booking).collect())),
    }
}

fn unavailable(start: DateTime<FixedOffset>, slots: &[crate::model::Slot]) -> Clarification {
    let requested = start.format("%Y-%m-%d %H:%M");
    if slots.is_empty() {
        return Clarification::new(format!(
            "{requested} isn't available and that day is fully booked. Would another day suit you?"
        ));
    }
    Clarification::new(format!(
        "{requested} isn't available. These times are free that day:"
    ))
    .with_options(list_slots(slots))
}
