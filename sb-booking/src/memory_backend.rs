use crate::backend::BookingBackend;
use crate::error::{BookingError, Result};
use crate::model::{
    AvailabilityQuery, Booking, BookingRequest, BookingStatus, PortfolioItem, Service, Slot,
    StaffMember,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use sb_channels::TenantId;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Static catalog and schedule for one tenant of the in-memory backend.
#[derive(Debug, Clone)]
pub struct TenantCatalog {
    pub services: Vec<Service>,
    pub staff: Vec<StaffMember>,
    pub portfolio: Vec<PortfolioItem>,
    pub utc_offset: FixedOffset,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub slot_minutes: u32,
}

struct TenantState {
    catalog: TenantCatalog,
    bookings: Vec<StoredBooking>,
}

struct StoredBooking {
    booking: Booking,
    idempotency_key: Option<String>,
}

/// Process-local booking system used for development and tests.
pub struct InMemoryBookingBackend {
    tenants: DashMap<TenantId, TenantState>,
    next_id: AtomicU64,
    creations: AtomicUsize,
    failures_left: AtomicU32,
    latency: Option<Duration>,
}

impl Default for InMemoryBookingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBookingBackend {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            next_id: AtomicU64::new(1),
            creations: AtomicUsize::new(0),
            failures_left: AtomicU32::new(0),
            latency: None,
        }
    }

    pub fn with_tenant(self, tenant: impl Into<TenantId>, catalog: TenantCatalog) -> Self {
        self.tenants.insert(
            tenant.into(),
            TenantState {
                catalog,
                bookings: Vec::new(),
            },
        );
        self
    }

    /// Delay every call, to exercise caller timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next_calls(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of bookings actually created (idempotent replays excluded).
    pub fn created_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BookingError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }

    fn tenant<'a>(
        &'a self,
        tenant: &TenantId,
    ) -> Result<dashmap::mapref::one::RefMut<'a, TenantId, TenantState>> {
        self.tenants
            .get_mut(tenant)
            .ok_or_else(|| BookingError::NotFound(format!("tenant {tenant}")))
    }
}

impl TenantState {
    fn service(&self, service_id: &str) -> Result<&Service> {
        self.catalog
            .services
            .iter()
            .find(|s| s.id == service_id)
            .ok_or_else(|| BookingError::NotFound(format!("service {service_id}")))
    }

    fn staff(&self, staff_id: &str) -> Result<&StaffMember> {
        self.catalog
            .staff
            .iter()
            .find(|s| s.id == staff_id)
            .ok_or_else(|| BookingError::NotFound(format!("staff {staff_id}")))
    }

    fn is_free(
        &self,
        staff_id: &str,
        start: DateTime<FixedOffset>,
        minutes: u32,
        ignore_booking: Option<&str>,
    ) -> bool {
        let end = start + ChronoDuration::minutes(i64::from(minutes));
        !self.bookings.iter().any(|stored| {
            let b = &stored.booking;
            b.status == BookingStatus::Confirmed
                && b.staff_id == staff_id
                && Some(b.id.as_str()) != ignore_booking
                && b.start < end
                && start < b.start + ChronoDuration::minutes(i64::from(b.duration_minutes))
        })
    }

    fn within_hours(&self, start: DateTime<FixedOffset>, minutes: u32) -> bool {
        let local = start.with_timezone(&self.catalog.utc_offset);
        let begins = local.time();
        let ends = begins + ChronoDuration::minutes(i64::from(minutes));
        begins >= self.catalog.opens_at && ends <= self.catalog.closes_at && ends > begins
    }

    fn booking_mut(&mut self, booking_id: &str) -> Result<&mut Booking> {
        self.bookings
            .iter_mut()
            .map(|stored| &mut stored.booking)
            .find(|b| b.id == booking_id)
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))
    }
}

#[async_trait]
impl BookingBackend for InMemoryBookingBackend {
    async fn list_services(&self, tenant: &TenantId) -> Result<Vec<Service>> {
        self.enter().await?;
        Ok(self.tenant(tenant)?.catalog.services.clone())
    }

    async fn list_staff(&self, tenant: &TenantId) -> Result<Vec<StaffMember>> {
        self.enter().await?;
        Ok(self.tenant(tenant)?.catalog.staff.clone())
    }

    async fn search_availability(
        &self,
        tenant: &TenantId,
        query: &AvailabilityQuery,
    ) -> Result<Vec<Slot>> {
        self.enter().await?;
        let state = self.tenant(tenant)?;
        let service = state.service(&query.service_id)?;
        let minutes = service.duration_minutes;
        let offset = state.catalog.utc_offset;
        let step = i64::from(state.catalog.slot_minutes.max(5));
        let now = Utc::now();

        let mut slots = Vec::new();
        for member in state.catalog.staff.iter().filter(|m| {
            m.performs(&service.id)
                && query
                    .staff_id
                    .as_deref()
                    .is_none_or(|wanted| wanted == m.id)
        }) {
            let Some(mut start) = offset
                .from_local_datetime(&query.date.and_time(state.catalog.opens_at))
                .single()
            else {
                continue;
            };
            while state.within_hours(start, minutes) {
                if start.with_timezone(&Utc) > now && state.is_free(&member.id, start, minutes, None)
                {
                    slots.push(Slot {
                        staff_id: member.id.clone(),
                        staff_name: member.name.clone(),
                        start,
                        duration_minutes: minutes,
                    });
                }
                start += ChronoDuration::minutes(step);
            }
        }
        slots.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.staff_id.cmp(&b.staff_id)));
        Ok(slots)
    }

    async fn create_booking(&self, tenant: &TenantId, request: &BookingRequest) -> Result<Booking> {
        self.enter().await?;
        let mut state = self.tenant(tenant)?;

        // A key only replays while its booking is live; a cancelled slot can
        // be booked again.
        if let Some(existing) = state.bookings.iter().find(|s| {
            s.booking.status == BookingStatus::Confirmed
                && s.idempotency_key.as_deref() == Some(request.idempotency_key.as_str())
        }) {
            return Ok(existing.booking.clone());
        }

        let service = state.service(&request.service_id)?.clone();
        let member = state.staff(&request.staff_id)?.clone();
        if !member.performs(&service.id) {
            return Err(BookingError::InvalidArguments(format!(
                "{} does not perform {}",
                member.name, service.name
            )));
        }
        if !state.within_hours(request.start, service.duration_minutes) {
            return Err(BookingError::InvalidArguments(
                "requested time is outside working hours".to_string(),
            ));
        }
        if !state.is_free(&member.id, request.start, service.duration_minutes, None) {
            return Err(BookingError::Conflict(format!(
                "{} is busy at {}",
                member.name,
                request.start.format("%Y-%m-%d %H:%M")
            )));
        }

        let booking = Booking {
            id: format!("bk-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            service_id: service.id,
            service_name: service.name,
            staff_id: member.id,
            staff_name: member.name,
            start: request.start,
            duration_minutes: service.duration_minutes,
            client_phone: request.client_phone.clone(),
            status: BookingStatus::Confirmed,
        };
        state.bookings.push(StoredBooking {
            booking: booking.clone(),
            idempotency_key: Some(request.idempotency_key.clone()),
        });
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(booking)
    }

    async fn cancel_booking(&self, tenant: &TenantId, booking_id: &str) -> Result<Booking> {
        self.enter().await?;
        let mut state = self.tenant(tenant)?;
        let booking = state.booking_mut(booking_id)?;
        if booking.status == BookingStatus::Cancelled {
            return Err(BookingError::Conflict(format!(
                "booking {booking_id} is already cancelled"
            )));
        }
        booking.status = BookingStatus::Cancelled;
        Ok(booking.clone())
    }

    async fn reschedule_booking(
        &self,
        tenant: &TenantId,
        booking_id: &str,
        start: DateTime<FixedOffset>,
    ) -> Result<Booking> {
        self.enter().await?;
        let mut state = self.tenant(tenant)?;
        let current = state.booking_mut(booking_id)?.clone();
        if current.status == BookingStatus::Cancelled {
            return Err(BookingError::Conflict(format!(
                "booking {booking_id} is cancelled"
            )));
        }
        if !state.within_hours(start, current.duration_minutes) {
            return Err(BookingError::InvalidArguments(
                "requested time is outside working hours".to_string(),
            ));
        }
        if !state.is_free(&current.staff_id, start, current.duration_minutes, Some(booking_id)) {
            return Err(BookingError::Conflict(format!(
                "{} is busy at {}",
                current.staff_name,
                start.format("%Y-%m-%d %H:%M")
            )));
        }
        let booking = state.booking_mut(booking_id)?;
        booking.start = start;
        Ok(booking.clone())
    }

    async fn list_bookings(&self, tenant: &TenantId, client_phone: &str) -> Result<Vec<Booking>> {
        self.enter().await?;
        let state = self.tenant(tenant)?;
        let mut bookings: Vec<Booking> = state
            .bookings
            .iter()
            .map(|s| &s.booking)
            .filter(|b| b.client_phone == client_phone)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(bookings)
    }

    async fn list_portfolio(
        &self,
        tenant: &TenantId,
        staff_id: Option<&str>,
    ) -> Result<Vec<PortfolioItem>> {
        self.enter().await?;
        let state = self.tenant(tenant)?;
        Ok(state
            .catalog
            .portfolio
            .iter()
            .filter(|item| staff_id.is_none_or(|id| id == item.staff_id))
            .cloned()
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::NaiveDate;

    fn request(staff: &str, start: &str, key: &str) -> BookingRequest {
        BookingRequest {
            service_id: "haircut".to_string(),
            staff_id: staff.to_string(),
            start: at(start),
            client_phone: "79123456789".to_string(),
            client_name: None,
            comment: None,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn availability_excludes_booked_slots() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        let query = AvailabilityQuery {
            service_id: "haircut".to_string(),
            staff_id: Some("anna".to_string()),
            date: NaiveDate::from_ymd_opt(2030, 3, 14).expect("date"),
        };
        let before = backend.search_availability(&tenant, &query).await.expect("slots");
        assert_eq!(before.len(), 10);

        backend
            .create_booking(&tenant, &request("anna", "2030-03-14T15:00:00+03:00", "k1"))
            .await
            .expect("create");
        let after = backend.search_availability(&tenant, &query).await.expect("slots");
        assert_eq!(after.len(), 9);
        assert!(after.iter().all(|s| s.start != at("2030-03-14T15:00:00+03:00")));
    }

    #[tokio::test]
    async fn same_idempotency_key_returns_the_same_booking() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        let first = backend
            .create_booking(&tenant, &request("anna", "2030-03-14T15:00:00+03:00", "k1"))
            .await
            .expect("create");
        let again = backend
            .create_booking(&tenant, &request("anna", "2030-03-14T15:00:00+03:00", "k1"))
            .await
            .expect("replay");
        assert_eq!(first, again);
        assert_eq!(backend.created_count(), 1);
    }

    #[tokio::test]
    async fn overlapping_booking_is_a_conflict() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        backend
            .create_booking(&tenant, &request("anna", "2030-03-14T15:00:00+03:00", "k1"))
            .await
            .expect("create");
        let err = backend
            .create_booking(&tenant, &request("anna", "2030-03-14T15:30:00+03:00", "k2"))
            .await
            .expect_err("overlap");
        assert!(matches!(err, BookingError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_then_reschedule_is_rejected() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        let booking = backend
            .create_booking(&tenant, &request("maria", "2030-03-14T11:00:00+03:00", "k1"))
            .await
            .expect("create");
        let cancelled = backend
            .cancel_booking(&tenant, &booking.id)
            .await
            .expect("cancel");
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        let err = backend
            .reschedule_booking(&tenant, &booking.id, at("2030-03-14T12:00:00+03:00"))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, BookingError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancelled_booking_does_not_absorb_a_new_request() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        let first = backend
            .create_booking(&tenant, &request("maria", "2030-03-14T11:00:00+03:00", "k1"))
            .await
            .expect("create");
        backend
            .cancel_booking(&tenant, &first.id)
            .await
            .expect("cancel");
        let second = backend
            .create_booking(&tenant, &request("maria", "2030-03-14T11:00:00+03:00", "k1"))
            .await
            .expect("rebook");
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, BookingStatus::Confirmed);
        assert_eq!(backend.created_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_run_out() {
        let backend = backend();
        let tenant = TenantId::new(TENANT);
        backend.fail_next_calls(1);
        let err = backend.list_services(&tenant).await.expect_err("injected");
        assert!(err.is_transient());
        assert_eq!(backend.list_services(&tenant).await.expect("ok").len(), 3);
    }
}
