use crate::error::Result;
use crate::model::{
    AvailabilityQuery, Booking, BookingRequest, PortfolioItem, Service, Slot, StaffMember,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sb_channels::TenantId;

/// The salon's booking system. Every call is scoped to one tenant.
#[async_trait]
pub trait BookingBackend: Send + Sync {
    async fn list_services(&self, tenant: &TenantId) -> Result<Vec<Service>>;

    async fn list_staff(&self, tenant: &TenantId) -> Result<Vec<StaffMember>>;

    async fn search_availability(
        &self,
        tenant: &TenantId,
        query: &AvailabilityQuery,
    ) -> Result<Vec<Slot>>;

    async fn create_booking(&self, tenant: &TenantId, request: &BookingRequest) -> Result<Booking>;

    async fn cancel_booking(&self, tenant: &TenantId, booking_id: &str) -> Result<Booking>;

    async fn reschedule_booking(
        &self,
        tenant: &TenantId,
        booking_id: &str,
        start: DateTime<FixedOffset>,
    ) -> Result<Booking>;

    /// Upcoming and past bookings for one client phone.
    async fn list_bookings(&self, tenant: &TenantId, client_phone: &str) -> Result<Vec<Booking>>;

    async fn list_portfolio(
        &self,
        tenant: &TenantId,
        staff_id: Option<&str>,
    ) -> Result<Vec<PortfolioItem>>;
}
