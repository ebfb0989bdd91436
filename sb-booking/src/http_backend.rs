use crate::backend::BookingBackend;
use crate::error::{BookingError, Result};
use crate::model::{
    AvailabilityQuery, Booking, BookingRequest, PortfolioItem, Service, Slot, StaffMember,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::{Method, RequestBuilder, Url};
use sb_channels::TenantId;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

/// REST client for a salon booking API rooted at `base_url`:
/// `/tenants/{tenant}/services`, `/staff`, `/availability`, `/bookings`,
/// `/portfolio`.
#[derive(Clone)]
pub struct HttpBookingBackend {
    http: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
    timeout_ms: u64,
}

impl HttpBookingBackend {
    pub fn new(base_url: &str, api_token: Option<&str>, request_timeout: Duration) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(BookingError::InvalidArguments(
                "booking base_url is required".to_string(),
            ));
        }
        let base_url = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| BookingError::InvalidArguments(format!("invalid booking base_url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_token: api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            timeout_ms: request_timeout.as_millis() as u64,
        })
    }

    fn url(&self, tenant: &TenantId, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("tenants/{}/{}", tenant.as_str(), path))
            .map_err(|e| BookingError::InvalidArguments(format!("invalid booking url: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.api_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BookingError::Timeout(self.timeout_ms)
            } else {
                BookingError::from(e)
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read response body>".to_string());
        if !status.is_success() {
            return Err(status_error(status.as_u16(), body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn status_error(status: u16, body: String) -> BookingError {
    match status {
        400 | 422 => BookingError::InvalidArguments(body),
        404 => BookingError::NotFound(body),
        409 => BookingError::Conflict(body),
        _ => BookingError::Status { status, body },
    }
}

#[async_trait]
impl BookingBackend for HttpBookingBackend {
    async fn list_services(&self, tenant: &TenantId) -> Result<Vec<Service>> {
        let url = self.url(tenant, "services")?;
        self.send(self.request(Method::GET, url)).await
    }

    async fn list_staff(&self, tenant: &TenantId) -> Result<Vec<StaffMember>> {
        let url = self.url(tenant, "staff")?;
        self.send(self.request(Method::GET, url)).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tenant = %tenant, service = %query.service_id, date = %query.date))]
    async fn search_availability(
        &self,
        tenant: &TenantId,
        query: &AvailabilityQuery,
    ) -> Result<Vec<Slot>> {
        let mut url = self.url(tenant, "availability")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("service_id", &query.service_id);
            pairs.append_pair("date", &query.date.format("%Y-%m-%d").to_string());
            if let Some(staff_id) = query.staff_id.as_deref() {
                pairs.append_pair("staff_id", staff_id);
            }
        }
        self.send(self.request(Method::GET, url)).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(tenant = %tenant, service = %request.service_id, staff = %request.staff_id))]
    async fn create_booking(&self, tenant: &TenantId, request: &BookingRequest) -> Result<Booking> {
        let url = self.url(tenant, "bookings")?;
        let builder = self
            .request(Method::POST, url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request);
        self.send(builder).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(tenant = %tenant, booking = %booking_id))]
    async fn cancel_booking(&self, tenant: &TenantId, booking_id: &str) -> Result<Booking> {
        let url = self.url(tenant, &format!("bookings/{booking_id}/cancel"))?;
        self.send(self.request(Method::POST, url)).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(tenant = %tenant, booking = %booking_id))]
    async fn reschedule_booking(
        &self,
        tenant: &TenantId,
        booking_id: &str,
        start: DateTime<FixedOffset>,
    ) -> Result<Booking> {
        let url = self.url(tenant, &format!("bookings/{booking_id}"))?;
        let builder = self
            .request(Method::PATCH, url)
            .json(&json!({ "start": start.to_rfc3339() }));
        self.send(builder).await
    }

    async fn list_bookings(&self, tenant: &TenantId, client_phone: &str) -> Result<Vec<Booking>> {
        let mut url = self.url(tenant, "bookings")?;
        url.query_pairs_mut().append_pair("client_phone", client_phone);
        self.send(self.request(Method::GET, url)).await
    }

    async fn list_portfolio(
        &self,
        tenant: &TenantId,
        staff_id: Option<&str>,
    ) -> Result<Vec<PortfolioItem>> {
        let mut url = self.url(tenant, "portfolio")?;
        if let Some(staff_id) = staff_id {
            url.query_pairs_mut().append_pair("staff_id", staff_id);
        }
        self.send(self.request(Method::GET, url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_scoped_by_tenant() {
        let backend =
            HttpBookingBackend::new("https://booking.example/api/v2/", None, Duration::from_secs(5))
                .expect("backend");
        let url = backend
            .url(&TenantId::new("salon-1"), "bookings/42/cancel")
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://booking.example/api/v2/tenants/salon-1/bookings/42/cancel"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        assert!(HttpBookingBackend::new("  ", None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(status_error(409, String::new()), BookingError::Conflict(_)));
        assert!(matches!(status_error(404, String::new()), BookingError::NotFound(_)));
        assert!(status_error(503, String::new()).is_transient());
        assert!(!status_error(401, String::new()).is_transient());
    }
}
