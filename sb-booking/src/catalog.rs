use crate::backend::BookingBackend;
use crate::error::Result;
use crate::model::{Service, StaffMember};
use dashmap::DashMap;
use sb_channels::TenantId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub services: Vec<Service>,
    pub staff: Vec<StaffMember>,
}

impl Catalog {
    pub fn staff_for(&self, service_id: &str) -> Vec<&StaffMember> {
        self.staff.iter().filter(|m| m.performs(service_id)).collect()
    }
}

/// Per-tenant catalog snapshot with a time-to-live, shared by prompt
/// building and command handlers.
pub struct CatalogCache {
    backend: Arc<dyn BookingBackend>,
    ttl: Duration,
    entries: DashMap<TenantId, (Instant, Arc<Catalog>)>,
}

impl CatalogCache {
    pub fn new(backend: Arc<dyn BookingBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            entries: DashMap::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tenant = %tenant))]
    pub async fn get(&self, tenant: &TenantId) -> Result<Arc<Catalog>> {
        if let Some(entry) = self.entries.get(tenant) {
            let (fetched_at, catalog) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(catalog.clone());
            }
        }

        let (services, staff) = tokio::try_join!(
            self.backend.list_services(tenant),
            self.backend.list_staff(tenant)
        )?;
        let catalog = Arc::new(Catalog { services, staff });
        tracing::debug!(
            services = catalog.services.len(),
            staff = catalog.staff.len(),
            "catalog refreshed"
        );
        self.entries
            .insert(tenant.clone(), (Instant::now(), catalog.clone()));
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::fixtures::{TENANT, backend};

    #[tokio::test(start_paused = true)]
    async fn catalog_is_served_from_cache_until_ttl() {
        let backend = Arc::new(backend());
        let cache = CatalogCache::new(backend.clone(), Duration::from_secs(60));
        let tenant = TenantId::new(TENANT);

        assert_eq!(cache.get(&tenant).await.expect("catalog").services.len(), 3);

        // A failing backend is not consulted while the entry is fresh.
        backend.fail_next_calls(2);
        assert_eq!(cache.get(&tenant).await.expect("cached").staff.len(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&tenant).await.is_err());
    }

    #[test]
    fn staff_for_filters_by_service() {
        let catalog = Catalog {
            services: vec![],
            staff: crate::memory_backend::fixtures::catalog().staff,
        };
        let names: Vec<&str> = catalog
            .staff_for("haircut")
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["Anna", "Maria"]);
    }
}
