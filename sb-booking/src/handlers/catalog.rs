use super::{CommandHandler, CommandOutcome, Resolution, Resolved, resolve_service, resolve_staff};
use crate::backend::BookingBackend;
use crate::catalog::CatalogCache;
use crate::command::CommandName;
use crate::error::Result;
use crate::model::{ConversationContext, Service};
use crate::params::{HandlerSpec, ParamKind, ParamSpec, ValidatedArgs};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

fn price_line(service: &Service) -> String {
    let price = service
        .price
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "price on request".to_string());
    format!("{}: {} ({} min)", service.name, price, service.duration_minutes)
}

fn bullet_list(header: &str, lines: impl IntoIterator<Item = String>) -> String {
    let mut text = header.to_string();
    for line in lines {
        text.push_str("\n• ");
        text.push_str(&line);
    }
    text
}

pub struct ShowPricesHandler {
    catalog: Arc<CatalogCache>,
}

impl ShowPricesHandler {
    pub fn new(catalog: Arc<CatalogCache>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl CommandHandler for ShowPricesHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::ShowPrices,
            summary: "show prices, for one service or all",
            params: vec![ParamSpec::optional("service", ParamKind::Text)],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let Some(query) = args.text("service") else {
            return Ok(Resolution::Ready(Resolved::default()));
        };
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        Ok(match resolve_service(&catalog.services, query) {
            Ok(service) => Resolution::Ready(Resolved {
                service: Some(service),
                ..Resolved::default()
            }),
            Err(clarification) => Resolution::Clarify(clarification),
        })
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        if let Some(service) = resolved.service.as_ref() {
            return Ok(CommandOutcome::done(
                price_line(service),
                json!({ "services": [service] }),
            ));
        }
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        if catalog.services.is_empty() {
            return Ok(CommandOutcome::done(
                "The price list isn't available right now.",
                json!({ "services": [] }),
            ));
        }
        Ok(CommandOutcome::done(
            bullet_list("Prices:", catalog.services.iter().map(price_line)),
            json!({ "services": catalog.services }),
        ))
    }
}

pub struct ShowServicesHandler {
    catalog: Arc<CatalogCache>,
}

impl ShowServicesHandler {
    pub fn new(catalog: Arc<CatalogCache>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl CommandHandler for ShowServicesHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::ShowServices,
            summary: "list the services offered",
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
        let catalog = self.catalog.get(ctx.tenant_id()).await?;

        // Group by category, keeping catalog order within and across groups.
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for service in &catalog.services {
            let category = service
                .category
                .clone()
                .unwrap_or_else(|| "Other".to_string());
            match groups.iter_mut().find(|(c, _)| *c == category) {
                Some((_, names)) => names.push(service.name.clone()),
                None => groups.push((category, vec![service.name.clone()])),
            }
        }
        let display = if groups.len() <= 1 {
            bullet_list(
                "Our services:",
                catalog.services.iter().map(|s| s.name.clone()),
            )
        } else {
            bullet_list(
                "Our services:",
                groups
                    .into_iter()
                    .map(|(category, names)| format!("{category}: {}", names.join(", "))),
            )
        };
        Ok(CommandOutcome::done(
            display,
            json!({ "services": catalog.services }),
        ))
    }
}

pub struct ShowStaffHandler {
    catalog: Arc<CatalogCache>,
}

impl ShowStaffHandler {
    pub fn new(catalog: Arc<CatalogCache>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl CommandHandler for ShowStaffHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::ShowStaff,
            summary: "list the specialists",
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
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        let lines = catalog.staff.iter().map(|m| match m.specialization.as_deref() {
            Some(role) => format!("{}, {}", m.name, role),
            None => m.name.clone(),
        });
        Ok(CommandOutcome::done(
            bullet_list("Our specialists:", lines),
            json!({ "staff": catalog.staff }),
        ))
    }
}

pub struct ShowPortfolioHandler {
    backend: Arc<dyn BookingBackend>,
    catalog: Arc<CatalogCache>,
}

impl ShowPortfolioHandler {
    pub fn new(backend: Arc<dyn BookingBackend>, catalog: Arc<CatalogCache>) -> Self {
        Self { backend, catalog }
    }
}

#[async_trait]
impl CommandHandler for ShowPortfolioHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::ShowPortfolio,
            summary: "share work examples, for one specialist or all",
            params: vec![ParamSpec::optional("staff", ParamKind::StaffRef)],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        let everyone: Vec<_> = catalog.staff.iter().collect();
        Ok(match resolve_staff(&everyone, &args.staff("staff")) {
            Ok(staff) => Resolution::Ready(Resolved {
                staff,
                ..Resolved::default()
            }),
            Err(clarification) => Resolution::Clarify(clarification),
        })
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let staff_id = resolved.staff.as_ref().map(|m| m.id.as_str());
        let items = self.backend.list_portfolio(ctx.tenant_id(), staff_id).await?;
        let display = if items.is_empty() {
            "There are no work examples to share yet.".to_string()
        } else {
            let catalog = self.catalog.get(ctx.tenant_id()).await?;
            bullet_list(
                "Work examples:",
                items.iter().map(|item| {
                    let author = catalog
                        .staff
                        .iter()
                        .find(|m| m.id == item.staff_id)
                        .map(|m| m.name.as_str())
                        .unwrap_or(item.staff_id.as_str());
                    format!("{} by {}: {}", item.title, author, item.url)
                }),
            )
        };
        Ok(CommandOutcome::done(display, json!({ "portfolio": items })))
    }
}
