use super::{CommandHandler, CommandOutcome, Resolution, Resolved, resolve_service, resolve_staff};
use crate::backend::BookingBackend;
use crate::catalog::CatalogCache;
use crate::command::{Clarification, CommandName};
use crate::error::{BookingError, Result};
use crate::model::{AvailabilityQuery, ConversationContext, Slot};
use crate::params::{HandlerSpec, ParamKind, ParamSpec, ValidatedArgs};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const MAX_LISTED_SLOTS: usize = 12;

pub struct SearchSlotsHandler {
    backend: Arc<dyn BookingBackend>,
    catalog: Arc<CatalogCache>,
}

impl SearchSlotsHandler {
    pub fn new(backend: Arc<dyn BookingBackend>, catalog: Arc<CatalogCache>) -> Self {
        Self { backend, catalog }
    }
}

#[async_trait]
impl CommandHandler for SearchSlotsHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: CommandName::SearchSlots,
            summary: "find free appointment times",
            params: vec![
                ParamSpec::required("service", ParamKind::Text),
                ParamSpec::optional("staff", ParamKind::StaffRef),
                ParamSpec::optional("date", ParamKind::Date),
            ],
        }
    }

    async fn resolve(
        &self,
        args: &ValidatedArgs,
        ctx: &ConversationContext,
    ) -> Result<Resolution> {
        let catalog = self.catalog.get(ctx.tenant_id()).await?;
        let query = args.text("service").unwrap_or_default();
        let service = match resolve_service(&catalog.services, query) {
            Ok(service) => service,
            Err(clarification) => return Ok(Resolution::Clarify(clarification)),
        };
        let staff = match resolve_staff(&catalog.staff_for(&service.id), &args.staff("staff")) {
            Ok(staff) => staff,
            Err(clarification) => return Ok(Resolution::Clarify(clarification)),
        };
        let date = args.date("date").unwrap_or_else(|| ctx.today());
        if date < ctx.today() {
            return Ok(Resolution::Clarify(Clarification::new(
                "That date has already passed. Which date would suit you?",
            )));
        }
        Ok(Resolution::Ready(Resolved {
            service: Some(service),
            staff,
            date: Some(date),
            ..Resolved::default()
        }))
    }

    async fn execute(
        &self,
        resolved: &Resolved,
        ctx: &ConversationContext,
    ) -> Result<CommandOutcome> {
        let (Some(service), Some(date)) = (resolved.service.as_ref(), resolved.date) else {
            return Err(BookingError::InvalidArguments(
                "search requires a service and a date".to_string(),
            ));
        };
        let query = AvailabilityQuery {
            service_id: service.id.clone(),
            staff_id: resolved.staff.as_ref().map(|m| m.id.clone()),
            date,
        };
        let slots = self
            .backend
            .search_availability(ctx.tenant_id(), &query)
            .await?;

        let day = date.format("%Y-%m-%d");
        let display = if slots.is_empty() {
            format!("There are no free times for {} on {day}.", service.name)
        } else {
            let mut text = format!("Free times for {} on {day}:", service.name);
            for line in list_slots(&slots) {
                text.push_str("\n• ");
                text.push_str(&line);
            }
            text
        };
        Ok(CommandOutcome::done(
            display,
            json!({
                "service_id": service.id,
                "date": day.to_string(),
                "slots": slots,
            }),
        ))
    }
}

/// One line per start time, naming every specialist free at that time.
pub(crate) fn list_slots(slots: &[Slot]) -> Vec<String> {
    let mut lines: Vec<(String, Vec<&str>)> = Vec::new();
    for slot in slots {
        let time = slot.start.format("%H:%M").to_string();
        match lines.iter_mut().find(|(t, _)| *t == time) {
            Some((_, names)) => names.push(&slot.staff_name),
            None => lines.push((time, vec![&slot.staff_name])),
        }
    }
    lines
        .into_iter()
        .take(MAX_LISTED_SLOTS)
        .map(|(time, names)| format!("{time} ({})", names.join(", ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{ctx, stack};
    use crate::params::validate;

    async fn run(params: &[&str]) -> Resolution {
        let (backend, catalog) = stack();
        let handler = SearchSlotsHandler::new(backend, catalog);
        let raw: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let args = validate(&handler.spec(), &raw, &ctx()).expect("valid");
        handler.resolve(&args, &ctx()).await.expect("resolve")
    }

    #[tokio::test]
    async fn any_staff_lists_times_with_names() {
        let (backend, catalog) = stack();
        let handler = SearchSlotsHandler::new(backend, catalog);
        let raw = vec!["haircut".to_string(), "0".to_string(), "2030-03-14".to_string()];
        let args = validate(&handler.spec(), &raw, &ctx()).expect("valid");
        let Resolution::Ready(resolved) = handler.resolve(&args, &ctx()).await.expect("resolve")
        else {
            panic!("expected ready");
        };
        assert!(resolved.staff.is_none());
        let CommandOutcome::Done { display, payload, .. } =
            handler.execute(&resolved, &ctx()).await.expect("execute")
        else {
            panic!("expected done");
        };
        assert!(display.starts_with("Free times for Women's haircut on 2030-03-14:"));
        assert!(display.contains("10:00 (Anna, Maria)"));
        assert_eq!(payload["slots"].as_array().map(Vec::len), Some(20));
    }

    #[tokio::test]
    async fn unknown_service_asks_which_one() {
        let Resolution::Clarify(clarification) = run(&["tattoo", "0", "2030-03-14"]).await else {
            panic!("expected clarification");
        };
        assert!(clarification.question.contains("tattoo"));
        assert_eq!(clarification.options.len(), 3);
    }

    #[tokio::test]
    async fn staff_who_does_not_perform_the_service_is_rejected() {
        let Resolution::Clarify(clarification) = run(&["manicure", "Anna", "2030-03-14"]).await
        else {
            panic!("expected clarification");
        };
        assert_eq!(clarification.options, vec!["Olga".to_string()]);
    }

    #[tokio::test]
    async fn past_dates_are_questioned() {
        assert!(matches!(
            run(&["haircut", "0", "2030-03-01"]).await,
            Resolution::Clarify(_)
        ));
    }
}
