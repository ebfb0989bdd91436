//! Prompt assembly for one turn.

use crate::context_store::{ExpectedReply, IntermediateContext, TurnStatus};
use crate::history::HistoryEntry;
use crate::tenants::TenantProfile;
use chrono::{DateTime, Utc};
use sb_booking::{Catalog, HandlerSpec};
use sb_llm::{ChatMessage, Prompt};

/// What the previous turn left behind that the model needs to interpret a
/// short reply.
#[derive(Debug, Clone, Default)]
pub struct DialogueHints {
    pub last_question: Option<String>,
    pub expected_reply: ExpectedReply,
    /// A reply that was drafted but never delivered because the turn's
    /// worker died.
    pub undelivered_draft: Option<String>,
}

impl DialogueHints {
    pub fn from_previous(previous: Option<&IntermediateContext>) -> Self {
        let Some(previous) = previous else {
            return Self::default();
        };
        Self {
            last_question: previous.last_question.clone(),
            expected_reply: previous.expected_reply,
            undelivered_draft: match previous.status {
                TurnStatus::Started => previous
                    .draft_reply
                    .clone()
                    .filter(|d| !d.trim().is_empty()),
                // A failed turn answered with an apology; its draft was discarded.
                TurnStatus::Completed | TurnStatus::Failed => None,
            },
        }
    }
}

pub struct PromptInput<'a> {
    pub tenant: &'a TenantProfile,
    pub catalog: &'a Catalog,
    pub specs: &'a [HandlerSpec],
    pub history: &'a [HistoryEntry],
    pub hints: &'a DialogueHints,
    pub client_name: Option<&'a str>,
    pub now: DateTime<Utc>,
    pub message: &'a str,
}

pub fn build_prompt(input: &PromptInput<'_>) -> Prompt {
    let mut messages: Vec<ChatMessage> = input.history.iter().map(HistoryEntry::to_chat).collect();
    messages.push(ChatMessage::user(input.message));
    Prompt {
        system: system_prompt(input),
        messages,
    }
}

fn system_prompt(input: &PromptInput<'_>) -> String {
    let tenant = input.tenant;
    let local = input.now.with_timezone(&tenant.utc_offset);
    let mut out = String::new();

    out.push_str(&format!(
        "You are the front-desk assistant of {}, chatting with a client.\n",
        tenant.name
    ));
    if !tenant.description.trim().is_empty() {
        out.push_str(&format!("{}\n", tenant.description.trim()));
    }
    out.push_str(&format!(
        "Current local time: {} (UTC{}).\n",
        local.format("%A %Y-%m-%d %H:%M"),
        tenant.utc_offset
    ));
    if let Some(name) = input.client_name {
        out.push_str(&format!("The client's name is {name}.\n"));
    }
    out.push_str(
        "\nReply in the client's language, briefly and warmly. \
         Never invent free times, prices or bookings: use a command and the system \
         appends its result to your reply.\n",
    );

    out.push_str("\nCommands. Write each on its own line exactly as shown; dates are YYYY-MM-DD, times HH:MM in local time, 0 means any specialist:\n");
    for spec in input.specs {
        out.push_str(&format!("{}\n", spec.usage()));
    }
    out.push_str(
        "Only use CREATE_BOOKING after the client has agreed to a specific time. \
         Search first when you don't know what is free.\n",
    );

    if input.catalog.services.is_empty() {
        out.push_str("\nThe service list is unavailable right now; do not quote prices.\n");
    } else {
        out.push_str("\nServices:\n");
        for service in &input.catalog.services {
            let price = service
                .price
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "price on request".to_string());
            out.push_str(&format!(
                "- {} (id {}): {}, {} min\n",
                service.name, service.id, price, service.duration_minutes
            ));
        }
    }
    if !input.catalog.staff.is_empty() {
        out.push_str("\nSpecialists:\n");
        for member in &input.catalog.staff {
            let performs: Vec<&str> = input
                .catalog
                .services
                .iter()
                .filter(|s| member.performs(&s.id))
                .map(|s| s.name.as_str())
                .collect();
            out.push_str(&format!("- {}", member.name));
            if let Some(role) = member.specialization.as_deref() {
                out.push_str(&format!(" ({role})"));
            }
            if !performs.is_empty() {
                out.push_str(&format!(": {}", performs.join(", ")));
            }
            out.push('\n');
        }
    }

    let hints = input.hints;
    if let Some(question) = hints.last_question.as_deref() {
        out.push_str(&format!(
            "\nYour last question to the client was: \"{question}\" (expecting {}). \
             A short answer such as \"yes\" or a bare time answers that question.\n",
            hints.expected_reply.describe()
        ));
    }
    if let Some(draft) = hints.undelivered_draft.as_deref() {
        out.push_str(&format!(
            "\nYou had started this reply but it was never delivered; \
             take it into account and do not repeat finished actions:\n\"{draft}\"\n"
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::fixtures::profile;
    use chrono::TimeZone;
    use sb_booking::{CommandName, ParamKind, ParamSpec, PriceRange, Service, StaffMember};
    use sb_llm::Role;

    fn catalog() -> Catalog {
        Catalog {
            services: vec![Service {
                id: "haircut".to_string(),
                name: "Women's haircut".to_string(),
                category: None,
                price: Some(PriceRange {
                    min: 1500,
                    max: Some(2500),
                }),
                duration_minutes: 60,
                aliases: vec![],
            }],
            staff: vec![StaffMember {
                id: "anna".to_string(),
                name: "Anna".to_string(),
                specialization: Some("Stylist".to_string()),
                service_ids: vec![],
            }],
        }
    }

    #[test]
    fn includes_catalog_grammar_time_and_hints() {
        let tenant = profile();
        let catalog = catalog();
        let specs = vec![HandlerSpec {
            name: CommandName::SearchSlots,
            summary: "find free appointment times",
            params: vec![ParamSpec::required("service", ParamKind::Text)],
        }];
        let now = Utc.with_ymd_and_hms(2030, 3, 13, 9, 0, 0).single().expect("now");
        let history = vec![
            HistoryEntry::user("Hi", now),
            HistoryEntry::assistant("Hello! Shall I book Anna at 15:00?", now),
        ];
        let hints = DialogueHints {
            last_question: Some("Shall I book Anna at 15:00?".to_string()),
            expected_reply: ExpectedReply::Confirmation,
            undelivered_draft: None,
        };
        let prompt = build_prompt(&PromptInput {
            tenant: &tenant,
            catalog: &catalog,
            specs: &specs,
            history: &history,
            hints: &hints,
            client_name: None,
            now,
            message: "yes",
        });

        assert!(prompt.system.contains("Salon Aurora"));
        assert!(prompt.system.contains("Wednesday 2030-03-13 12:00"));
        assert!(prompt.system.contains("[SEARCH_SLOTS:service]"));
        assert!(prompt.system.contains("- Women's haircut (id haircut): 1500–2500, 60 min"));
        assert!(prompt.system.contains("- Anna (Stylist): Women's haircut"));
        assert!(prompt.system.contains("\"Shall I book Anna at 15:00?\" (expecting a yes/no confirmation)"));
        assert_eq!(prompt.messages.len(), 3);
        assert_eq!(prompt.messages[2], ChatMessage::user("yes"));
        assert_eq!(prompt.messages[1].role, Role::Assistant);
        assert!(prompt.validate().is_ok());
    }

    #[test]
    fn client_name_and_undelivered_draft_are_stated() {
        let tenant = profile();
        let catalog = Catalog::default();
        let hints = DialogueHints {
            undelivered_draft: Some("Let me check the times".to_string()),
            ..DialogueHints::default()
        };
        let prompt = build_prompt(&PromptInput {
            tenant: &tenant,
            catalog: &catalog,
            specs: &[],
            history: &[],
            hints: &hints,
            client_name: Some("Kate"),
            now: Utc.with_ymd_and_hms(2030, 3, 13, 9, 0, 0).single().expect("now"),
            message: "hello?",
        });

        assert!(prompt.system.contains("The client's name is Kate.\n"));
        assert!(prompt.system.contains("do not quote prices"));
        assert!(prompt.system.ends_with(
            "do not repeat finished actions:\n\"Let me check the times\"\n"
        ));
        assert!(!prompt.system.contains("Your last question"));
    }

    #[test]
    fn only_abandoned_turns_contribute_a_draft() {
        let now = Utc::now();
        let mut previous = IntermediateContext {
            status: TurnStatus::Started,
            turn_id: uuid::Uuid::new_v4(),
            worker_id: "w1".to_string(),
            message: "book me".to_string(),
            started_at: now,
            updated_at: now,
            finished_at: Some(now),
            history_snapshot: vec![],
            last_question: None,
            expected_reply: ExpectedReply::FreeText,
            mentions: Default::default(),
            draft_reply: Some("Let me check the times".to_string()),
            pending_commands: vec![],
            outcome: None,
            recent_bookings: vec![],
        };
        assert_eq!(
            DialogueHints::from_previous(Some(&previous))
                .undelivered_draft
                .as_deref(),
            Some("Let me check the times")
        );
        previous.status = TurnStatus::Completed;
        assert!(DialogueHints::from_previous(Some(&previous)).undelivered_draft.is_none());
        previous.status = TurnStatus::Failed;
        assert!(DialogueHints::from_previous(Some(&previous)).undelivered_draft.is_none());
    }
}
