//! Turning a model draft plus command results into the customer's reply,
//! and reading back what that reply asks of the customer.

use crate::context_store::{ExpectedReply, Mentions};
use crate::tenants::TenantProfile;
use sb_booking::{Catalog, Command, CommandName, CommandResult, CommandStatus};
use std::collections::HashSet;

pub fn assemble_reply(clean_text: &str, results: &[CommandResult], tenant: &TenantProfile) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !clean_text.trim().is_empty() {
        parts.push(clean_text.trim().to_string());
    }

    let mut shown_bookings = HashSet::new();
    let mut failure_noted = false;
    for result in results {
        match result.status {
            CommandStatus::Succeeded => {
                if let Some(booking) = result.booking.as_ref() {
                    // A replay of a booking already shown in this reply adds nothing.
                    if !shown_bookings.insert(booking.id.clone()) && result.replayed {
                        continue;
                    }
                }
                if let Some(display) = result.display.as_deref().filter(|d| !d.trim().is_empty()) {
                    parts.push(display.to_string());
                }
            }
            CommandStatus::NeedsClarification => {
                if let Some(clarification) = result.clarification.as_ref() {
                    let question = clarification.render();
                    if !parts.contains(&question) {
                        parts.push(question);
                    }
                }
            }
            CommandStatus::Failed => {
                if !failure_noted {
                    failure_noted = true;
                    parts.push(tenant.failure_text.clone());
                }
            }
        }
    }

    if parts.is_empty() {
        tenant.fallback_text.clone()
    } else {
        parts.join("\n\n")
    }
}

/// The last `?`-terminated sentence of the reply, if any.
pub fn last_question(reply: &str) -> Option<String> {
    let end = reply.rfind('?')?;
    let start = reply[..end]
        .rfind(['.', '!', '?', '\n'])
        .map(|i| i + 1)
        .unwrap_or(0);
    let question = reply[start..=end].trim();
    (question.len() > 1).then(|| question.to_string())
}

const CONFIRMATION_OPENERS: &[&str] = &[
    "shall ", "should ", "do you ", "would you ", "is that ", "is it ", "are you ", "can i ",
    "may i ", "ok?", "okay?",
];

fn is_yes_no(question: &str) -> bool {
    let lower = question.to_lowercase();
    lower.contains("confirm") || CONFIRMATION_OPENERS.iter().any(|o| lower.starts_with(o))
}

fn offers_times(result: &CommandResult) -> bool {
    match result.status {
        CommandStatus::Succeeded => {
            result.command.name == CommandName::SearchSlots
                && result.payload["slots"]
                    .as_array()
                    .is_some_and(|slots| !slots.is_empty())
        }
        CommandStatus::NeedsClarification => {
            matches!(
                result.command.name,
                CommandName::SearchSlots | CommandName::CreateBooking | CommandName::RescheduleBooking
            ) && result.clarification.as_ref().is_some_and(|c| {
                !c.options.is_empty()
                    && c.options
                        .iter()
                        .all(|o| o.chars().next().is_some_and(|ch| ch.is_ascii_digit()))
            })
        }
        CommandStatus::Failed => false,
    }
}

pub fn classify_reply(reply: &str, results: &[CommandResult]) -> (Option<String>, ExpectedReply) {
    let question = last_question(reply);
    let expected = if results.iter().any(offers_times) {
        ExpectedReply::TimeSelection
    } else if question.as_deref().is_some_and(is_yes_no) {
        ExpectedReply::Confirmation
    } else if results.iter().any(|r| {
        r.succeeded()
            && matches!(r.command.name, CommandName::ShowServices | CommandName::ShowPrices)
    }) {
        ExpectedReply::ServiceSelection
    } else if results.iter().any(|r| {
        r.succeeded()
            && matches!(r.command.name, CommandName::ShowStaff | CommandName::ShowPortfolio)
    }) {
        ExpectedReply::StaffSelection
    } else {
        ExpectedReply::FreeText
    };
    (question, expected)
}

/// Catalog names that appear in the customer's message or in command
/// parameters.
pub fn collect_mentions(catalog: &Catalog, message: &str, commands: &[Command]) -> Mentions {
    let mut haystack = message.to_lowercase();
    for command in commands {
        for param in &command.params {
            haystack.push(' ');
            haystack.push_str(&param.to_lowercase());
        }
    }

    let mut mentions = Mentions::default();
    for service in &catalog.services {
        let hit = std::iter::once(&service.name)
            .chain(service.aliases.iter())
            .chain(std::iter::once(&service.id))
            .any(|name| {
                let name = name.trim().to_lowercase();
                !name.is_empty() && haystack.contains(&name)
            });
        if hit {
            mentions.services.push(service.name.clone());
        }
    }
    for member in &catalog.staff {
        let name = member.name.trim().to_lowercase();
        if !name.is_empty() && haystack.contains(&name) {
            mentions.staff.push(member.name.clone());
        }
    }
    mentions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::fixtures::profile;
    use sb_booking::{Booking, BookingStatus, Clarification, CommandError, ErrorKind, Service, StaffMember};
    use serde_json::json;

    fn result(name: CommandName, status: CommandStatus) -> CommandResult {
        CommandResult {
            command: Command::new(name, vec![]),
            status,
            display: None,
            clarification: None,
            payload: serde_json::Value::Null,
            error: None,
            booking: None,
            attempts: 1,
            latency_ms: 3,
            replayed: false,
        }
    }

    fn booked(display: &str, replayed: bool) -> CommandResult {
        let start = chrono::DateTime::parse_from_rfc3339("2030-03-14T15:00:00+03:00").expect("start");
        CommandResult {
            display: Some(display.to_string()),
            booking: Some(Booking {
                id: "bk-1".to_string(),
                service_id: "haircut".to_string(),
                service_name: "Women's haircut".to_string(),
                staff_id: "anna".to_string(),
                staff_name: "Anna".to_string(),
                start,
                duration_minutes: 60,
                client_phone: "79123456789".to_string(),
                status: BookingStatus::Confirmed,
            }),
            replayed,
            ..result(CommandName::CreateBooking, CommandStatus::Succeeded)
        }
    }

    #[test]
    fn reply_joins_text_results_and_one_failure_note() {
        let tenant = profile();
        let mut failed = result(CommandName::ShowStaff, CommandStatus::Failed);
        failed.error = Some(CommandError {
            kind: ErrorKind::TransientIo,
            detail: "backend down".to_string(),
        });
        let mut clarify = result(CommandName::SearchSlots, CommandStatus::NeedsClarification);
        clarify.clarification = Some(
            Clarification::new("Which service?").with_options(vec!["Manicure".to_string()]),
        );
        let reply = assemble_reply(
            "Sure!",
            &[failed.clone(), clarify, failed],
            &tenant,
        );
        assert_eq!(
            reply,
            "Sure!\n\nPart of your request failed.\n\nWhich service?\n• Manicure"
        );
    }

    #[test]
    fn replayed_booking_is_shown_once() {
        let tenant = profile();
        let reply = assemble_reply(
            "",
            &[
                booked("Booked: Women's haircut with Anna.", false),
                booked("You're already booked: Women's haircut with Anna.", true),
            ],
            &tenant,
        );
        assert_eq!(reply, "Booked: Women's haircut with Anna.");

        let next_turn = assemble_reply(
            "",
            &[booked("You're already booked: Women's haircut with Anna.", true)],
            &tenant,
        );
        assert_eq!(next_turn, "You're already booked: Women's haircut with Anna.");
    }

    #[test]
    fn empty_reply_falls_back() {
        assert_eq!(assemble_reply("  ", &[], &profile()), "Sorry, could you rephrase?");
    }

    #[test]
    fn finds_the_last_question() {
        assert_eq!(
            last_question("Done. Anything else? Shall I book 15:00 with Anna?").as_deref(),
            Some("Shall I book 15:00 with Anna?")
        );
        assert_eq!(last_question("All set!"), None);
        assert_eq!(
            last_question("Free times:\n• 10:00\nWhich suits you?").as_deref(),
            Some("Which suits you?")
        );
    }

    #[test]
    fn classification_prefers_offered_times() {
        let mut search = result(CommandName::SearchSlots, CommandStatus::Succeeded);
        search.payload = json!({ "slots": [{ "staff_id": "anna" }] });
        let (question, expected) = classify_reply("Free times:\n• 10:00\nWhich suits you?", &[search]);
        assert_eq!(question.as_deref(), Some("Which suits you?"));
        assert_eq!(expected, ExpectedReply::TimeSelection);

        let (_, expected) = classify_reply("Shall I book Anna at 15:00?", &[]);
        assert_eq!(expected, ExpectedReply::Confirmation);

        let prices = result(CommandName::ShowPrices, CommandStatus::Succeeded);
        let (_, expected) = classify_reply("Prices: ... Which one interests you?", &[prices]);
        assert_eq!(expected, ExpectedReply::ServiceSelection);

        let (_, expected) = classify_reply("Hello!", &[]);
        assert_eq!(expected, ExpectedReply::FreeText);
    }

    #[test]
    fn mentions_come_from_message_and_params() {
        let catalog = Catalog {
            services: vec![Service {
                id: "haircut".to_string(),
                name: "Women's haircut".to_string(),
                category: None,
                price: None,
                duration_minutes: 60,
                aliases: vec!["cut".to_string()],
            }],
            staff: vec![
                StaffMember {
                    id: "anna".to_string(),
                    name: "Anna".to_string(),
                    specialization: None,
                    service_ids: vec![],
                },
                StaffMember {
                    id: "olga".to_string(),
                    name: "Olga".to_string(),
                    specialization: None,
                    service_ids: vec![],
                },
            ],
        };
        let commands = vec![Command::new(
            CommandName::SearchSlots,
            vec!["haircut".to_string(), "Anna".to_string()],
        )];
        let mentions = collect_mentions(&catalog, "a cut tomorrow please", &commands);
        assert_eq!(mentions.services, vec!["Women's haircut".to_string()]);
        assert_eq!(mentions.staff, vec!["Anna".to_string()]);
    }
}
