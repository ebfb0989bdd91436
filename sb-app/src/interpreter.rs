//! Extraction of bracketed command tokens from model output.

use regex::Regex;
use sb_booking::{Command, CommandName};
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Z][A-Z0-9_]*)(?::([^\[\]\n]*))?\]").expect("token pattern compiles")
});

static SPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("space pattern compiles"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    /// Reply text with every token-shaped directive removed.
    pub clean_text: String,
    /// Recognized commands in left-to-right order.
    pub commands: Vec<Command>,
    /// Token-shaped directives outside the vocabulary, as written.
    pub unknown: Vec<String>,
}

fn split_params(raw: Option<&str>) -> Vec<String> {
    match raw.map(str::trim) {
        None | Some("") => Vec::new(),
        Some(list) => list.split(',').map(|p| p.trim().to_string()).collect(),
    }
}

/// Remove tokens until none are left. Clean text must never re-parse into a
/// command.
fn strip_tokens(line: &str) -> String {
    let mut text = line.to_string();
    while TOKEN.is_match(&text) {
        text = TOKEN.replace_all(&text, " ").into_owned();
    }
    SPACE_RUN.replace_all(&text, " ").trim().to_string()
}

pub fn parse(output: &str) -> ParsedReply {
    let mut parsed = ParsedReply::default();
    let mut lines = Vec::new();

    for line in output.lines() {
        let mut saw_token = false;
        for caps in TOKEN.captures_iter(line) {
            saw_token = true;
            let name = &caps[1];
            match CommandName::from_token(name) {
                Some(name) => parsed.commands.push(
                    Command::new(name, split_params(caps.get(2).map(|m| m.as_str())))
                        .with_raw(&caps[0]),
                ),
                None => parsed.unknown.push(caps[0].to_string()),
            }
        }
        if !saw_token {
            lines.push(line.to_string());
            continue;
        }
        let stripped = strip_tokens(line);
        if !stripped.is_empty() {
            lines.push(stripped);
        }
    }

    parsed.clean_text = lines.join("\n").trim().to_string();
    if !parsed.unknown.is_empty() {
        tracing::warn!(unknown = ?parsed.unknown, "dropped unknown command tokens");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_search_and_strips_its_line() {
        let parsed = parse("Sure!\n[SEARCH_SLOTS:haircut,0,2024-07-20]\nHere are times:");
        assert_eq!(parsed.clean_text, "Sure!\nHere are times:");
        assert_eq!(parsed.commands.len(), 1);
        assert_eq!(parsed.commands[0].name, CommandName::SearchSlots);
        assert_eq!(parsed.commands[0].params, vec!["haircut", "0", "2024-07-20"]);
    }

    #[test]
    fn keeps_token_order_and_inline_text() {
        let parsed = parse("Prices [SHOW_PRICES] and staff [SHOW_STAFF]  below.");
        let names: Vec<_> = parsed.commands.iter().map(|c| c.name).collect();
        assert_eq!(names, vec![CommandName::ShowPrices, CommandName::ShowStaff]);
        assert_eq!(parsed.clean_text, "Prices and staff below.");
        assert!(parsed.commands[0].params.is_empty());
    }

    #[test]
    fn unknown_tokens_are_dropped_not_executed() {
        let parsed = parse("Hello [SEND_GIFT:rose] there");
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.unknown, vec!["[SEND_GIFT:rose]".to_string()]);
        assert_eq!(parsed.clean_text, "Hello there");
    }

    #[test]
    fn conversational_brackets_survive() {
        let text = "See the list [1] and [see below], or [maybe:later].";
        let parsed = parse(text);
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.clean_text, text);
    }

    #[test]
    fn params_are_trimmed_and_positional() {
        let parsed = parse("[CREATE_BOOKING: haircut , Anna ,, 2030-03-14T15:00 ]");
        assert_eq!(
            parsed.commands[0].params,
            vec!["haircut", "Anna", "", "2030-03-14T15:00"]
        );
        let empty = parse("[SHOW_PRICES:]");
        assert!(empty.commands[0].params.is_empty());
    }

    #[test]
    fn raw_keeps_the_token_as_written() {
        let parsed = parse("Ok [CREATE_BOOKING: haircut , Anna ,, 2030-03-14T15:00 ] done");
        assert_eq!(
            parsed.commands[0].raw,
            "[CREATE_BOOKING: haircut , Anna ,, 2030-03-14T15:00 ]"
        );
        assert_eq!(
            Command::new(CommandName::ShowPrices, Vec::new()).raw,
            "[SHOW_PRICES]"
        );
    }

    #[test]
    fn parsing_clean_text_again_changes_nothing() {
        for output in [
            "Sure!\n[SEARCH_SLOTS:haircut,0,2024-07-20]\nHere are times:",
            "Booking [CREATE_BOOKING:haircut,0,2030-03-14T15:00] now [OOPS]",
            "[[SHOW_PRICES]SHOW_PRICES] nested",
            "  indented line\n\n[CHECK_BOOKING]\n",
        ] {
            let first = parse(output);
            let second = parse(&first.clean_text);
            assert!(second.commands.is_empty(), "{output:?} re-parsed into commands");
            assert!(second.unknown.is_empty());
            assert_eq!(second.clean_text, first.clean_text);
        }
    }

    #[test]
    fn duplicate_tokens_are_both_reported() {
        let parsed = parse(
            "[CREATE_BOOKING:haircut,Anna,2030-03-14T15:00]\n[CREATE_BOOKING:haircut,Anna,2030-03-14T15:00]",
        );
        assert_eq!(parsed.commands.len(), 2);
        assert_eq!(parsed.clean_text, "");
    }
}
