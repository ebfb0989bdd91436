use crate::error::ErrorKind;
use crate::model::Booking;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of commands the assistant may embed in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandName {
    SearchSlots,
    CreateBooking,
    CancelBooking,
    RescheduleBooking,
    CheckBooking,
    ShowPrices,
    ShowServices,
    ShowStaff,
    ShowPortfolio,
}

impl CommandName {
    pub const ALL: [CommandName; 9] = [
        CommandName::SearchSlots,
        CommandName::CreateBooking,
        CommandName::CancelBooking,
        CommandName::RescheduleBooking,
        CommandName::CheckBooking,
        CommandName::ShowPrices,
        CommandName::ShowServices,
        CommandName::ShowStaff,
        CommandName::ShowPortfolio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchSlots => "SEARCH_SLOTS",
            Self::CreateBooking => "CREATE_BOOKING",
            Self::CancelBooking => "CANCEL_BOOKING",
            Self::RescheduleBooking => "RESCHEDULE_BOOKING",
            Self::CheckBooking => "CHECK_BOOKING",
            Self::ShowPrices => "SHOW_PRICES",
            Self::ShowServices => "SHOW_SERVICES",
            Self::ShowStaff => "SHOW_STAFF",
            Self::ShowPortfolio => "SHOW_PORTFOLIO",
        }
    }

    /// Exact, case-sensitive match against the vocabulary.
    pub fn from_token(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Whether a successful run changes booking state.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::CreateBooking | Self::CancelBooking | Self::RescheduleBooking
        )
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command extracted from a reply, with its raw positional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    pub params: Vec<String>,
    /// The token as it appeared in the reply. Commands built in code carry
    /// the canonical `[NAME:a,b]` form.
    pub raw: String,
}

impl Command {
    pub fn new(name: CommandName, params: Vec<String>) -> Self {
        let raw = if params.is_empty() {
            format!("[{name}]")
        } else {
            format!("[{name}:{}]", params.join(","))
        };
        Self { name, params, raw }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    NeedsClarification,
    Failed,
}

/// A question the customer must answer before the command can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Clarification {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn render(&self) -> String {
        if self.options.is_empty() {
            return self.question.clone();
        }
        let mut out = self.question.clone();
        for option in &self.options {
            out.push_str("\n• ");
            out.push_str(option);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: Command,
    pub status: CommandStatus,
    /// Customer-facing text produced by the command.
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub clarification: Option<Clarification>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error: Option<CommandError>,
    #[serde(default)]
    pub booking: Option<Booking>,
    pub attempts: u32,
    pub latency_ms: u64,
    /// True when an existing booking was returned instead of creating one.
    #[serde(default)]
    pub replayed: bool,
}

impl CommandResult {
    pub(crate) fn failed(command: Command, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            command,
            status: CommandStatus::Failed,
            display: None,
            clarification: None,
            payload: serde_json::Value::Null,
            error: Some(CommandError {
                kind,
                detail: detail.into(),
            }),
            booking: None,
            attempts: 0,
            latency_ms: 0,
            replayed: false,
        }
    }

    pub(crate) fn clarify(command: Command, clarification: Clarification) -> Self {
        Self {
            command,
            status: CommandStatus::NeedsClarification,
            display: None,
            clarification: Some(clarification),
            payload: serde_json::Value::Null,
            error: None,
            booking: None,
            attempts: 0,
            latency_ms: 0,
            replayed: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_exact_and_case_sensitive() {
        for name in CommandName::ALL {
            assert_eq!(CommandName::from_token(name.as_str()), Some(name));
        }
        assert_eq!(CommandName::from_token("search_slots"), None);
        assert_eq!(CommandName::from_token("DELETE_EVERYTHING"), None);
    }

    #[test]
    fn command_name_serializes_as_token() {
        let json = serde_json::to_value(CommandName::CreateBooking).expect("serialize");
        assert_eq!(json, "CREATE_BOOKING");
    }

    #[test]
    fn clarification_lists_options() {
        let clarification = Clarification::new("Which stylist?")
            .with_options(vec!["Anna".to_string(), "Maria".to_string()]);
        assert_eq!(clarification.render(), "Which stylist?\n• Anna\n• Maria");
    }
}
