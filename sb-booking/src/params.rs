//! Positional parameter schemas and their validation.
//!
//! The model writes parameters as free strings. Each handler declares the
//! shape it needs and the executor checks arity and kinds up front, so
//! handlers only ever see typed values.

use crate::command::CommandName;
use crate::model::ConversationContext;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Date,
    DateTime,
    /// A staff name or id; `0`, `any` or `*` mean whoever is free.
    StaffRef,
}

impl ParamKind {
    fn hint(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Date => "YYYY-MM-DD",
            Self::DateTime => "YYYY-MM-DDTHH:MM",
            Self::StaffRef => "staff name or 0",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub name: CommandName,
    pub summary: &'static str,
    pub params: Vec<ParamSpec>,
}

impl HandlerSpec {
    /// One grammar line for the system prompt, e.g.
    /// `[SEARCH_SLOTS:service,staff,date] find free times (date optional)`.
    pub fn usage(&self) -> String {
        let mut line = if self.params.is_empty() {
            format!("[{}]", self.name)
        } else {
            let names: Vec<&str> = self.params.iter().map(|p| p.name).collect();
            format!("[{}:{}]", self.name, names.join(","))
        };
        line.push_str(" - ");
        line.push_str(self.summary);
        let hints: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let optional = if p.required { "" } else { ", optional" };
                format!("{}: {}{}", p.name, p.kind.hint(), optional)
            })
            .collect();
        if !hints.is_empty() {
            line.push_str(" (");
            line.push_str(&hints.join("; "));
            line.push(')');
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaffRef {
    Any,
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Staff(StaffRef),
}

/// Parameters that passed validation, addressable by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedArgs {
    values: Vec<(&'static str, ArgValue)>,
}

impl ValidatedArgs {
    fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ArgValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        match self.get(name) {
            Some(ArgValue::Date(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn datetime(&self, name: &str) -> Option<DateTime<FixedOffset>> {
        match self.get(name) {
            Some(ArgValue::DateTime(value)) => Some(*value),
            _ => None,
        }
    }

    /// Absent staff parameters read as [`StaffRef::Any`].
    pub fn staff(&self, name: &str) -> StaffRef {
        match self.get(name) {
            Some(ArgValue::Staff(value)) => value.clone(),
            _ => StaffRef::Any,
        }
    }
}

/// Check raw positional params against a handler spec. The error string is a
/// customer-facing question.
pub fn validate(
    spec: &HandlerSpec,
    raw: &[String],
    ctx: &ConversationContext,
) -> Result<ValidatedArgs, String> {
    let mut values = Vec::new();
    let mut cursor = 0;
    for param in &spec.params {
        let value = raw.get(cursor).map(|v| v.trim()).unwrap_or_default();
        cursor += 1;
        if value.is_empty() {
            if param.required {
                return Err(missing_question(param));
            }
            continue;
        }
        let parsed = match param.kind {
            ParamKind::Text => Some(ArgValue::Text(value.to_string())),
            ParamKind::Date => parse_date(value, ctx).map(ArgValue::Date),
            ParamKind::StaffRef => Some(ArgValue::Staff(parse_staff(value))),
            ParamKind::DateTime => {
                // `2024-07-20,15:00` arrives as two params when the model splits them.
                let joined = match (parse_date(value, ctx), raw.get(cursor).map(|v| v.trim())) {
                    (Some(_), Some(time)) if parse_time(time).is_some() => {
                        cursor += 1;
                        format!("{value} {time}")
                    }
                    _ => value.to_string(),
                };
                parse_datetime(&joined, ctx).map(ArgValue::DateTime)
            }
        };
        match parsed {
            Some(parsed) => values.push((param.name, parsed)),
            None if param.required => {
                return Err(format!(
                    "I couldn't understand the {} \"{}\". Could you give it as {}?",
                    param.name.replace('_', " "),
                    value,
                    param.kind.hint()
                ));
            }
            None => {}
        }
    }
    Ok(ValidatedArgs { values })
}

fn missing_question(param: &ParamSpec) -> String {
    match param.kind {
        ParamKind::Date => "Which date would suit you?".to_string(),
        ParamKind::DateTime => "What date and time would suit you?".to_string(),
        ParamKind::StaffRef => "Do you have a preferred specialist?".to_string(),
        ParamKind::Text => {
            format!("Could you tell me the {}?", param.name.replace('_', " "))
        }
    }
}

fn parse_staff(value: &str) -> StaffRef {
    match value.to_ascii_lowercase().as_str() {
        "0" | "*" | "any" | "anyone" => StaffRef::Any,
        _ => StaffRef::Named(value.to_string()),
    }
}

fn parse_date(value: &str, ctx: &ConversationContext) -> Option<NaiveDate> {
    match value.to_ascii_lowercase().as_str() {
        "today" => return Some(ctx.today()),
        "tomorrow" => return ctx.today().checked_add_days(Days::new(1)),
        _ => {}
    }
    ["%Y-%m-%d", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    ["%H:%M", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(value, fmt).ok())
}

fn parse_datetime(value: &str, ctx: &ConversationContext) -> Option<DateTime<FixedOffset>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(value) {
        return Some(with_offset);
    }
    let naive = [
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%d.%m.%Y %H:%M",
    ]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())?;
    ctx.utc_offset.from_local_datetime(&naive).single()
}
