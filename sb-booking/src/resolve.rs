//! Fuzzy-but-safe lookup of model-written names against the tenant catalog.
//!
//! A name resolves only when exactly one entry matches at the strongest
//! matching tier: id, then full name or alias, then substring. Anything
//! else is ambiguous or unknown and goes back to the customer as a question.

use crate::model::{Service, StaffMember};

#[derive(Debug, PartialEq, Eq)]
pub enum Match<'a, T> {
    Found(&'a T),
    Ambiguous(Vec<&'a T>),
    NotFound,
}

trait Named {
    fn id(&self) -> &str;
    fn names(&self) -> Vec<&str>;
}

impl Named for Service {
    fn id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

impl Named for StaffMember {
    fn id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }
}

pub fn match_service<'a>(services: &'a [Service], query: &str) -> Match<'a, Service> {
    match_named(services, query)
}

pub fn match_staff<'a>(staff: &'a [StaffMember], query: &str) -> Match<'a, StaffMember> {
    match_named(staff, query)
}

fn match_named<'a, T: Named>(items: &'a [T], query: &str) -> Match<'a, T> {
    let query = fold(query);
    if query.is_empty() {
        return Match::NotFound;
    }

    for tier in 0..3 {
        let hits: Vec<&T> = items
            .iter()
            .filter(|item| matches_at_tier(*item, &query, tier))
            .collect();
        match hits.len() {
            0 => continue,
            1 => return Match::Found(hits[0]),
            _ => return Match::Ambiguous(hits),
        }
    }
    Match::NotFound
}

fn matches_at_tier<T: Named>(item: &T, query: &str, tier: usize) -> bool {
    match tier {
        0 => fold(item.id()) == query,
        1 => item.names().iter().any(|name| fold(name) == query),
        _ => item.names().iter().any(|name| {
            let name = fold(name);
            name.contains(query) || query.contains(name.as_str())
        }),
    }
}

fn fold(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
