//! Canonical conversation identity.
//!
//! Channels deliver the same customer in many shapes (`+7 912 345-67-89`,
//! `89123456789`, `79123456789@c.us`, `whatsapp:+79123456789`). Everything
//! downstream keys on [`ConversationKey`], so two raw identifiers that
//! normalize equal always land in the same conversation.

use crate::types::{SubscriberId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;

const CHANNEL_PREFIXES: &[&str] = &["whatsapp:", "wa:", "tel:", "sms:", "viber:"];
const PHONE_PUNCTUATION: &[char] = &[' ', '-', '(', ')', '.', '/', '+', '\u{a0}'];
const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

/// How bare national numbers are expanded to international form for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberingPlan {
    pub country_code: String,
    #[serde(default)]
    pub trunk_prefix: Option<String>,
    pub national_length: usize,
}

impl Default for NumberingPlan {
    fn default() -> Self {
        Self {
            country_code: "7".to_string(),
            trunk_prefix: Some("8".to_string()),
            national_length: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    tenant_id: TenantId,
    subscriber_id: SubscriberId,
}

impl ConversationKey {
    /// Build a key from an already canonical subscriber id.
    pub fn new(tenant_id: impl Into<TenantId>, subscriber_id: impl Into<SubscriberId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subscriber_id: subscriber_id.into(),
        }
    }

    /// Normalize a raw channel identifier into a key. Returns `None` when the
    /// raw identifier has no usable content.
    pub fn normalize(tenant_id: &TenantId, raw: &str, plan: &NumberingPlan) -> Option<Self> {
        let tenant = tenant_id.as_str().trim();
        if tenant.is_empty() {
            return None;
        }
        let subscriber = normalize_subscriber(raw, plan)?;
        Some(Self::new(tenant, subscriber))
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    /// Stable string form used as a storage key component.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.subscriber_id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.subscriber_id)
    }
}

pub fn normalize_subscriber(raw: &str, plan: &NumberingPlan) -> Option<String> {
    let mut value = raw.trim().to_ascii_lowercase();
    loop {
        let Some(prefix) = CHANNEL_PREFIXES.iter().find(|p| value.starts_with(*p)) else {
            break;
        };
        value = value[prefix.len()..].trim_start().to_string();
    }

    // `79123456789@c.us`, `79123456789@s.whatsapp.net`: keep the local part when it is a phone.
    if let Some((local, _domain)) = value.split_once('@') {
        if phone_digits(local).is_some() {
            value = local.to_string();
        }
    }

    if value.is_empty() {
        return None;
    }

    let Some(digits) = phone_digits(&value) else {
        return Some(value);
    };

    let explicit_international = value.trim_start().starts_with('+');
    if let Some(rest) = digits.strip_prefix("00") {
        if !explicit_international && rest.len() >= MIN_PHONE_DIGITS {
            return Some(rest.to_string());
        }
    }
    if explicit_international {
        return Some(digits);
    }

    if let Some(trunk) = plan.trunk_prefix.as_deref().filter(|t| !t.is_empty()) {
        if digits.len() == plan.national_length + trunk.len() && digits.starts_with(trunk) {
            return Some(format!("{}{}", plan.country_code, &digits[trunk.len()..]));
        }
    }
    if digits.len() == plan.national_length {
        return Some(format!("{}{}", plan.country_code, digits));
    }
    Some(digits)
}

fn phone_digits(value: &str) -> Option<String> {
    let stripped: String = value
        .chars()
        .filter(|c| !PHONE_PUNCTUATION.contains(c))
        .collect();
    if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&stripped.len()) {
        return None;
    }
    Some(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ConversationKey {
        ConversationKey::normalize(&TenantId::new("salon-1"), raw, &NumberingPlan::default())
            .expect("normalizable identifier")
    }

    #[test]
    fn heterogeneous_phone_formats_collapse_to_one_key() {
        let expected = ConversationKey::new("salon-1", "79123456789");
        for raw in [
            "+7 (912) 345-67-89",
            "79123456789",
            "89123456789",
            "9123456789",
            "0079123456789",
            "79123456789@c.us",
            "79123456789@s.whatsapp.net",
            "whatsapp:+79123456789",
            " WA:+7 912 345 67 89 ",
        ] {
            assert_eq!(key(raw), expected, "raw identifier {raw:?}");
        }
    }

    #[test]
    fn tenant_is_part_of_the_key() {
        let a = key("+79123456789");
        let b = ConversationKey::normalize(
            &TenantId::new("salon-2"),
            "+79123456789",
            &NumberingPlan::default(),
        )
        .expect("key");
        assert_ne!(a, b);
        assert_eq!(a.storage_key(), "salon-1:79123456789");
    }

    #[test]
    fn non_phone_identifiers_are_lowercased_and_kept() {
        assert_eq!(key("  Anna@Example.com ").subscriber_id().as_str(), "anna@example.com");
        assert_eq!(key("tg:123456").subscriber_id().as_str(), "tg:123456");
    }

    #[test]
    fn explicit_international_numbers_skip_the_numbering_plan() {
        let plan = NumberingPlan {
            country_code: "44".to_string(),
            trunk_prefix: Some("0".to_string()),
            national_length: 10,
        };
        assert_eq!(
            normalize_subscriber("+1 415 555 0100", &plan).as_deref(),
            Some("14155550100")
        );
        assert_eq!(
            normalize_subscriber("07700 900123", &plan).as_deref(),
            Some("447700900123")
        );
    }

    #[test]
    fn empty_identifiers_do_not_normalize() {
        assert!(normalize_subscriber("   ", &NumberingPlan::default()).is_none());
        assert!(normalize_subscriber("whatsapp:", &NumberingPlan::default()).is_none());
        assert!(
            ConversationKey::normalize(&TenantId::new(" "), "79123456789", &NumberingPlan::default())
                .is_none()
        );
    }
}
