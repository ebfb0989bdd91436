use crate::config::TenantConfig;
use chrono::FixedOffset;
use sb_channels::{ConversationKey, NumberingPlan, TenantId};
use std::collections::HashMap;
use std::sync::Arc;

/// Runtime view of one business.
#[derive(Debug, Clone)]
pub struct TenantProfile {
    pub id: TenantId,
    pub name: String,
    pub description: String,
    pub utc_offset: FixedOffset,
    pub numbering: NumberingPlan,
    pub fallback_text: String,
    pub apology_text: String,
    pub busy_text: String,
    pub failure_text: String,
}

impl TenantProfile {
    pub fn from_config(config: &TenantConfig) -> anyhow::Result<Self> {
        Ok(Self {
            id: TenantId::new(config.id.trim()),
            name: config.name.clone(),
            description: config.description.clone(),
            utc_offset: config.offset()?,
            numbering: config.numbering.clone(),
            fallback_text: config.fallback_text.clone(),
            apology_text: config.apology_text.clone(),
            busy_text: config.busy_text.clone(),
            failure_text: config.failure_text.clone(),
        })
    }

    pub fn conversation_key(&self, raw_sender: &str) -> Option<ConversationKey> {
        ConversationKey::normalize(&self.id, raw_sender, &self.numbering)
    }
}

/// Tenants by id, plus channel bindings that route platform accounts
/// (a WhatsApp phone number id) to a tenant.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: HashMap<TenantId, Arc<TenantProfile>>,
    bindings: HashMap<(String, String), TenantId>,
}

impl TenantRegistry {
    pub fn from_config(configs: &[TenantConfig]) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for config in configs {
            let profile = TenantProfile::from_config(config)?;
            if let Some(phone_number_id) = config.whatsapp_phone_number_id.as_deref() {
                registry.bind("whatsapp", phone_number_id.trim(), profile.id.clone());
            }
            registry.insert(profile);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, profile: TenantProfile) {
        self.tenants.insert(profile.id.clone(), Arc::new(profile));
    }

    pub fn bind(&mut self, channel: &str, account: &str, tenant: TenantId) {
        self.bindings
            .insert((channel.to_string(), account.to_string()), tenant);
    }

    pub fn get(&self, id: &TenantId) -> Option<Arc<TenantProfile>> {
        self.tenants.get(id).cloned()
    }

    pub fn resolve_binding(&self, channel: &str, account: &str) -> Option<Arc<TenantProfile>> {
        self.bindings
            .get(&(channel.to_string(), account.trim().to_string()))
            .and_then(|id| self.get(id))
    }

    /// Bindings for `channel` as (account, tenant) pairs.
    pub fn bindings_for<'a>(
        &'a self,
        channel: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a TenantId)> + 'a {
        self.bindings
            .iter()
            .filter(move |((c, _), _)| c == channel)
            .map(|((_, account), tenant)| (account.as_str(), tenant))
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn profile() -> TenantProfile {
        TenantProfile {
            id: TenantId::new("salon-1"),
            name: "Salon Aurora".to_string(),
            description: "Hair and nail studio in the city centre.".to_string(),
            utc_offset: FixedOffset::east_opt(3 * 3600).expect("offset"),
            numbering: NumberingPlan::default(),
            fallback_text: "Sorry, could you rephrase?".to_string(),
            apology_text: "Sorry, something went wrong. Please try again.".to_string(),
            busy_text: "Still working on your previous message.".to_string(),
            failure_text: "Part of your request failed.".to_string(),
        }
    }

    pub fn registry() -> TenantRegistry {
        let mut registry = TenantRegistry::default();
        registry.bind("whatsapp", "1098765", TenantId::new("salon-1"));
        registry.insert(profile());
        registry
    }
}
