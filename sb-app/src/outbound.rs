use sb_channels::{ChannelAdapter, TenantId};
use std::collections::HashMap;
use std::sync::Arc;

/// Adapters used to deliver replies. A tenant-specific adapter (one
/// WhatsApp number per salon) wins over a shared one for the same channel.
#[derive(Default)]
pub struct ChannelRegistry {
    shared: HashMap<String, Arc<dyn ChannelAdapter>>,
    per_tenant: HashMap<(String, TenantId), Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.shared.insert(adapter.channel_id().to_string(), adapter);
    }

    pub fn register_for_tenant(&mut self, tenant: TenantId, adapter: Arc<dyn ChannelAdapter>) {
        self.per_tenant
            .insert((adapter.channel_id().to_string(), tenant), adapter);
    }

    pub fn get(&self, channel: &str, tenant: &TenantId) -> Option<Arc<dyn ChannelAdapter>> {
        self.per_tenant
            .get(&(channel.to_string(), tenant.clone()))
            .or_else(|| self.shared.get(channel))
            .cloned()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .keys()
            .cloned()
            .chain(self.per_tenant.keys().map(|(channel, _)| channel.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ChannelAdapter>> {
        self.shared.values().chain(self.per_tenant.values())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use anyhow::Result;
    use async_trait::async_trait;
    use sb_channels::{ChannelAdapter, OutboundMessage};
    use std::sync::Mutex;

    /// Captures every delivered message.
    pub struct RecordingChannel {
        id: String,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChannel {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn channel_id(&self) -> &str {
            &self.id
        }

        async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((recipient_id.to_string(), message.content));
            Ok(())
        }
    }
}
