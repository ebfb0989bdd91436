use crate::traits::ChannelAdapter;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};
use reqwest::Url;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const MAX_TEXT_CHARS: usize = 4096;

/// WhatsApp Cloud API sender. Inbound events arrive through the webhook
/// route wired in the app crate.
#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let trimmed = api_base.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base = trimmed.to_string();
        }
        self
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!("{}/{}/messages", self.api_base, self.phone_number_id))
            .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    #[tracing::instrument(level = "info", skip_all, fields(recipient = %recipient_id))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (E.164 phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.messages_url()?;
        for chunk in split_message(text, MAX_TEXT_CHARS) {
            let mut payload = serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": chunk,
                }
            });
            if let Some(reply_to) = message.reply_to_message_id.as_ref() {
                payload["context"] = serde_json::json!({ "message_id": reply_to.as_str() });
            }

            let response = self
                .http
                .post(url.clone())
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(anyhow!(
                    "whatsapp send failed: status={} body={}",
                    status,
                    body
                ));
            }
        }

        Ok(())
    }
}

/// Split on paragraph or line boundaries so long replies stay readable.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_chars && !current.is_empty() {
            chunks.push(current.trim_end().to_string());
            current.clear();
        }
        if line.chars().count() > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect::<String>().trim_end().to_string());
            }
            continue;
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_requires_credentials() {
        assert!(WhatsAppCloudAdapter::new("", "123").is_err());
        assert!(WhatsAppCloudAdapter::new("token", " ").is_err());
        let adapter = WhatsAppCloudAdapter::new("token", "123")
            .expect("adapter")
            .with_api_base("http://localhost:9999/");
        assert_eq!(
            adapter.messages_url().expect("url").as_str(),
            "http://localhost:9999/123/messages"
        );
    }

    #[test]
    fn long_messages_split_on_line_boundaries() {
        let text = "first line\nsecond line\nthird line";
        let chunks = split_message(text, 24);
        assert_eq!(chunks, vec!["first line\nsecond line", "third line"]);
        assert_eq!(split_message("short", 24), vec!["short"]);
    }
}
