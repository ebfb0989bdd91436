use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Generation, Prompt, Role, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            url: format!("{}/messages", base_url.unwrap_or(ANTHROPIC_BASE_URL)),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: u32,
        temperature: Option<f32>,
    ) -> Result<Generation> {
        let req = AnthropicRequest::new(&self.model, prompt, max_tokens, temperature);

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        parsed.into_generation(&self.model)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

impl AnthropicRequest {
    fn new(model: &str, prompt: &Prompt, max_tokens: u32, temperature: Option<f32>) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            system: Some(prompt.system.clone()).filter(|s| !s.trim().is_empty()),
            messages: merge_consecutive_roles(&prompt.messages),
            temperature,
        }
    }
}

// The messages API rejects two consecutive turns with the same role.
fn merge_consecutive_roles(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        if let Some(last) = out.last_mut() {
            if last.role == role {
                last.content.push_str("\n\n");
                last.content.push_str(&m.content);
                continue;
            }
        }
        out.push(AnthropicMessage {
            role,
            content: m.content.clone(),
        });
    }
    out
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicResponse {
    fn into_generation(self, requested_model: &str) -> Result<Generation> {
        let mut text = String::new();
        for block in self.content {
            if let AnthropicContentBlock::Text { text: t } = block {
                text.push_str(&t);
            }
        }
        Ok(Generation {
            text,
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            usage: Usage {
                prompt_tokens: self.usage.input_tokens as u32,
                completion_tokens: self.usage.output_tokens as u32,
            },
            finish_reason: self.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_user_turns_are_merged() {
        let merged = merge_consecutive_roles(&[
            ChatMessage::user("Book me"),
            ChatMessage::user("for a haircut"),
            ChatMessage::assistant("Sure"),
            ChatMessage::user("tomorrow"),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].content, "Book me\n\nfor a haircut");
        assert_eq!(merged[1].role, "assistant");
    }

    #[test]
    fn system_prompt_is_top_level_field() {
        let prompt = Prompt {
            system: "front desk".to_string(),
            messages: vec![ChatMessage::user("hi")],
        };
        let body = serde_json::to_value(AnthropicRequest::new(
            "claude-3-5-haiku-latest",
            &prompt,
            512,
            None,
        ))
        .expect("serialize");
        assert_eq!(body["system"], "front desk");
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn text_blocks_are_concatenated_and_others_skipped() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "Here you go "},
                    {"type": "thinking", "thinking": "..."},
                    {"type": "text", "text": "[SHOW_PRICES]"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 40, "output_tokens": 9}
            }"#,
        )
        .expect("parse");
        let generation = parsed
            .into_generation("claude-3-5-haiku-latest")
            .expect("generation");
        assert_eq!(generation.text, "Here you go [SHOW_PRICES]");
        assert_eq!(generation.usage.completion_tokens, 9);
        assert_eq!(generation.model, "claude-3-5-haiku-latest");
    }
}
