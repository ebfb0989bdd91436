use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Generation, Prompt, Role, Usage};
use serde::{Deserialize, Serialize};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            url: format!(
                "{}/chat/completions",
                base_url.unwrap_or(OPENAI_BASE_URL)
            ),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: u32,
        temperature: Option<f32>,
    ) -> Result<Generation> {
        let req = OpenAiChatRequest::new(&self.model, prompt, max_tokens, temperature);

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
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

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        parsed.into_generation(&self.model)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

impl OpenAiChatRequest {
    fn new(model: &str, prompt: &Prompt, max_tokens: u32, temperature: Option<f32>) -> Self {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        if !prompt.system.trim().is_empty() {
            messages.push(OpenAiMessage {
                role: "system",
                content: prompt.system.clone(),
            });
        }
        messages.extend(prompt.messages.iter().map(to_openai_message));
        Self {
            model: model.to_string(),
            messages,
            max_tokens,
            temperature,
        }
    }
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    OpenAiMessage {
        role,
        content: m.content.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiChatResponse {
    fn into_generation(self, requested_model: &str) -> Result<Generation> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai response missing choices".to_string())
        })?;
        let usage = self.usage.unwrap_or_default();
        Ok(Generation {
            text: choice.message.content.unwrap_or_default(),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
            finish_reason: choice
                .finish_reason
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
