use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{Generation, Prompt};
use async_trait::async_trait;
use std::time::{Duration, Instant};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model(&self) -> &str;

    /// Produce the assistant's next message for `prompt`.
    async fn generate(&self, prompt: &Prompt) -> Result<Generation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    pub fn new(api_key: &str, model: &str, request_timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "api key is required for model {model}"
            )));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            provider: detect_provider(model),
            api_key: api_key.trim().to_string(),
            model: model.trim().to_string(),
            max_tokens: 1024,
            temperature: None,
            base_url: None,
            client,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Point the client at an API-compatible gateway instead of the vendor default.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn generate(&self, prompt: &Prompt) -> Result<Generation> {
        prompt.validate()?;
        let started = Instant::now();
        let generation = match self.provider {
            Provider::OpenAI => {
                OpenAiClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                )
                .generate(prompt, self.max_tokens, self.temperature)
                .await?
            }
            Provider::Anthropic => {
                AnthropicClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                )
                .generate(prompt, self.max_tokens, self.temperature)
                .await?
            }
        };
        tracing::debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = generation.usage.prompt_tokens,
            completion_tokens = generation.usage.completion_tokens,
            finish_reason = %generation.finish_reason,
            "model generation completed"
        );
        Ok(generation)
    }
}

pub fn detect_provider(model: &str) -> Provider {
    let m = model.trim().to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_detected_from_model_name() {
        assert_eq!(detect_provider("claude-3-5-haiku-latest"), Provider::Anthropic);
        assert_eq!(detect_provider(" Claude-sonnet "), Provider::Anthropic);
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
    }

    #[test]
    fn client_requires_api_key() {
        let err = LlmClient::new("  ", "gpt-4o-mini", Duration::from_secs(5))
            .err()
            .expect("empty key should be rejected");
        assert!(err.to_string().contains("api key is required"));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = LlmClient::new("k", "gpt-4o-mini", Duration::from_secs(5))
            .expect("client")
            .with_base_url(Some("https://gateway.local/v1/ ".to_string()));
        assert_eq!(client.base_url.as_deref(), Some("https://gateway.local/v1"));
    }
}
