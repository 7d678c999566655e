use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tradepal_types::ProviderId;

mod catalog;

pub use catalog::{
    all_selectable_models, available_providers, config_of, cost_tier_of, provider_info,
    selectable_models, ProviderCatalogEntry,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Base URLs for each provider API. Overridable so tests and proxies can
/// point a provider elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub openai: String,
    pub anthropic: String,
    pub google: String,
    pub openrouter: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: "https://api.openai.com/v1".to_string(),
            anthropic: "https://api.anthropic.com".to_string(),
            google: "https://generativelanguage.googleapis.com".to_string(),
            openrouter: "https://openrouter.ai/api/v1".to_string(),
        }
    }
}

impl ProviderEndpoints {
    pub fn base_url(&self, provider: ProviderId) -> &str {
        match provider {
            ProviderId::OpenAi => &self.openai,
            ProviderId::Anthropic => &self.anthropic,
            ProviderId::Google => &self.google,
            ProviderId::OpenRouter => &self.openrouter,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

/// Outcome of one generation call. `text` may be empty; deciding what an
/// empty generation means is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub finish_reason: Option<String>,
    pub tool_calls: usize,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<Generation>;
}

/// One client per provider family. OpenRouter speaks the OpenAI wire format
/// against its own base URL.
pub enum ProviderClient {
    OpenAi(OpenAICompatibleClient),
    Anthropic(AnthropicClient),
    Google(GoogleClient),
    OpenRouter(OpenAICompatibleClient),
}

impl ProviderClient {
    pub fn build(
        http: Client,
        provider: ProviderId,
        model: &str,
        api_key: &str,
        endpoints: &ProviderEndpoints,
        options: GenerationOptions,
    ) -> Self {
        let base_url = normalize_plain_base(endpoints.base_url(provider));
        match provider {
            ProviderId::OpenAi => ProviderClient::OpenAi(OpenAICompatibleClient {
                id: provider,
                base_url,
                api_key: api_key.to_string(),
                model: model.to_string(),
                options,
                client: http,
            }),
            ProviderId::OpenRouter => ProviderClient::OpenRouter(OpenAICompatibleClient {
                id: provider,
                base_url,
                api_key: api_key.to_string(),
                model: model.to_string(),
                options,
                client: http,
            }),
            ProviderId::Anthropic => ProviderClient::Anthropic(AnthropicClient {
                base_url,
                api_key: api_key.to_string(),
                model: model.to_string(),
                options,
                client: http,
            }),
            ProviderId::Google => ProviderClient::Google(GoogleClient {
                base_url,
                api_key: api_key.to_string(),
                model: model.to_string(),
                options,
                client: http,
            }),
        }
    }

    fn provider(&self) -> ProviderId {
        match self {
            ProviderClient::OpenAi(_) => ProviderId::OpenAi,
            ProviderClient::Anthropic(_) => ProviderId::Anthropic,
            ProviderClient::Google(_) => ProviderId::Google,
            ProviderClient::OpenRouter(_) => ProviderId::OpenRouter,
        }
    }
}

#[async_trait]
impl TextGenerator for ProviderClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<Generation> {
        let result = match self {
            ProviderClient::OpenAi(client) | ProviderClient::OpenRouter(client) => {
                client.generate(system_prompt, user_prompt).await
            }
            ProviderClient::Anthropic(client) => client.generate(system_prompt, user_prompt).await,
            ProviderClient::Google(client) => client.generate(system_prompt, user_prompt).await,
        };
        match &result {
            Ok(generation) => tracing::debug!(
                provider = self.provider().as_str(),
                finish_reason = generation.finish_reason.as_deref().unwrap_or(""),
                chars = generation.text.len(),
                "provider response received"
            ),
            Err(err) => tracing::warn!(
                provider = self.provider().as_str(),
                error = %err,
                "provider request failed"
            ),
        }
        result
    }
}

pub struct OpenAICompatibleClient {
    id: ProviderId,
    base_url: String,
    api_key: String,
    model: String,
    options: GenerationOptions,
    client: Client,
}

#[async_trait]
impl TextGenerator for OpenAICompatibleClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<Generation> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).bearer_auth(&self.api_key).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": self.options.max_tokens,
            "temperature": self.options.temperature,
            "stream": false,
        }));
        if self.id == ProviderId::OpenRouter {
            req = req
                .header("HTTP-Referer", "https://tradepal.ai")
                .header("X-Title", "TradePal AI");
        }

        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();

        if !status.is_success() {
            let detail = extract_error_message(&value)
                .unwrap_or_else(|| truncate_for_error(&body, 500));
            anyhow::bail!("{}: {}", status, detail);
        }
        if let Some(detail) = extract_error_message(&value) {
            anyhow::bail!(detail);
        }

        let choice = value.get("choices").and_then(|v| v.get(0));
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let tool_calls = choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
            .map(|calls| calls.len())
            .unwrap_or(0);

        Ok(Generation {
            text: extract_openai_text(&value).unwrap_or_default(),
            finish_reason,
            tool_calls,
        })
    }
}

pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    options: GenerationOptions,
    client: Client,
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<Generation> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": self.options.max_tokens,
                "temperature": self.options.temperature,
                "system": system_prompt,
                "messages": [{"role": "user", "content": user_prompt}],
            }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();

        if !status.is_success() {
            let detail = extract_error_message(&value)
                .unwrap_or_else(|| truncate_for_error(&body, 500));
            anyhow::bail!("{}: {}", status, detail);
        }

        let mut text = String::new();
        let mut tool_calls = 0;
        for block in value
            .get("content")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            match block.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                "text" => {
                    if let Some(fragment) = block.get("text").and_then(|v| v.as_str()) {
                        text.push_str(fragment);
                    }
                }
                "tool_use" => tool_calls += 1,
                _ => {}
            }
        }

        Ok(Generation {
            text,
            finish_reason: value
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            tool_calls,
        })
    }
}

pub struct GoogleClient {
    base_url: String,
    api_key: String,
    model: String,
    options: GenerationOptions,
    client: Client,
}

#[async_trait]
impl TextGenerator for GoogleClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<Generation> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({
                "systemInstruction": {"parts": [{"text": system_prompt}]},
                "contents": [{"role": "user", "parts": [{"text": user_prompt}]}],
                "generationConfig": {
                    "maxOutputTokens": self.options.max_tokens,
                    "temperature": self.options.temperature,
                },
            }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();

        if !status.is_success() {
            let detail = extract_error_message(&value)
                .unwrap_or_else(|| truncate_for_error(&body, 500));
            anyhow::bail!("{}: {}", status, detail);
        }

        let candidate = value.get("candidates").and_then(|v| v.get(0));
        let mut text = String::new();
        let mut tool_calls = 0;
        for part in candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(fragment) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(fragment);
            }
            if part.get("functionCall").is_some() {
                tool_calls += 1;
            }
        }

        let finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|v| v.as_str())
            .or_else(|| {
                value
                    .get("promptFeedback")
                    .and_then(|f| f.get("blockReason"))
                    .and_then(|v| v.as_str())
            })
            .map(str::to_string);

        Ok(Generation {
            text,
            finish_reason,
            tool_calls,
        })
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim().trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn collect_text_fragments(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_fragments(message, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    let choice = value.get("choices").and_then(|v| v.get(0))?;
    let mut out = String::new();
    collect_text_fragments(choice, &mut out);
    if out.trim().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn extract_error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| error.as_str())
        .map(|s| s.to_string())
}
