//! Chat-completion clients.
//!
//! [`OpenAiCompatibleClient`] talks to any `/chat/completions` endpoint (OpenAI itself, or a
//! local Ollama exposing its OpenAI-compatible API). [`MeteredClient`] wraps another client for
//! the duration of one turn and tallies what the turn cost.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use relaydesk_core::completion::{
    Completion, CompletionClient, CompletionError, CompletionRequest, TokenUsage,
};
use relaydesk_core::config::{LlmConfig, LlmProvider};
use relaydesk_core::domain::session::SessionUsage;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    api_base: String,
    api_key: Option<SecretString>,
    model: String,
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleClient")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl OpenAiCompatibleClient {
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| CompletionError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let api_base = match (&config.base_url, config.provider) {
            (Some(base_url), _) => base_url.clone(),
            (None, LlmProvider::OpenAi) => OPENAI_API_BASE.to_string(),
            (None, LlmProvider::Ollama) => {
                return Err(CompletionError::Transport(
                    "ollama provider requires llm.base_url".to_string(),
                ))
            }
        };
        Self::new(
            api_base,
            config.model.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatCompletionBody<'a> {
        ChatCompletionBody {
            model: &self.model,
            messages: request
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            temperature: request.temperature,
            tools: &request.tools,
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let mut builder = self.client.post(self.endpoint()).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                CompletionError::Transport(format!("request timed out: {error}"))
            } else {
                CompletionError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CompletionError::Provider { status: status.as_u16(), message });
        }

        let payload: ChatCompletionResponse =
            response.json().await.map_err(|error| CompletionError::Decode(error.to_string()))?;
        let completion = payload.into_completion()?;
        debug!(
            event_name = "llm.completion.received",
            model = %self.model,
            content_len = completion.content.len(),
            "completion received"
        );
        Ok(completion)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [serde_json::Value],
}

fn no_tools(tools: &&[serde_json::Value]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatCompletionResponse {
    fn into_completion(self) -> Result<Completion, CompletionError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Decode("response has no choices".to_string()))?;
        Ok(Completion {
            // A null content (tool-call-only answer) reads as empty and goes through retry.
            content: choice.message.content.unwrap_or_default(),
            usage: self.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }),
        })
    }
}

/// Per-turn decorator counting completion calls and token usage.
pub struct MeteredClient<'a> {
    inner: &'a dyn CompletionClient,
    usage: Mutex<SessionUsage>,
}

impl<'a> MeteredClient<'a> {
    pub fn new(inner: &'a dyn CompletionClient) -> Self {
        Self { inner, usage: Mutex::new(SessionUsage::default()) }
    }

    pub fn usage(&self) -> SessionUsage {
        match self.usage.lock() {
            Ok(usage) => *usage,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CompletionClient for MeteredClient<'_> {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let result = self.inner.complete(request).await;
        let tokens = result.as_ref().ok().and_then(|completion| completion.usage);
        let mut usage = match self.usage.lock() {
            Ok(usage) => usage,
            Err(poisoned) => poisoned.into_inner(),
        };
        usage.completion_calls += 1;
        if let Some(tokens) = tokens {
            usage.prompt_tokens += tokens.prompt_tokens;
            usage.completion_tokens += tokens.completion_tokens;
        }
        result
    }
}
