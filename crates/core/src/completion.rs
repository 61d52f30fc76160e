//! Contract for the chat-completion capability the state machines run against.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::ChatMessage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, temperature: None, tools: Vec::new() }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), usage: None }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion transport failed: {0}")]
    Transport(String),
    #[error("completion provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("completion response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

/// Completion client that replays a fixed script and records every request it receives.
///
/// Once the script runs out it keeps answering with the fallback, or with a transport error
/// when no fallback was set.
#[derive(Debug, Default)]
pub struct ScriptedCompletionClient {
    script: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    calls: Mutex<Vec<CompletionRequest>>,
    fallback: Option<String>,
}

impl ScriptedCompletionClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_steps(responses.into_iter().map(|text| Ok(Completion::text(text))))
    }

    pub fn from_steps<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = Result<Completion, CompletionError>>,
    {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn push(&self, step: Result<Completion, CompletionError>) {
        match self.script.lock() {
            Ok(mut script) => script.push_back(step),
            Err(poisoned) => poisoned.into_inner().push_back(step),
        }
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match (next, &self.fallback) {
            (Some(step), _) => step,
            (None, Some(text)) => Ok(Completion::text(text.clone())),
            (None, None) => Err(CompletionError::Transport("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Completion, CompletionClient, CompletionError, CompletionRequest, ScriptedCompletionClient,
    };
    use crate::flows::ChatMessage;

    #[tokio::test]
    async fn scripted_client_replays_steps_then_fallback() {
        let client = ScriptedCompletionClient::from_steps([
            Ok(Completion::text("first")),
            Err(CompletionError::Transport("connection reset".to_string())),
        ])
        .with_fallback("again");

        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(client.complete(request.clone()).await.map(|c| c.content), Ok("first".into()));
        assert!(client.complete(request.clone()).await.is_err());
        assert_eq!(client.complete(request).await.map(|c| c.content), Ok("again".into()));
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.calls()[0].messages[0].content, "hi");
    }

    #[tokio::test]
    async fn exhausted_script_without_fallback_is_a_transport_error() {
        let client = ScriptedCompletionClient::new(Vec::<String>::new());
        let result = client.complete(CompletionRequest::new(Vec::new())).await;
        assert!(matches!(result, Err(CompletionError::Transport(_))));
    }
}
