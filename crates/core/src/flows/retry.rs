use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::completion::{Completion, CompletionClient, CompletionError, CompletionRequest};

pub const APOLOGY_MESSAGE: &str =
    "I'm sorry, I'm having trouble responding right now. Please try again in a moment.";

const MAX_BACKOFF_SECS: u64 = 8;

/// Suspension between retry attempts.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, delay: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Records requested delays without sleeping.
#[derive(Clone, Debug, Default)]
pub struct RecordingPause {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingPause {
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn total(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

#[async_trait]
impl Pause for RecordingPause {
    async fn pause(&self, delay: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(delay),
            Err(poisoned) => poisoned.into_inner().push(delay),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub timeout: Duration,
    pub error_prefixes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            timeout: Duration::from_secs(120),
            error_prefixes: vec!["Error:".to_string()],
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Backoff before retry number `attempt + 1`: `min(2^attempt, 8)` seconds.
    pub fn delay_for(attempt: u32) -> Duration {
        let seconds = 2u64.checked_pow(attempt).unwrap_or(u64::MAX).min(MAX_BACKOFF_SECS);
        Duration::from_secs(seconds)
    }

    fn is_error_text(&self, content: &str) -> bool {
        let trimmed = content.trim();
        trimmed.is_empty() || self.error_prefixes.iter().any(|prefix| trimmed.starts_with(prefix))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CompletionOutcome {
    Completed(Completion),
    /// Every attempt failed; carries the apology shown to the user instead.
    Degraded { apology: String, attempts: u32, last_error: String },
}

impl CompletionOutcome {
    pub fn content(&self) -> &str {
        match self {
            Self::Completed(completion) => &completion.content,
            Self::Degraded { apology, .. } => apology,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Runs one logical completion with bounded retries. Never returns an error: exhausted
/// retries collapse into [`CompletionOutcome::Degraded`].
pub async fn complete_with_retry(
    client: &dyn CompletionClient,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    pause: &dyn Pause,
) -> CompletionOutcome {
    let mut last_error = String::new();

    for attempt in 0..policy.max_attempts() {
        let result = match tokio::time::timeout(policy.timeout, client.complete(request.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(policy.timeout)),
        };

        match result {
            Ok(completion) if !policy.is_error_text(&completion.content) => {
                return CompletionOutcome::Completed(completion);
            }
            Ok(completion) => {
                last_error = if completion.content.trim().is_empty() {
                    "empty response".to_string()
                } else {
                    completion.content
                };
            }
            Err(error) => last_error = error.to_string(),
        }

        warn!(
            event_name = "flow.completion.retry",
            attempt = attempt + 1,
            max_attempts = policy.max_attempts(),
            error = %last_error,
            "completion attempt failed"
        );

        if attempt < policy.retry_count {
            pause.pause(RetryPolicy::delay_for(attempt)).await;
        }
    }

    CompletionOutcome::Degraded {
        apology: APOLOGY_MESSAGE.to_string(),
        attempts: policy.max_attempts(),
        last_error,
    }
}
