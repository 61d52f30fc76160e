use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use relaydesk_core::config::SlackConfig;
use relaydesk_core::delivery::{DeliveryTransport, TransportError};
use relaydesk_core::domain::delivery::DeliveryRecord;

/// Delivers agent replies with `chat.postMessage`.
#[derive(Clone, Debug)]
pub struct SlackTransport {
    client: Client,
    api_base: String,
    bot_token: SecretString,
    timeout: Duration,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PostMessage<'a> {
    pub channel: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<&'a str>,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackTransport {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| TransportError::NotConfigured(error.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            bot_token,
            timeout,
        })
    }

    /// `None` when no bot token is configured.
    pub fn from_config(
        config: &SlackConfig,
        timeout: Duration,
    ) -> Result<Option<Self>, TransportError> {
        config
            .bot_token
            .clone()
            .map(|token| Self::new(config.api_base_url.clone(), token, timeout))
            .transpose()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat.postMessage", self.api_base)
    }
}

/// Builds the `chat.postMessage` body: channel messages go back to their channel (and thread),
/// direct messages to the Slack user.
pub fn post_message_for(record: &DeliveryRecord) -> Result<PostMessage<'_>, TransportError> {
    let channel = record
        .context_str("channel_id")
        .or_else(|| record.context_str("slack_user_id"))
        .ok_or_else(|| {
            TransportError::NotConfigured(format!(
                "slack record {} has neither channel_id nor slack_user_id",
                record.request_id
            ))
        })?;
    Ok(PostMessage {
        channel,
        text: &record.content,
        thread_ts: record.context_str("thread_id"),
    })
}

#[async_trait]
impl DeliveryTransport for SlackTransport {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, record: &DeliveryRecord) -> Result<(), TransportError> {
        let message = post_message_for(record)?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.bot_token.expose_secret())
            .json(&message)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::Network(error.to_string())
                }
            })?;

        let status = response.status();
        let body =
            response.text().await.map_err(|error| TransportError::Network(error.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Status { status: status.as_u16(), body });
        }

        // the Web API reports most failures as 200 with `ok: false`
        let parsed: PostMessageResponse = serde_json::from_str(&body).map_err(|error| {
            TransportError::Status { status: status.as_u16(), body: error.to_string() }
        })?;
        if !parsed.ok {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: parsed.error.unwrap_or_else(|| "unknown_error".to_owned()),
            });
        }

        debug!(
            event_name = "slack.message.posted",
            request_id = %record.request_id,
            channel = message.channel,
            threaded = message.thread_ts.is_some(),
            "posted reply to slack"
        );
        Ok(())
    }
}
