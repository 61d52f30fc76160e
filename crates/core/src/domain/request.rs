use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationType {
    Slack,
    Web,
    Cli,
    Tool,
    Email,
    Teams,
    Sms,
    Webhook,
}

impl IntegrationType {
    pub const ALL: [IntegrationType; 8] = [
        Self::Slack,
        Self::Web,
        Self::Cli,
        Self::Tool,
        Self::Email,
        Self::Teams,
        Self::Sms,
        Self::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "SLACK",
            Self::Web => "WEB",
            Self::Cli => "CLI",
            Self::Tool => "TOOL",
            Self::Email => "EMAIL",
            Self::Teams => "TEAMS",
            Self::Sms => "SMS",
            Self::Webhook => "WEBHOOK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SLACK" => Some(Self::Slack),
            "WEB" => Some(Self::Web),
            "CLI" => Some(Self::Cli),
            "TOOL" => Some(Self::Tool),
            "EMAIL" => Some(Self::Email),
            "TEAMS" => Some(Self::Teams),
            "SMS" => Some(Self::Sms),
            "WEBHOOK" => Some(Self::Webhook),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of an inbound request, whatever channel it arrived on.
///
/// Built once by the normalizer and never mutated afterwards. `target_agent_id` is only ever
/// set for tool requests whose origin maps to a known agent, in which case
/// `requires_routing` is false.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub request_id: RequestId,
    pub session_id: String,
    pub user_id: String,
    pub integration_type: IntegrationType,
    pub content: String,
    pub integration_context: Map<String, Value>,
    pub user_context: Map<String, Value>,
    pub target_agent_id: Option<String>,
    pub requires_routing: bool,
    pub created_at: DateTime<Utc>,
}

impl NormalizedRequest {
    pub fn user_email(&self) -> Option<&str> {
        self.user_context.get("email").and_then(Value::as_str)
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.integration_context.get(key).and_then(Value::as_str)
    }
}
