use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::IntegrationType;
use crate::flows::Role;

pub const DEFAULT_CONVERSATION_LIMIT: u32 = 100;
pub const MAX_CONVERSATION_LIMIT: u32 = 1000;

/// One line of the conversation log: a user message or an agent reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub session_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub agent_name: String,
    pub role: Role,
    pub content: String,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationQuery {
    pub session_id: Option<String>,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub integration_types: Vec<IntegrationType>,
    pub agent_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub random_sample: bool,
    #[serde(default)]
    pub include_messages: bool,
    pub limit: Option<u32>,
}

impl ConversationQuery {
    /// Requested page size clamped to `1..=1000`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_CONVERSATION_LIMIT).clamp(1, MAX_CONVERSATION_LIMIT)
    }

    pub fn matches(&self, entry: &ConversationEntry) -> bool {
        self.session_id.as_ref().map_or(true, |id| *id == entry.session_id)
            && self.user_id.as_ref().map_or(true, |id| *id == entry.user_id)
            && self.user_email.as_ref().map_or(true, |email| {
                entry
                    .user_email
                    .as_ref()
                    .map_or(false, |candidate| candidate.eq_ignore_ascii_case(email))
            })
            && (self.integration_types.is_empty()
                || entry
                    .integration_type
                    .map_or(false, |integration| self.integration_types.contains(&integration)))
            && self.agent_id.as_ref().map_or(true, |agent| *agent == entry.agent_name)
            && self.start_date.map_or(true, |start| entry.created_at >= start)
            && self.end_date.map_or(true, |end| entry.created_at <= end)
    }
}

/// Per-session rollup returned by conversation search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub agent_names: Vec<String>,
    pub message_count: u64,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ConversationEntry>,
}
