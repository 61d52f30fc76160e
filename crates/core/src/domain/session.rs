use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::IntegrationType;
use crate::flows::ConversationState;

/// Stable identifier for a user's session; survives agent handoffs, replaced on reset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Per-agent sub-session name: `{user}-{agent}-{suffix}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionName(pub String);

impl SessionName {
    pub fn generate(user_id: &str, agent_name: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|byte| char::from(byte).to_ascii_lowercase())
            .collect();
        Self(format!("{}-{}-{suffix}", sanitize(user_id), sanitize(agent_name)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub turns: u32,
    pub completion_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl SessionUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn absorb(&mut self, other: SessionUsage) {
        self.turns += other.turns;
        self.completion_calls += other.completion_calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub session_name: SessionName,
    pub current_agent_name: String,
    pub state_machine_snapshot: Option<ConversationState>,
    pub conversation_thread_id: ThreadId,
    pub email: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub pending_reset: bool,
    pub status: SessionStatus,
    pub usage: SessionUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn open(
        user_id: impl Into<String>,
        agent_name: impl Into<String>,
        email: Option<String>,
    ) -> Self {
        let user_id = user_id.into();
        let agent_name = agent_name.into();
        let now = Utc::now();
        Self {
            session_id: SessionId::generate(),
            session_name: SessionName::generate(&user_id, &agent_name),
            user_id,
            current_agent_name: agent_name,
            state_machine_snapshot: None,
            conversation_thread_id: ThreadId::generate(),
            email,
            integration_type: None,
            pending_reset: false,
            status: SessionStatus::Active,
            usage: SessionUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebinds this session to another agent with a fresh sub-session name and thread.
    /// The stable session id is kept so the user's history stays under one id.
    pub fn hand_off_to(&mut self, agent_name: impl Into<String>) {
        let agent_name = agent_name.into();
        self.session_name = SessionName::generate(&self.user_id, &agent_name);
        self.conversation_thread_id = ThreadId::generate();
        self.current_agent_name = agent_name;
        self.state_machine_snapshot = None;
        self.updated_at = Utc::now();
    }

    pub fn is_on_agent(&self, agent_name: &str) -> bool {
        self.current_agent_name.eq_ignore_ascii_case(agent_name)
    }

    pub fn checkpoint(&self) -> SessionCheckpoint {
        SessionCheckpoint {
            session_name: self.session_name.clone(),
            thread_id: self.conversation_thread_id.clone(),
            agent_name: self.current_agent_name.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Minimal resumption metadata persisted per sub-session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub session_name: SessionName,
    pub thread_id: ThreadId,
    pub agent_name: String,
    pub updated_at: DateTime<Utc>,
}

fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}
