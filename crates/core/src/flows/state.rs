use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flows::config::{FieldKind, StateMachineConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Typed value of a business field.
///
/// Serialized untagged so YAML defaults and stored snapshots read naturally. An empty list
/// decodes as `StringList`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Bool(bool),
    StringList(Vec<String>),
    Messages(Vec<ChatMessage>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn empty_of(kind: FieldKind) -> Self {
        match kind {
            FieldKind::String => Self::String(String::new()),
            FieldKind::StringList => Self::StringList(Vec::new()),
            FieldKind::Bool => Self::Bool(false),
            FieldKind::Map => Self::Map(BTreeMap::new()),
            FieldKind::Messages => Self::Messages(Vec::new()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::String(value) => value.trim().is_empty(),
            Self::Bool(value) => !value,
            Self::StringList(values) => values.is_empty(),
            Self::Messages(messages) => messages.is_empty(),
            Self::Map(entries) => entries.is_empty(),
        }
    }

    /// Case-insensitive phrase membership: substring for text, element equality for lists.
    pub fn matches_any(&self, phrases: &[String]) -> bool {
        match self {
            Self::String(value) => {
                let lowered = value.to_lowercase();
                phrases.iter().any(|phrase| lowered.contains(&phrase.to_lowercase()))
            }
            Self::StringList(values) => values.iter().any(|value| {
                phrases.iter().any(|phrase| value.trim().eq_ignore_ascii_case(phrase.trim()))
            }),
            Self::Bool(value) => {
                let rendered = if *value { "true" } else { "false" };
                phrases.iter().any(|phrase| phrase.trim().eq_ignore_ascii_case(rendered))
            }
            Self::Messages(_) | Self::Map(_) => false,
        }
    }

    /// Text used when the value is substituted into a prompt.
    pub fn render(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Bool(value) => value.to_string(),
            Self::StringList(values) => values.join(", "),
            Self::Messages(messages) => format_history(messages),
            Self::Map(entries) => entries
                .iter()
                .map(|(key, value)| format!("{key}: {}", value.render()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// The blob threaded through `process_state` calls and checkpointed on the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub current_state: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl ConversationState {
    pub fn new(current_state: impl Into<String>) -> Self {
        Self { current_state: current_state.into(), messages: Vec::new(), fields: BTreeMap::new() }
    }

    /// Fresh state at the initial state with every business field at its schema default.
    pub fn from_schema(config: &StateMachineConfig) -> Self {
        let mut state = Self::new(config.settings.initial_state.clone());
        for (name, spec) in &config.state_schema.business_fields {
            let value = spec.default.clone().unwrap_or_else(|| FieldValue::empty_of(spec.kind));
            state.fields.insert(name.clone(), value);
        }
        state
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn last_message_is_user(&self) -> bool {
        self.messages.last().is_some_and(|message| message.role == Role::User)
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    pub fn conversation_history(&self) -> String {
        format_history(&self.messages)
    }

    /// Resolves a dotted path (`contact.email`) against the business fields.
    pub fn lookup(&self, path: &str) -> Option<&FieldValue> {
        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            match current {
                FieldValue::Map(entries) => current = entries.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(FieldValue::as_str)
    }

    /// Writes a value at a dotted path, creating intermediate maps. A scalar sitting where a
    /// map is needed gets replaced.
    pub fn set_field(&mut self, path: &str, value: FieldValue) {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut entries = &mut self.fields;
        for segment in parents {
            let slot = entries
                .entry((*segment).to_string())
                .or_insert_with(|| FieldValue::Map(BTreeMap::new()));
            if !matches!(slot, FieldValue::Map(_)) {
                *slot = FieldValue::Map(BTreeMap::new());
            }
            entries = match slot {
                FieldValue::Map(inner) => inner,
                _ => return,
            };
        }
        entries.insert((*last).to_string(), value);
    }
}

fn format_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|message| message.role != Role::System)
        .map(|message| match message.role {
            Role::User => format!("User: {}", message.content),
            _ => format!("Assistant: {}", message.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, ConversationState, FieldValue, Role};

    #[test]
    fn dotted_paths_create_and_resolve_nested_maps() {
        let mut state = ConversationState::new("start");
        state.set_field("employee.location", "EMEA".into());
        state.set_field("employee.email", "pat@example.com".into());

        assert_eq!(state.get_str("employee.location"), Some("EMEA"));
        assert_eq!(state.get_str("employee.email"), Some("pat@example.com"));
        assert_eq!(state.lookup("employee.missing"), None);
        assert_eq!(state.lookup("employee.location.deeper"), None);
    }

    #[test]
    fn scalar_is_replaced_when_a_nested_write_needs_a_map() {
        let mut state = ConversationState::new("start");
        state.set_field("laptop", "pending".into());
        state.set_field("laptop.model", "MacBook Pro".into());

        assert_eq!(state.get_str("laptop.model"), Some("MacBook Pro"));
    }

    #[test]
    fn history_skips_system_messages_and_tags_roles() {
        let mut state = ConversationState::new("start");
        state.push(ChatMessage::system("you are helpful"));
        state.push_user("hi");
        state.push(ChatMessage::assistant("hello, how can I help?"));

        assert_eq!(state.conversation_history(), "User: hi\nAssistant: hello, how can I help?");
        assert_eq!(state.last_user_message(), Some("hi"));
        assert!(!state.last_message_is_user());
    }

    #[test]
    fn phrase_membership_differs_for_text_and_lists() {
        let text = FieldValue::from("I would like the MacBook please");
        assert!(text.matches_any(&["macbook".to_string()]));

        let list = FieldValue::StringList(vec!["EMEA".to_string(), "APAC".to_string()]);
        assert!(list.matches_any(&["apac".to_string()]));
        assert!(!list.matches_any(&["AP".to_string()]));
    }

    #[test]
    fn emptiness_follows_value_kind() {
        assert!(FieldValue::from("  ").is_empty());
        assert!(FieldValue::Bool(false).is_empty());
        assert!(!FieldValue::StringList(vec!["x".to_string()]).is_empty());
    }

    #[test]
    fn snapshot_survives_json_round_trip() {
        let mut state = ConversationState::new("waiting_collect_model");
        state.push_user("the second one");
        state.set_field("laptop.model", "ThinkPad".into());
        state.set_field("confirmed", FieldValue::Bool(true));

        let encoded = serde_json::to_string(&state).expect("serialize");
        let decoded: ConversationState = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, state);
    }

    #[test]
    fn role_parse_accepts_langchain_style_aliases() {
        assert_eq!(Role::parse("human"), Some(Role::User));
        assert_eq!(Role::parse("AI"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
    }
}
