//! Declarative state-machine definitions.
//!
//! A definition is loaded once (normally from an agent YAML file), validated, and then shared
//! read-only by every conversation that runs it.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::flows::state::{FieldValue, Role};

pub const DEFAULT_TERMINAL_STATE: &str = "end";
pub const DEFAULT_WAITING_PREFIX: &str = "waiting_";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowConfigError {
    #[error("state machine definition could not be parsed: {0}")]
    Parse(String),
    #[error("state machine defines no states")]
    NoStates,
    #[error("initial state `{0}` is not defined")]
    UnknownInitialState(String),
    #[error("state `{state}` points at unknown state `{target}`")]
    UnknownTarget { state: String, target: String },
    #[error("state `{state}` has no prompt to send")]
    MissingPrompt { state: String },
    #[error("state `{state}` has an invalid extraction pattern `{pattern}`: {message}")]
    InvalidPattern { state: String, pattern: String, message: String },
    #[error("waiting prefix must not be empty")]
    EmptyWaitingPrefix,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub state_schema: StateSchema,
    pub states: BTreeMap<String, StateConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
    #[serde(default = "default_terminal_state")]
    pub terminal_state: String,
    #[serde(default = "default_waiting_prefix")]
    pub waiting_state_prefix: String,
    /// Overrides the process-wide retry count when present.
    #[serde(default)]
    pub empty_response_retry_count: Option<u32>,
    /// Completions starting with one of these are treated as empty and retried.
    #[serde(default = "default_error_prefixes")]
    pub error_prefixes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_state: default_initial_state(),
            terminal_state: default_terminal_state(),
            waiting_state_prefix: default_waiting_prefix(),
            empty_response_retry_count: None,
            error_prefixes: default_error_prefixes(),
        }
    }
}

fn default_initial_state() -> String {
    "start".to_string()
}

fn default_terminal_state() -> String {
    DEFAULT_TERMINAL_STATE.to_string()
}

fn default_waiting_prefix() -> String {
    DEFAULT_WAITING_PREFIX.to_string()
}

fn default_error_prefixes() -> Vec<String> {
    vec!["Error:".to_string()]
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(default)]
    pub system_fields: Vec<String>,
    #[serde(default)]
    pub business_fields: BTreeMap<String, FieldSpec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    StringList,
    Bool,
    Map,
    Messages,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub default: Option<FieldValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateConfig {
    LlmProcessor(LlmProcessorState),
    IntentClassifier(IntentClassifierState),
    LlmValidator(LlmValidatorState),
    Terminal(TerminalState),
}

impl StateConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LlmProcessor(_) => "llm_processor",
            Self::IntentClassifier(_) => "intent_classifier",
            Self::LlmValidator(_) => "llm_validator",
            Self::Terminal(_) => "terminal",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmProcessorState {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub conditional_prompts: Vec<ConditionalPrompt>,
    #[serde(default)]
    pub use_conversation_history: bool,
    /// Field path → template rendered with `{llm_response}` and `{user_input}` available.
    #[serde(default)]
    pub data_storage: BTreeMap<String, String>,
    #[serde(default)]
    pub response_analysis: Option<ResponseAnalysis>,
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionalPrompt {
    pub condition: PromptCondition,
    pub prompt: String,
}

/// Predicate selecting a conditional prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPromptCondition", into = "RawPromptCondition")]
pub enum PromptCondition {
    Default,
    AnyOf { field: String, any_of: Vec<String> },
    Empty { field: String, empty: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawPromptCondition {
    Keyword(String),
    AnyOf { field: String, any_of: Vec<String> },
    Empty { field: String, empty: bool },
}

impl TryFrom<RawPromptCondition> for PromptCondition {
    type Error = String;

    fn try_from(raw: RawPromptCondition) -> Result<Self, Self::Error> {
        match raw {
            RawPromptCondition::Keyword(keyword) if keyword.trim() == "default" => {
                Ok(Self::Default)
            }
            RawPromptCondition::Keyword(other) => {
                Err(format!("unsupported prompt condition `{other}`; expected `default`"))
            }
            RawPromptCondition::AnyOf { field, any_of } => Ok(Self::AnyOf { field, any_of }),
            RawPromptCondition::Empty { field, empty } => Ok(Self::Empty { field, empty }),
        }
    }
}

impl From<PromptCondition> for RawPromptCondition {
    fn from(condition: PromptCondition) -> Self {
        match condition {
            PromptCondition::Default => Self::Keyword("default".to_string()),
            PromptCondition::AnyOf { field, any_of } => Self::AnyOf { field, any_of },
            PromptCondition::Empty { field, empty } => Self::Empty { field, empty },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseAnalysis {
    #[serde(default)]
    pub conditions: Vec<AnalysisCondition>,
    #[serde(default)]
    pub default_transition: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCondition {
    #[serde(default)]
    pub trigger_phrases: Vec<String>,
    #[serde(default)]
    pub exclude_phrases: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl AnalysisCondition {
    /// `lowered` is the already-lowercased completion text.
    pub fn matches(&self, lowered: &str) -> bool {
        let contains = |phrase: &String| lowered.contains(&phrase.to_lowercase());
        self.trigger_phrases.iter().any(contains) && !self.exclude_phrases.iter().any(contains)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
    #[default]
    Response,
    UserMessage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Transition {
        target: String,
    },
    /// Appends `message` when the latest user message contains one of `phrases`.
    CheckCorrection {
        phrases: Vec<String>,
        message: String,
    },
    ExtractData {
        field: String,
        pattern: String,
        #[serde(default)]
        source: ExtractSource,
    },
    AddMessage {
        message: String,
        #[serde(default)]
        role: Role,
    },
    SetField {
        field: String,
        value: FieldValue,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentClassifierState {
    pub prompt: String,
    pub intent_actions: IntentActions,
}

/// Intent → action table that keeps declaration order, so earlier keys win when several
/// match the classifier output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntentActions(pub Vec<(String, IntentAction)>);

impl IntentActions {
    pub fn find(&self, classification: &str) -> Option<(&str, &IntentAction)> {
        let lowered = classification.trim().to_lowercase();
        self.0
            .iter()
            .find(|(intent, _)| lowered.contains(&intent.to_lowercase()))
            .map(|(intent, action)| (intent.as_str(), action))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, IntentAction)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for IntentActions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = IntentActions;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of intent names to actions")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((intent, action)) = access.next_entry::<String, IntentAction>()? {
                    entries.push((intent, action));
                }
                Ok(IntentActions(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

impl Serialize for IntentActions {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (intent, action) in &self.0 {
            map.serialize_entry(intent, action)?;
        }
        map.end()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentAction {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub data_storage: BTreeMap<String, String>,
    #[serde(default)]
    pub next_state: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmValidatorState {
    pub prompt: String,
    pub success_validation_prompt: String,
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
    /// Field path → template rendered with `{user_input}` available.
    #[serde(default)]
    pub data_storage: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalState {
    #[serde(default)]
    pub description: Option<String>,
}

impl StateMachineConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self, FlowConfigError> {
        let config: Self = serde_yaml::from_str(source)
            .map_err(|error| FlowConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn retry_count(&self, fallback: u32) -> u32 {
        self.settings.empty_response_retry_count.unwrap_or(fallback)
    }

    pub fn waiting_state(&self, base: &str) -> String {
        format!("{}{base}", self.settings.waiting_state_prefix)
    }

    /// Strips the waiting prefix, if any.
    pub fn base_state<'a>(&self, name: &'a str) -> &'a str {
        name.strip_prefix(self.settings.waiting_state_prefix.as_str()).unwrap_or(name)
    }

    pub fn is_waiting(&self, name: &str) -> bool {
        name.starts_with(self.settings.waiting_state_prefix.as_str())
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        name == self.settings.terminal_state
            || matches!(self.states.get(name), Some(StateConfig::Terminal(_)))
    }

    /// A target resolves when it names a state, the terminal state, or a waiting pseudo-state
    /// of a known state.
    pub fn resolves(&self, target: &str) -> bool {
        if target == self.settings.terminal_state || self.states.contains_key(target) {
            return true;
        }
        self.is_waiting(target) && self.states.contains_key(self.base_state(target))
    }

    pub fn validate(&self) -> Result<(), FlowConfigError> {
        if self.states.is_empty() {
            return Err(FlowConfigError::NoStates);
        }
        if self.settings.waiting_state_prefix.is_empty() {
            return Err(FlowConfigError::EmptyWaitingPrefix);
        }
        if !self.states.contains_key(&self.settings.initial_state) {
            return Err(FlowConfigError::UnknownInitialState(self.settings.initial_state.clone()));
        }

        for (name, state) in &self.states {
            for target in self.targets_of(state) {
                if !self.resolves(target) {
                    return Err(FlowConfigError::UnknownTarget {
                        state: name.clone(),
                        target: target.to_string(),
                    });
                }
            }

            match state {
                StateConfig::LlmProcessor(processor) => {
                    let has_default = processor
                        .conditional_prompts
                        .iter()
                        .any(|entry| entry.condition == PromptCondition::Default);
                    if processor.prompt.is_none() && !has_default {
                        return Err(FlowConfigError::MissingPrompt { state: name.clone() });
                    }
                    for pattern in extraction_patterns(processor) {
                        Regex::new(pattern).map_err(|error| FlowConfigError::InvalidPattern {
                            state: name.clone(),
                            pattern: pattern.to_string(),
                            message: error.to_string(),
                        })?;
                    }
                }
                StateConfig::IntentClassifier(IntentClassifierState { prompt, .. })
                | StateConfig::LlmValidator(LlmValidatorState { prompt, .. })
                    if prompt.trim().is_empty() =>
                {
                    return Err(FlowConfigError::MissingPrompt { state: name.clone() });
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn targets_of<'a>(&self, state: &'a StateConfig) -> Vec<&'a str> {
        let mut targets = Vec::new();
        match state {
            StateConfig::LlmProcessor(processor) => {
                targets.extend(processor.transitions.values().map(String::as_str));
                if let Some(analysis) = &processor.response_analysis {
                    targets.extend(analysis.default_transition.as_deref());
                    for condition in &analysis.conditions {
                        for action in &condition.actions {
                            if let Action::Transition { target } = action {
                                targets.push(target);
                            }
                        }
                    }
                }
            }
            StateConfig::IntentClassifier(classifier) => {
                targets.extend(classifier.intent_actions.iter().filter_map(|(_, action)| {
                    action.next_state.as_deref()
                }));
            }
            StateConfig::LlmValidator(validator) => {
                targets.extend(validator.transitions.values().map(String::as_str));
            }
            StateConfig::Terminal(_) => {}
        }
        targets
    }
}

fn extraction_patterns(processor: &LlmProcessorState) -> Vec<&str> {
    processor
        .response_analysis
        .iter()
        .flat_map(|analysis| analysis.conditions.iter())
        .flat_map(|condition| condition.actions.iter())
        .filter_map(|action| match action {
            Action::ExtractData { pattern, .. } => Some(pattern.as_str()),
            _ => None,
        })
        .collect()
}
