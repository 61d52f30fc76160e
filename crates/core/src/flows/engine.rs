use std::sync::Arc;

use regex::Regex;
use tracing::{debug, error, info};

use crate::completion::{CompletionClient, CompletionRequest};
use crate::flows::config::{
    Action, ConditionalPrompt, ExtractSource, IntentClassifierState, LlmProcessorState,
    LlmValidatorState, PromptCondition, StateConfig, StateMachineConfig,
};
use crate::flows::retry::{complete_with_retry, CompletionOutcome, Pause, RetryPolicy, TokioPause};
use crate::flows::state::{ChatMessage, ConversationState, FieldValue, Role};
use crate::flows::template::render;

/// Interpreter for one declarative state machine.
///
/// `process_state` executes exactly one state and returns the updated conversation. Completion
/// failures never escape: they degrade into an apology and a waiting state so the next user turn
/// retries the same step.
#[derive(Clone)]
pub struct StateMachineEngine {
    config: Arc<StateMachineConfig>,
    retry: RetryPolicy,
    temperature: Option<f32>,
    pause: Arc<dyn Pause>,
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine")
            .field("initial_state", &self.config.settings.initial_state)
            .field("states", &self.config.states.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl StateMachineEngine {
    /// `retry` supplies timeout and fallback retry count; the definition's own retry count and
    /// error prefixes take precedence.
    pub fn new(config: Arc<StateMachineConfig>, retry: RetryPolicy) -> Self {
        let retry = RetryPolicy {
            retry_count: config.retry_count(retry.retry_count),
            error_prefixes: config.settings.error_prefixes.clone(),
            timeout: retry.timeout,
        };
        Self { config, retry, temperature: None, pause: Arc::new(TokioPause) }
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn initial_state(&self) -> ConversationState {
        ConversationState::from_schema(&self.config)
    }

    pub async fn process_state(
        &self,
        mut state: ConversationState,
        completion: &dyn CompletionClient,
    ) -> ConversationState {
        let settings = &self.config.settings;
        let base = self.config.base_state(&state.current_state).to_string();

        let Some(state_config) = self.config.states.get(&base) else {
            if base != settings.terminal_state {
                error!(
                    event_name = "flow.state.unknown",
                    state = %base,
                    terminal_state = %settings.terminal_state,
                    "state is not defined; forcing the conversation to the terminal state"
                );
            }
            state.current_state = settings.terminal_state.clone();
            return state;
        };

        debug!(event_name = "flow.state.entered", state = %base, kind = state_config.kind());
        let previous = state.current_state.clone();

        let state = match state_config {
            StateConfig::LlmProcessor(processor) => {
                self.run_processor(&base, processor, state, completion).await
            }
            StateConfig::IntentClassifier(classifier) => {
                self.run_classifier(&base, classifier, state, completion).await
            }
            StateConfig::LlmValidator(validator) => {
                self.run_validator(&base, validator, state, completion).await
            }
            StateConfig::Terminal(_) => {
                state.current_state = settings.terminal_state.clone();
                state
            }
        };

        info!(
            event_name = "flow.state.transition",
            from = %previous,
            to = %state.current_state,
            "state executed"
        );
        state
    }

    async fn run_processor(
        &self,
        base: &str,
        processor: &LlmProcessorState,
        mut state: ConversationState,
        completion: &dyn CompletionClient,
    ) -> ConversationState {
        let Some(template) = select_prompt(processor, &state) else {
            error!(
                event_name = "flow.state.misconfigured",
                state = %base,
                "no prompt matched and no fallback prompt configured"
            );
            state.current_state = self.config.settings.terminal_state.clone();
            return state;
        };

        let prompt = render(template, &state, &[]);
        let mut messages =
            if processor.use_conversation_history { state.messages.clone() } else { Vec::new() };
        messages.push(ChatMessage::user(prompt));

        let outcome = self.complete(messages, completion).await;
        let response = match outcome {
            CompletionOutcome::Completed(completion) => completion.content,
            CompletionOutcome::Degraded { apology, .. } => {
                return self.degrade(base, state, apology)
            }
        };

        let user_input = state.last_user_message().unwrap_or_default().to_string();
        let bindings = [("llm_response", response.as_str()), ("user_input", user_input.as_str())];
        store_fields(&mut state, &processor.data_storage, &bindings);

        let mut reply = response.clone();
        let mut extra_messages = Vec::new();
        let next = match &processor.response_analysis {
            Some(analysis) => {
                let lowered = response.to_lowercase();
                let chosen = match analysis.conditions.iter().find(|c| c.matches(&lowered)) {
                    Some(condition) => {
                        let mut turn = TurnOutput {
                            reply: &mut reply,
                            extra_messages: &mut extra_messages,
                        };
                        self.apply_actions(
                            base,
                            &condition.actions,
                            &mut state,
                            &mut turn,
                            &bindings,
                        )
                    }
                    None => None,
                };
                chosen
                    .or_else(|| analysis.default_transition.clone())
                    .or_else(|| processor.transitions.get("success").cloned())
            }
            None => processor.transitions.get("success").cloned(),
        };

        state.push(ChatMessage::assistant(reply));
        state.messages.extend(extra_messages);
        state.current_state = next.unwrap_or_else(|| self.config.settings.terminal_state.clone());
        state
    }

    /// Runs a matched condition's actions in order; returns the first transition target.
    fn apply_actions(
        &self,
        base: &str,
        actions: &[Action],
        state: &mut ConversationState,
        turn: &mut TurnOutput<'_>,
        bindings: &[(&str, &str)],
    ) -> Option<String> {
        let mut next = None;
        for action in actions {
            match action {
                Action::Transition { target } => {
                    if next.is_none() {
                        next = Some(target.clone());
                    }
                }
                Action::CheckCorrection { phrases, message } => {
                    let user = state.last_user_message().unwrap_or_default().to_lowercase();
                    if phrases.iter().any(|phrase| user.contains(&phrase.to_lowercase())) {
                        turn.append(Role::Assistant, render(message, state, bindings));
                    }
                }
                Action::ExtractData { field, pattern, source } => {
                    let haystack = match source {
                        ExtractSource::Response => bindings_value(bindings, "llm_response"),
                        ExtractSource::UserMessage => {
                            state.last_user_message().unwrap_or_default().to_string()
                        }
                    };
                    match Regex::new(pattern) {
                        Ok(regex) => {
                            if let Some(value) = extract(&regex, &haystack) {
                                state.set_field(field, FieldValue::String(value));
                            }
                        }
                        Err(error) => error!(
                            event_name = "flow.action.invalid_pattern",
                            state = %base,
                            pattern = %pattern,
                            error = %error,
                            "extraction pattern does not compile"
                        ),
                    }
                }
                Action::AddMessage { message, role } => {
                    turn.append(*role, render(message, state, bindings));
                }
                Action::SetField { field, value } => state.set_field(field, value.clone()),
            }
        }
        next
    }

    async fn run_classifier(
        &self,
        base: &str,
        classifier: &IntentClassifierState,
        mut state: ConversationState,
        completion: &dyn CompletionClient,
    ) -> ConversationState {
        if !state.last_message_is_user() {
            state.current_state = self.config.waiting_state(base);
            return state;
        }

        let user_input = state.last_user_message().unwrap_or_default().to_string();
        let messages = vec![
            ChatMessage::system(render(&classifier.prompt, &state, &[])),
            ChatMessage::user(user_input.clone()),
        ];
        let classification = match self.complete(messages, completion).await {
            CompletionOutcome::Completed(completion) => completion.content,
            CompletionOutcome::Degraded { apology, .. } => {
                return self.degrade(base, state, apology)
            }
        };

        let Some((intent, action)) = classifier.intent_actions.find(&classification) else {
            info!(
                event_name = "flow.intent.unmatched",
                state = %base,
                classification = %classification.trim(),
                "classifier output matched no intent"
            );
            state.current_state = self.config.waiting_state(base);
            return state;
        };

        let bindings = [
            ("intent", intent),
            ("user_input", user_input.as_str()),
            ("llm_response", classification.as_str()),
        ];
        let mut reply = String::new();
        if let Some(response) = &action.response {
            reply.push_str(&render(response, &state, &bindings));
        }

        let mut degraded = false;
        if let Some(prompt) = &action.prompt {
            let mut messages = state.messages.clone();
            messages.push(ChatMessage::system(render(prompt, &state, &bindings)));
            let outcome = self.complete(messages, completion).await;
            degraded = outcome.is_degraded();
            if !reply.is_empty() {
                reply.push_str("\n\n");
            }
            reply.push_str(outcome.content());
        }

        store_fields(&mut state, &action.data_storage, &bindings);
        if !reply.is_empty() {
            state.push(ChatMessage::assistant(reply));
        }
        state.current_state = match (&action.next_state, degraded) {
            (Some(next), false) => next.clone(),
            _ => self.config.waiting_state(base),
        };
        state
    }

    async fn run_validator(
        &self,
        base: &str,
        validator: &LlmValidatorState,
        mut state: ConversationState,
        completion: &dyn CompletionClient,
    ) -> ConversationState {
        if !state.last_message_is_user() {
            state.current_state = self.config.waiting_state(base);
            return state;
        }

        let mut messages = state.messages.clone();
        messages.push(ChatMessage::system(render(&validator.prompt, &state, &[])));
        let response = match self.complete(messages, completion).await {
            CompletionOutcome::Completed(completion) => completion.content,
            CompletionOutcome::Degraded { apology, .. } => {
                return self.degrade(base, state, apology)
            }
        };

        let bindings = [("llm_response", response.as_str())];
        let check = render(&validator.success_validation_prompt, &state, &bindings);
        let verdict = self.complete(vec![ChatMessage::user(check)], completion).await;
        let valid = is_valid_verdict(verdict.content());

        let user_input = state.last_user_message().unwrap_or_default().to_string();
        store_fields(&mut state, &validator.data_storage, &[
            ("user_input", user_input.as_str()),
            ("llm_response", response.as_str()),
        ]);

        let next = if valid {
            validator.transitions.get("valid").or_else(|| validator.transitions.get("success"))
        } else {
            validator.transitions.get("invalid")
        };
        debug!(
            event_name = "flow.validator.verdict",
            state = %base,
            valid,
            "validation classified"
        );

        state.push(ChatMessage::assistant(response));
        state.current_state = match next {
            Some(next) => next.clone(),
            None if valid => self.config.settings.terminal_state.clone(),
            None => self.config.waiting_state(base),
        };
        state
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        completion: &dyn CompletionClient,
    ) -> CompletionOutcome {
        let request = CompletionRequest::new(messages).with_temperature(self.temperature);
        complete_with_retry(completion, &request, &self.retry, self.pause.as_ref()).await
    }

    fn degrade(
        &self,
        base: &str,
        mut state: ConversationState,
        apology: String,
    ) -> ConversationState {
        error!(
            event_name = "flow.completion.exhausted",
            state = %base,
            attempts = self.retry.max_attempts(),
            "completion retries exhausted; replying with apology"
        );
        state.push(ChatMessage::assistant(apology));
        state.current_state = self.config.waiting_state(base);
        state
    }
}

/// Collects what one state execution says to the user: assistant-role text is merged into the
/// turn's single reply, other roles become separate messages.
struct TurnOutput<'a> {
    reply: &'a mut String,
    extra_messages: &'a mut Vec<ChatMessage>,
}

impl TurnOutput<'_> {
    fn append(&mut self, role: Role, text: String) {
        if role == Role::Assistant {
            if !self.reply.is_empty() {
                self.reply.push_str("\n\n");
            }
            self.reply.push_str(&text);
        } else {
            self.extra_messages.push(ChatMessage::new(role, text));
        }
    }
}

fn select_prompt<'a>(
    processor: &'a LlmProcessorState,
    state: &ConversationState,
) -> Option<&'a str> {
    let conditional = processor
        .conditional_prompts
        .iter()
        .find(|entry| entry.condition != PromptCondition::Default && condition_holds(entry, state))
        .or_else(|| {
            processor
                .conditional_prompts
                .iter()
                .find(|entry| entry.condition == PromptCondition::Default)
        });

    conditional.map(|entry| entry.prompt.as_str()).or(processor.prompt.as_deref())
}

fn condition_holds(entry: &ConditionalPrompt, state: &ConversationState) -> bool {
    match &entry.condition {
        PromptCondition::Default => true,
        PromptCondition::AnyOf { field, any_of } => {
            state.lookup(field).is_some_and(|value| value.matches_any(any_of))
        }
        PromptCondition::Empty { field, empty } => {
            let is_empty = state.lookup(field).map_or(true, FieldValue::is_empty);
            is_empty == *empty
        }
    }
}

/// VALID wins only when the verdict does not also say INVALID.
fn is_valid_verdict(verdict: &str) -> bool {
    let upper = verdict.to_uppercase();
    upper.contains("VALID") && !upper.contains("INVALID")
}

fn store_fields(
    state: &mut ConversationState,
    storage: &std::collections::BTreeMap<String, String>,
    bindings: &[(&str, &str)],
) {
    for (field, template) in storage {
        let value = render(template, state, bindings);
        state.set_field(field, FieldValue::String(value));
    }
}

fn bindings_value(bindings: &[(&str, &str)], key: &str) -> String {
    bindings
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| (*value).to_string())
        .unwrap_or_default()
}

fn extract(regex: &Regex, haystack: &str) -> Option<String> {
    let captures = regex.captures(haystack)?;
    captures.get(1).or_else(|| captures.get(0)).map(|m| m.as_str().trim().to_string())
}
