use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use relaydesk_core::completion::{CompletionClient, CompletionRequest};
use relaydesk_core::domain::session::SessionUsage;
use relaydesk_core::flows::{
    complete_with_retry, render, ChatMessage, ConversationState, Pause, RetryPolicy, Role,
    StateMachineConfig, StateMachineEngine, TokioPause,
};

use crate::llm::MeteredClient;
use crate::registry::{AgentBehavior, AgentRegistry};

/// Final reply line a specialist emits once its flow reaches the terminal state.
pub const TASK_COMPLETE_SENTINEL: &str = "task_complete_return_to_router";

const DEFAULT_MAX_STEPS: usize = 16;
const CONVERSATION_STATE: &str = "conversation";
const MAX_CONVERSATIONAL_HISTORY: usize = 40;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),
}

/// What one agent turn produced.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    pub state: ConversationState,
    pub usage: SessionUsage,
    /// The agent's flow reached its terminal state during this turn.
    pub completed: bool,
}

pub struct AgentRuntime {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn CompletionClient>,
    retry: RetryPolicy,
    temperature: Option<f32>,
    pause: Arc<dyn Pause>,
    max_steps: usize,
}

impl AgentRuntime {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<dyn CompletionClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            client,
            retry,
            temperature: None,
            pause: Arc::new(TokioPause),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Feeds `text` to `agent_name`, resuming from `snapshot` when one is given.
    pub async fn run_turn(
        &self,
        agent_name: &str,
        snapshot: Option<ConversationState>,
        text: &str,
    ) -> Result<TurnOutcome, RuntimeError> {
        let definition = self
            .registry
            .get(agent_name)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_name.to_string()))?;
        let metered = MeteredClient::new(self.client.as_ref());

        let (reply, state, completed) = match &definition.behavior {
            AgentBehavior::StateMachine(flow) => {
                self.run_state_machine(&definition.name, flow, snapshot, text, &metered).await
            }
            AgentBehavior::Conversational { system_prompt } => {
                self.run_conversational(system_prompt, snapshot, text, &metered).await
            }
        };

        let mut usage = metered.usage();
        usage.turns = 1;
        info!(
            event_name = "agent.turn.completed",
            agent = %definition.name,
            state = %state.current_state,
            completed,
            completion_calls = usage.completion_calls,
            "agent turn completed"
        );
        Ok(TurnOutcome { reply, state, usage, completed })
    }

    async fn run_state_machine(
        &self,
        agent_name: &str,
        flow: &Arc<StateMachineConfig>,
        snapshot: Option<ConversationState>,
        text: &str,
        client: &dyn CompletionClient,
    ) -> (String, ConversationState, bool) {
        let engine = StateMachineEngine::new(Arc::clone(flow), self.retry.clone())
            .with_pause(Arc::clone(&self.pause))
            .with_temperature(self.temperature);
        let config = engine.config();

        let mut state = match snapshot {
            Some(state) if !config.is_terminal(config.base_state(&state.current_state)) => state,
            _ => engine.initial_state(),
        };
        state.push_user(text);
        state.current_state = config.base_state(&state.current_state).to_string();
        let turn_start = state.messages.len();

        let mut steps = 0;
        loop {
            state = engine.process_state(state, client).await;
            steps += 1;
            if config.is_waiting(&state.current_state) || config.is_terminal(&state.current_state)
            {
                break;
            }
            if steps >= self.max_steps {
                warn!(
                    event_name = "agent.turn.step_limit",
                    agent = %agent_name,
                    state = %state.current_state,
                    steps,
                    "state machine did not settle; parking it in a waiting state"
                );
                state.current_state = config.waiting_state(config.base_state(&state.current_state));
                break;
            }
        }

        let completed = config.is_terminal(&state.current_state);
        let mut reply = state.messages[turn_start..]
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if completed && !self.registry.is_routing_agent(agent_name) {
            if !reply.is_empty() {
                reply.push('\n');
            }
            reply.push_str(TASK_COMPLETE_SENTINEL);
        }
        (reply, state, completed)
    }

    async fn run_conversational(
        &self,
        system_prompt: &str,
        snapshot: Option<ConversationState>,
        text: &str,
        client: &dyn CompletionClient,
    ) -> (String, ConversationState, bool) {
        let mut state = snapshot.unwrap_or_else(|| ConversationState::new(CONVERSATION_STATE));
        state.push_user(text);
        if state.messages.len() > MAX_CONVERSATIONAL_HISTORY {
            let excess = state.messages.len() - MAX_CONVERSATIONAL_HISTORY;
            state.messages.drain(..excess);
        }

        let catalogue = self
            .registry
            .specialists()
            .map(|definition| match &definition.description {
                Some(description) => format!("- {}: {}", definition.name, description.trim()),
                None => format!("- {}", definition.name),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut messages = vec![ChatMessage::system(render(
            system_prompt,
            &state,
            &[("agents", catalogue.as_str())],
        ))];
        messages.extend(
            state.messages.iter().filter(|message| message.role != Role::System).cloned(),
        );

        let request = CompletionRequest::new(messages).with_temperature(self.temperature);
        let outcome = complete_with_retry(client, &request, &self.retry, self.pause.as_ref()).await;
        if outcome.is_degraded() {
            warn!(
                event_name = "agent.turn.degraded",
                attempts = self.retry.max_attempts(),
                "conversational agent exhausted completion retries"
            );
        }

        let reply = outcome.content().to_string();
        state.push(ChatMessage::assistant(reply.clone()));
        (reply, state, false)
    }
}
