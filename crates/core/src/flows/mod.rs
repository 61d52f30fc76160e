pub mod config;
pub mod engine;
pub mod retry;
pub mod state;
pub mod template;

pub use config::{
    Action, AnalysisCondition, ConditionalPrompt, ExtractSource, FieldKind, FieldSpec,
    FlowConfigError, IntentAction, IntentActions, IntentClassifierState, LlmProcessorState,
    LlmValidatorState, PromptCondition, ResponseAnalysis, Settings, StateConfig,
    StateMachineConfig, StateSchema, TerminalState,
};
pub use engine::StateMachineEngine;
pub use retry::{
    complete_with_retry, CompletionOutcome, Pause, RecordingPause, RetryPolicy, TokioPause,
    APOLOGY_MESSAGE,
};
pub use state::{ChatMessage, ConversationState, FieldValue, Role};
pub use template::render;
