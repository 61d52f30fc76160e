//! Agent runtime: everything between a normalized request and the reply text.
//!
//! # Architecture
//!
//! A turn flows through four layers:
//! 1. **Dispatch** (`dispatcher`) - one FIFO worker per user, so a user's turns never overlap
//! 2. **Routing** (`router`) - find or open the user's session, hand off between the routing
//!    agent and specialists, persist the session and the conversation log
//! 3. **Execution** (`runtime`) - drive a state-machine or conversational agent for one turn
//! 4. **Completion** (`llm`) - OpenAI-compatible chat completions, metered per turn
//!
//! Agent definitions live in YAML files and are loaded by `registry`.
//!
//! # Key Types
//!
//! - `TurnDispatcher` - per-user serialization in front of the router
//! - `SessionRouter` - session lifecycle and handoff rules
//! - `AgentRuntime` - runs one agent turn and reports its usage
//! - `AgentRegistry` - case-insensitive catalogue of agent definitions

pub mod dispatcher;
pub mod llm;
pub mod registry;
pub mod router;
pub mod runtime;

pub use dispatcher::{DispatchError, PendingTurn, TurnDispatcher};
pub use llm::{MeteredClient, OpenAiCompatibleClient};
pub use registry::{AgentBehavior, AgentDefinition, AgentKind, AgentRegistry, RegistryError};
pub use router::{RoutedReply, RouterError, SessionRouter, TurnInput};
pub use runtime::{AgentRuntime, RuntimeError, TurnOutcome, TASK_COMPLETE_SENTINEL};
