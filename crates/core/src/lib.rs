pub mod audit;
pub mod completion;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod events;
pub mod flows;
pub mod normalizer;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
pub use completion::{Completion, CompletionClient, CompletionError, CompletionRequest, TokenUsage};
pub use delivery::{DeliveryEngine, DeliveryManager, DeliveryPolicy, DeliveryTransport};
pub use domain::conversation::{ConversationEntry, ConversationQuery, ConversationSummary};
pub use domain::delivery::{DeliveryAttempt, DeliveryRecord, DeliveryStatus};
pub use domain::request::{IntegrationType, NormalizedRequest, RequestId};
pub use domain::session::{Session, SessionCheckpoint, SessionId, SessionStatus, SessionUsage};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use events::{CloudEvent, EventBus, EventFilter, InMemoryEventBus};
pub use flows::{ConversationState, StateMachineConfig, StateMachineEngine};
pub use normalizer::{Normalizer, RawRequest, ToolAgentMap};
