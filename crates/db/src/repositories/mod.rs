use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use relaydesk_core::domain::conversation::{
    ConversationEntry, ConversationQuery, ConversationSummary,
};
use relaydesk_core::domain::delivery::{DeliveryAttempt, DeliveryRecord};
use relaydesk_core::domain::request::{NormalizedRequest, RequestId};
use relaydesk_core::domain::session::{Session, SessionCheckpoint, SessionId, SessionName};

mod codec;
pub mod conversation;
pub mod delivery;
pub mod memory;
pub mod processed_event;
pub mod request;
pub mod session;

pub use conversation::SqlConversationRepository;
pub use delivery::SqlDeliveryRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryDeliveryRepository, InMemoryProcessedEventRepository,
    InMemoryRequestRepository, InMemorySessionRepository,
};
pub use processed_event::SqlProcessedEventRepository;
pub use request::SqlRequestRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Durable per-user sessions plus their resumption checkpoints.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<Session>, RepositoryError>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn find_checkpoint(
        &self,
        session_name: &SessionName,
    ) -> Result<Option<SessionCheckpoint>, RepositoryError>;

    /// Writes the session and its checkpoint atomically.
    async fn save(&self, session: &Session) -> Result<(), RepositoryError>;

    /// Marks the session closed; it stops being the user's active session.
    async fn close(&self, id: &SessionId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn append(&self, entry: ConversationEntry) -> Result<(), RepositoryError>;

    async fn search(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<ConversationSummary>, RepositoryError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<NormalizedRequest>, RepositoryError>;

    async fn save(&self, request: &NormalizedRequest) -> Result<(), RepositoryError>;
}

/// Delivery log. Records that reached a terminal status are never rewritten.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn find_by_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<DeliveryRecord>, RepositoryError>;

    /// Inserts a new record; returns false when one already exists for the request id.
    async fn create(&self, record: &DeliveryRecord) -> Result<bool, RepositoryError>;

    /// Takes the attempt lease on a record that is open and due at `now` (or overdue), until
    /// `lease_until`. Returns the stored record, or `None` when it is settled, not yet due, or
    /// leased by another caller.
    async fn claim(
        &self,
        id: &RequestId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, RepositoryError>;

    /// Persists the outcome of one attempt together with its audit row and drops the lease.
    async fn record_attempt(
        &self,
        record: &DeliveryRecord,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError>;

    async fn list_attempts(&self, id: &RequestId)
        -> Result<Vec<DeliveryAttempt>, RepositoryError>;

    /// Unleased PENDING/RETRYING records whose next attempt is due at `now`, oldest first.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError>;
}

/// Consumer-side dedupe ledger for at-least-once events.
#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    /// Returns true the first time `(event_id, consumer)` is seen.
    async fn mark_processed(&self, event_id: &str, consumer: &str)
        -> Result<bool, RepositoryError>;

    /// Removes the mark after a failed side effect so the redelivered event is handled again.
    async fn forget(&self, event_id: &str, consumer: &str) -> Result<(), RepositoryError>;
}
