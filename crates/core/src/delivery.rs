//! Response delivery state machine.
//!
//! `DeliveryEngine` holds the pure transition rules (no clock, no I/O: callers pass `now`), and
//! `DeliveryManager` runs one attempt through the integration's transport and applies them.
//!
//! PENDING → DELIVERED | RETRYING → ... → DELIVERED | FAILED (attempts exhausted)
//! | EXPIRED (deadline passed first).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::delivery::{DeliveryAttempt, DeliveryRecord, DeliveryStatus};
use crate::domain::request::{IntegrationType, NormalizedRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub retry_delay_seconds: i64,
    pub expiry_seconds: i64,
    pub timeout: StdDuration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_seconds: 5,
            expiry_seconds: 3600,
            timeout: StdDuration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport network failure: {0}")]
    Network(String),
    #[error("transport timed out after {0:?}")]
    Timeout(StdDuration),
    #[error("no transport configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Retrying cannot help when nothing knows how to reach the channel.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotConfigured(_))
    }
}

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, record: &DeliveryRecord) -> Result<(), TransportError>;
}

/// What the engine says should happen to a record right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Attempt,
    Expire,
    NotDue(DateTime<Utc>),
    Settled(DeliveryStatus),
}

pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

#[derive(Clone, Debug, Default)]
pub struct DeliveryEngine {
    policy: DeliveryPolicy,
}

impl DeliveryEngine {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn create_record(
        &self,
        request: &NormalizedRequest,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DeliveryRecord {
        let content = content.into();
        DeliveryRecord {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            integration_type: request.integration_type,
            integration_context: request.integration_context.clone(),
            content_hash: content_hash(&content),
            content,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: self.policy.max_attempts.max(1),
            first_attempt_at: None,
            last_attempt_at: None,
            next_attempt_at: Some(now),
            delivered_at: None,
            expires_at: now + Duration::seconds(self.policy.expiry_seconds),
            error_message: None,
            created_at: now,
        }
    }

    pub fn readiness(&self, record: &DeliveryRecord, now: DateTime<Utc>) -> Readiness {
        if record.status.is_terminal() {
            return Readiness::Settled(record.status);
        }
        if now > record.expires_at {
            return Readiness::Expire;
        }
        match record.next_attempt_at {
            Some(next) if next > now => Readiness::NotDue(next),
            _ => Readiness::Attempt,
        }
    }

    pub fn record_success(
        &self,
        mut record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> (DeliveryRecord, DeliveryAttempt) {
        let from_status = record.status;
        record.attempts += 1;
        record.first_attempt_at.get_or_insert(now);
        record.last_attempt_at = Some(now);
        record.delivered_at = Some(now);
        record.next_attempt_at = None;
        record.error_message = None;
        record.status = DeliveryStatus::Delivered;

        let attempt = attempt_entry(&record, from_status, None, now);
        (record, attempt)
    }

    /// Applies a failed attempt. Linear backoff: the next attempt waits
    /// `retry_delay_seconds * attempts`. A retry scheduled past the deadline stays RETRYING
    /// and is expired once `now > expires_at`.
    pub fn record_failure(
        &self,
        mut record: DeliveryRecord,
        error: &TransportError,
        now: DateTime<Utc>,
    ) -> (DeliveryRecord, DeliveryAttempt) {
        let from_status = record.status;
        record.attempts += 1;
        record.first_attempt_at.get_or_insert(now);
        record.last_attempt_at = Some(now);
        record.error_message = Some(error.to_string());

        let next_attempt_at =
            now + Duration::seconds(self.policy.retry_delay_seconds * i64::from(record.attempts));
        record.status = if error.is_permanent() || record.attempts >= record.max_attempts {
            DeliveryStatus::Failed
        } else if now > record.expires_at {
            DeliveryStatus::Expired
        } else {
            DeliveryStatus::Retrying
        };
        record.next_attempt_at =
            (record.status == DeliveryStatus::Retrying).then_some(next_attempt_at);

        let attempt = attempt_entry(&record, from_status, record.error_message.clone(), now);
        (record, attempt)
    }

    pub fn expire(
        &self,
        mut record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> (DeliveryRecord, DeliveryAttempt) {
        let from_status = record.status;
        record.status = DeliveryStatus::Expired;
        record.next_attempt_at = None;
        let reason = format!("delivery deadline {} passed", record.expires_at.to_rfc3339());
        record.error_message = Some(reason.clone());
        let attempt = attempt_entry(&record, from_status, Some(reason), now);
        (record, attempt)
    }
}

fn attempt_entry(
    record: &DeliveryRecord,
    from_status: DeliveryStatus,
    error_message: Option<String>,
    now: DateTime<Utc>,
) -> DeliveryAttempt {
    DeliveryAttempt {
        request_id: record.request_id.clone(),
        attempt: record.attempts,
        from_status,
        to_status: record.status,
        error_message,
        occurred_at: now,
    }
}

/// Result of one `deliver` call; `attempt` is `None` when nothing changed.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryReport {
    pub record: DeliveryRecord,
    pub attempt: Option<DeliveryAttempt>,
}

/// Routes records to integration transports and applies the engine's rules to each outcome.
#[derive(Clone, Default)]
pub struct DeliveryManager {
    engine: DeliveryEngine,
    transports: HashMap<IntegrationType, Arc<dyn DeliveryTransport>>,
    fallback: Option<Arc<dyn DeliveryTransport>>,
}

impl DeliveryManager {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self { engine: DeliveryEngine::new(policy), transports: HashMap::new(), fallback: None }
    }

    pub fn with_transport(
        mut self,
        integration: IntegrationType,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        self.transports.insert(integration, transport);
        self
    }

    /// Transport for integrations without a dedicated one.
    pub fn with_fallback(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.fallback = Some(transport);
        self
    }

    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    pub fn transport_for(
        &self,
        integration: IntegrationType,
    ) -> Option<&Arc<dyn DeliveryTransport>> {
        self.transports.get(&integration).or(self.fallback.as_ref())
    }

    /// Makes at most one attempt. Records already DELIVERED (or otherwise settled) are returned
    /// untouched without calling the transport.
    pub async fn deliver(&self, record: DeliveryRecord) -> DeliveryReport {
        self.deliver_at(record, Utc::now()).await
    }

    pub async fn deliver_at(&self, record: DeliveryRecord, now: DateTime<Utc>) -> DeliveryReport {
        match self.engine.readiness(&record, now) {
            Readiness::Settled(status) => {
                debug!(
                    event_name = "delivery.attempt.skipped",
                    request_id = %record.request_id,
                    status = status.as_str(),
                    "delivery already settled"
                );
                return DeliveryReport { record, attempt: None };
            }
            Readiness::NotDue(_) => return DeliveryReport { record, attempt: None },
            Readiness::Expire => {
                let (record, attempt) = self.engine.expire(record, now);
                warn!(
                    event_name = "delivery.expired",
                    request_id = %record.request_id,
                    attempts = record.attempts,
                    "delivery deadline passed before success"
                );
                return DeliveryReport { record, attempt: Some(attempt) };
            }
            Readiness::Attempt => {}
        }

        let timeout = self.engine.policy.timeout;
        let result = match self.transport_for(record.integration_type) {
            Some(transport) => tokio::time::timeout(timeout, transport.send(&record))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout))),
            None => Err(TransportError::NotConfigured(record.integration_type.to_string())),
        };

        let (record, attempt) = match result {
            Ok(()) => {
                let (record, attempt) = self.engine.record_success(record, now);
                info!(
                    event_name = "delivery.attempt.succeeded",
                    request_id = %record.request_id,
                    session_id = %record.session_id,
                    integration_type = record.integration_type.as_str(),
                    attempt = record.attempts,
                    "response delivered"
                );
                (record, attempt)
            }
            Err(transport_error) => {
                let (record, attempt) = self.engine.record_failure(record, &transport_error, now);
                if record.status.is_terminal() {
                    error!(
                        event_name = "delivery.attempt.exhausted",
                        request_id = %record.request_id,
                        session_id = %record.session_id,
                        status = record.status.as_str(),
                        attempt = record.attempts,
                        error = %transport_error,
                        "delivery permanently failed"
                    );
                } else {
                    warn!(
                        event_name = "delivery.attempt.failed",
                        request_id = %record.request_id,
                        attempt = record.attempts,
                        max_attempts = record.max_attempts,
                        error = %transport_error,
                        "delivery attempt failed; retry scheduled"
                    );
                }
                (record, attempt)
            }
        };

        DeliveryReport { record, attempt: Some(attempt) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::Map;

    use super::{
        content_hash, DeliveryEngine, DeliveryManager, DeliveryPolicy, DeliveryTransport,
        Readiness, TransportError,
    };
    use crate::domain::delivery::{DeliveryRecord, DeliveryStatus};
    use crate::domain::request::{IntegrationType, NormalizedRequest, RequestId};

    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<Vec<Result<(), TransportError>>>,
        sends: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(results: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self { results: Mutex::new(results), sends: AtomicUsize::new(0) })
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, _record: &DeliveryRecord) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().expect("results lock");
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn request() -> NormalizedRequest {
        NormalizedRequest {
            request_id: RequestId("req-1".to_string()),
            session_id: "session-1".to_string(),
            user_id: "U1".to_string(),
            integration_type: IntegrationType::Web,
            content: "hi".to_string(),
            integration_context: Map::new(),
            user_context: Map::new(),
            target_agent_id: None,
            requires_routing: true,
            created_at: Utc::now(),
        }
    }

    fn server_error() -> TransportError {
        TransportError::Status { status: 503, body: "unavailable".to_string() }
    }

    #[test]
    fn new_record_is_pending_and_due_immediately() {
        let engine = DeliveryEngine::default();
        let now = Utc::now();
        let record = engine.create_record(&request(), "hello there", now);

        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 3);
        assert_eq!(record.expires_at, now + Duration::seconds(3600));
        assert_eq!(record.content_hash, content_hash("hello there"));
        assert_eq!(record.content_hash.len(), 64);
        assert_eq!(engine.readiness(&record, now), Readiness::Attempt);
    }

    #[test]
    fn failures_back_off_linearly_then_fail_at_max_attempts() {
        let engine = DeliveryEngine::default();
        let now = Utc::now();
        let record = engine.create_record(&request(), "hello", now);

        let (record, first) = engine.record_failure(record, &server_error(), now);
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.next_attempt_at, Some(now + Duration::seconds(5)));
        assert_eq!(first.from_status, DeliveryStatus::Pending);
        assert_eq!(engine.readiness(&record, now), Readiness::NotDue(now + Duration::seconds(5)));

        let (record, _) = engine.record_failure(record, &server_error(), now);
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.next_attempt_at, Some(now + Duration::seconds(10)));

        let (record, last) = engine.record_failure(record, &server_error(), now);
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, record.max_attempts);
        assert_eq!(record.next_attempt_at, None);
        assert_eq!(last.to_status, DeliveryStatus::Failed);
        assert_eq!(engine.readiness(&record, now), Readiness::Settled(DeliveryStatus::Failed));
    }

    #[test]
    fn retry_scheduled_past_the_deadline_expires_only_once_it_passes() {
        let engine = DeliveryEngine::new(DeliveryPolicy {
            expiry_seconds: 4,
            ..DeliveryPolicy::default()
        });
        let now = Utc::now();
        let record = engine.create_record(&request(), "hello", now);

        let (record, _) = engine.record_failure(record, &server_error(), now);
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.next_attempt_at, Some(now + Duration::seconds(5)));
        assert_eq!(
            engine.readiness(&record, now + Duration::seconds(3)),
            Readiness::NotDue(now + Duration::seconds(5))
        );
        assert_eq!(engine.readiness(&record, now + Duration::seconds(5)), Readiness::Expire);

        let late = now + Duration::seconds(6);
        let (record, _) = engine.record_failure(record, &server_error(), late);
        assert_eq!(record.status, DeliveryStatus::Expired);
        assert_eq!(record.next_attempt_at, None);
    }

    #[test]
    fn missing_transport_fails_without_retrying() {
        let engine = DeliveryEngine::default();
        let now = Utc::now();
        let record = engine.create_record(&request(), "hello", now);

        let (record, _) = engine.record_failure(
            record,
            &TransportError::NotConfigured("WEB".to_string()),
            now,
        );
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn delivered_record_is_never_sent_twice() {
        let transport = ScriptedTransport::new(Vec::new());
        let manager = DeliveryManager::new(DeliveryPolicy::default())
            .with_transport(IntegrationType::Web, transport.clone());
        let record = manager.engine().create_record(&request(), "hello", Utc::now());

        let first = manager.deliver(record).await;
        assert_eq!(first.record.status, DeliveryStatus::Delivered);
        assert!(first.record.delivered_at.is_some());

        let second = manager.deliver(first.record.clone()).await;
        assert_eq!(second.record, first.record);
        assert!(second.attempt.is_none());
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn retrying_record_is_delivered_once_due() {
        let transport = ScriptedTransport::new(vec![Err(server_error()), Ok(())]);
        let manager = DeliveryManager::new(DeliveryPolicy::default())
            .with_transport(IntegrationType::Web, transport.clone());
        let now = Utc::now();
        let record = manager.engine().create_record(&request(), "hello", now);

        let failed = manager.deliver_at(record, now).await;
        assert_eq!(failed.record.status, DeliveryStatus::Retrying);
        assert_eq!(failed.record.error_message.as_deref(), Some(server_error().to_string().as_str()));

        let early = manager.deliver_at(failed.record.clone(), now + Duration::seconds(1)).await;
        assert!(early.attempt.is_none());
        assert_eq!(transport.sends(), 1);

        let due = manager.deliver_at(failed.record, now + Duration::seconds(6)).await;
        assert_eq!(due.record.status, DeliveryStatus::Delivered);
        assert_eq!(due.record.attempts, 2);
        assert_eq!(due.attempt.map(|a| a.from_status), Some(DeliveryStatus::Retrying));
    }

    #[tokio::test]
    async fn overdue_record_is_expired_without_sending() {
        let transport = ScriptedTransport::new(Vec::new());
        let manager = DeliveryManager::new(DeliveryPolicy::default())
            .with_transport(IntegrationType::Web, transport.clone());
        let now = Utc::now();
        let record = manager.engine().create_record(&request(), "hello", now);

        let report = manager.deliver_at(record, now + Duration::hours(2)).await;

        assert_eq!(report.record.status, DeliveryStatus::Expired);
        assert_eq!(transport.sends(), 0);
    }

    #[tokio::test]
    async fn fallback_transport_covers_unmapped_integrations() {
        let transport = ScriptedTransport::new(Vec::new());
        let manager = DeliveryManager::new(DeliveryPolicy::default()).with_fallback(transport.clone());
        let record = manager.engine().create_record(&request(), "hello", Utc::now());

        let report = manager.deliver(record).await;

        assert_eq!(report.record.status, DeliveryStatus::Delivered);
        assert_eq!(transport.sends(), 1);
    }
}
