//! Delivery service: persists delivery records, runs attempts through the
//! [`DeliveryManager`], and sweeps due retries in the background.
//!
//! Transports for non-Slack channels:
//! - `WebhookTransport` posts the reply to the request's `callback_url`, else to the webhook
//!   configured for its integration, else hands the record to its fallback
//! - `InlineTransport` settles the record immediately; the reply is read back with
//!   `GET /requests/{request_id}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use relaydesk_core::delivery::{
    DeliveryManager, DeliveryTransport, Readiness, TransportError,
};
use relaydesk_core::domain::delivery::DeliveryRecord;
use relaydesk_core::domain::request::{NormalizedRequest, RequestId};
use relaydesk_db::{DeliveryRepository, RepositoryError};

const SWEEP_BATCH: u32 = 50;
const LEASE_GRACE_SECONDS: i64 = 5;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no delivery record exists for request `{0}`")]
    NotFound(RequestId),
}

pub struct DeliveryService {
    manager: DeliveryManager,
    deliveries: Arc<dyn DeliveryRepository>,
    lease: ChronoDuration,
}

impl DeliveryService {
    pub fn new(manager: DeliveryManager, deliveries: Arc<dyn DeliveryRepository>) -> Self {
        // A lease outlives the transport timeout so only a crashed attempt lets it lapse.
        let timeout = manager.engine().policy().timeout;
        let lease = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::seconds(30))
            + ChronoDuration::seconds(LEASE_GRACE_SECONDS);
        Self { manager, deliveries, lease }
    }

    /// Records the reply for `request` and makes the first attempt.
    ///
    /// A second call for the same request id returns the stored record untouched, so an event
    /// redelivered by the bus never sends the reply twice.
    pub async fn accept(
        &self,
        request: &NormalizedRequest,
        content: &str,
    ) -> Result<DeliveryRecord, DeliveryError> {
        let record = self.manager.engine().create_record(request, content, Utc::now());
        if !self.deliveries.create(&record).await? {
            debug!(
                event_name = "delivery.record.duplicate",
                request_id = %request.request_id,
                "delivery record already exists"
            );
            return self.stored(&request.request_id).await;
        }
        info!(
            event_name = "delivery.record.created",
            request_id = %record.request_id,
            session_id = %record.session_id,
            integration_type = record.integration_type.as_str(),
            "delivery record created"
        );
        match self.attempt_at(record, Utc::now()).await? {
            Some(record) => Ok(record),
            None => self.stored(&request.request_id).await,
        }
    }

    /// Makes one attempt for an existing record if it is due and no other attempt holds it.
    pub async fn redeliver(&self, request_id: &RequestId) -> Result<DeliveryRecord, DeliveryError> {
        let record = self.stored(request_id).await?;
        match self.attempt_at(record, Utc::now()).await? {
            Some(record) => Ok(record),
            None => self.stored(request_id).await,
        }
    }

    /// Attempts every due record; overdue ones are expired. Returns how many were attempted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, DeliveryError> {
        let due = self.deliveries.list_due(now, SWEEP_BATCH).await?;
        let mut count = 0;
        for record in due {
            if self.attempt_at(record, now).await?.is_some() {
                count += 1;
            }
        }
        if count > 0 {
            debug!(event_name = "delivery.sweep.completed", records = count, "retry sweep ran");
        }
        Ok(count)
    }

    async fn stored(&self, request_id: &RequestId) -> Result<DeliveryRecord, DeliveryError> {
        self.deliveries
            .find_by_request(request_id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(request_id.clone()))
    }

    /// Claims the record's attempt lease, then runs one attempt on the claimed copy.
    ///
    /// Returns `None` when the record is settled, not yet due, or already being attempted.
    async fn attempt_at(
        &self,
        record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, DeliveryError> {
        match self.manager.engine().readiness(&record, now) {
            Readiness::Attempt | Readiness::Expire => {}
            Readiness::NotDue(_) | Readiness::Settled(_) => return Ok(None),
        }
        let Some(claimed) =
            self.deliveries.claim(&record.request_id, now, now + self.lease).await?
        else {
            debug!(
                event_name = "delivery.attempt.in_flight",
                request_id = %record.request_id,
                "record is settled or held by another attempt"
            );
            return Ok(None);
        };
        let report = self.manager.deliver_at(claimed, now).await;
        if let Some(attempt) = &report.attempt {
            self.deliveries.record_attempt(&report.record, attempt).await?;
        }
        Ok(Some(report.record))
    }
}

/// Runs [`DeliveryService::sweep`] every `interval` until `shutdown` flips to true.
pub fn spawn_sweeper(
    service: Arc<DeliveryService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(sweep_error) = service.sweep(Utc::now()).await {
                        error!(
                            event_name = "delivery.sweep.failed",
                            error = %sweep_error,
                            "retry sweep failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(event_name = "delivery.sweep.stopped", "retry sweeper stopped");
    })
}

pub struct WebhookTransport {
    client: Client,
    default_url: Option<String>,
    fallback: Option<Arc<dyn DeliveryTransport>>,
    timeout: Duration,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| TransportError::NotConfigured(error.to_string()))?;
        Ok(Self { client, default_url: None, fallback: None, timeout })
    }

    pub fn with_default_url(mut self, url: Option<String>) -> Self {
        self.default_url = url;
        self
    }

    /// Transport for records that carry no callback and have no configured webhook.
    pub fn with_fallback(mut self, fallback: Arc<dyn DeliveryTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn url_for<'a>(&'a self, record: &'a DeliveryRecord) -> Option<&'a str> {
        record.context_str("callback_url").or(self.default_url.as_deref())
    }
}

#[async_trait]
impl DeliveryTransport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, record: &DeliveryRecord) -> Result<(), TransportError> {
        let Some(url) = self.url_for(record) else {
            return match &self.fallback {
                Some(fallback) => fallback.send(record).await,
                None => Err(TransportError::NotConfigured(format!(
                    "no webhook for {} and no callback_url on request {}",
                    record.integration_type, record.request_id
                ))),
            };
        };

        let payload = json!({
            "request_id": record.request_id,
            "session_id": record.session_id,
            "user_id": record.user_id,
            "integration_type": record.integration_type,
            "content": record.content,
            "content_hash": record.content_hash,
            "attempt": record.attempts + 1,
        });
        let response = self.client.post(url).json(&payload).send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Settles records without sending anything; clients poll for the reply.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineTransport;

#[async_trait]
impl DeliveryTransport for InlineTransport {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn send(&self, record: &DeliveryRecord) -> Result<(), TransportError> {
        debug!(
            event_name = "delivery.inline.held",
            request_id = %record.request_id,
            "reply held for polling"
        );
        Ok(())
    }
}
