//! Event-bus consumers.
//!
//! - request worker: `REQUEST_CREATED` → per-user dispatcher → `RESPONSE_READY`
//! - delivery worker: `RESPONSE_READY` → delivery service
//!
//! Both record each event id in the processed-event ledger before acting on it. The delivery
//! worker drops the mark again when the reply could not be stored, so a redelivered event is
//! handled afresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relaydesk_agent::TurnDispatcher;
use relaydesk_core::domain::request::NormalizedRequest;
use relaydesk_core::events::{
    CloudEvent, EventBus, EventFilter, Subscription, REQUEST_CREATED, RESPONSE_READY,
};
use relaydesk_core::flows::APOLOGY_MESSAGE;
use relaydesk_db::ProcessedEventRepository;

use crate::delivery::DeliveryService;

pub const REQUEST_WORKER: &str = "request-worker";
pub const DELIVERY_WORKER: &str = "delivery-worker";
const EVENT_SOURCE: &str = "/relaydesk/agents";

/// Payload of a `RESPONSE_READY` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseReady {
    /// The originating request, with `session_id` set to the session that served it.
    pub request: NormalizedRequest,
    pub agent_name: Option<String>,
    pub content: String,
}

pub struct RequestWorker {
    dispatcher: Arc<TurnDispatcher>,
    events: Arc<dyn EventBus>,
    processed: Arc<dyn ProcessedEventRepository>,
}

impl RequestWorker {
    pub fn new(
        dispatcher: Arc<TurnDispatcher>,
        events: Arc<dyn EventBus>,
        processed: Arc<dyn ProcessedEventRepository>,
    ) -> Self {
        Self { dispatcher, events, processed }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let subscription = self.events.subscribe(EventFilter::for_type(REQUEST_CREATED));
        let worker = Arc::new(self);
        tokio::spawn(consume(subscription, shutdown, REQUEST_WORKER, move |event| {
            let worker = Arc::clone(&worker);
            async move {
                worker.handle(event).await;
            }
        }))
    }

    /// Queues the turn in event order, then answers it in the background so other users are
    /// not held up. Returns the background task, if one was started.
    pub async fn handle(&self, event: CloudEvent) -> Option<JoinHandle<()>> {
        if !first_delivery(self.processed.as_ref(), &event, REQUEST_WORKER).await {
            return None;
        }
        let request: NormalizedRequest = match serde_json::from_value(event.data.clone()) {
            Ok(request) => request,
            Err(decode_error) => {
                error!(
                    event_name = "worker.request.undecodable",
                    event_id = %event.id,
                    error = %decode_error,
                    "request event payload could not be decoded"
                );
                return None;
            }
        };

        let pending = match self.dispatcher.submit(request.clone()).await {
            Ok(pending) => pending,
            Err(dispatch_error) => {
                self.publish_failure(request, &dispatch_error.to_string()).await;
                return None;
            }
        };

        let events = Arc::clone(&self.events);
        Some(tokio::spawn(async move {
            let response = match pending.wait().await {
                Ok(routed) => {
                    let mut request = request;
                    request.session_id = routed.session_id.0;
                    ResponseReady {
                        request,
                        agent_name: Some(routed.agent_name),
                        content: routed.reply,
                    }
                }
                Err(turn_error) => {
                    error!(
                        event_name = "worker.request.failed",
                        request_id = %request.request_id,
                        user_id = %request.user_id,
                        error = %turn_error,
                        "turn failed; replying with an apology"
                    );
                    ResponseReady {
                        request,
                        agent_name: None,
                        content: APOLOGY_MESSAGE.to_owned(),
                    }
                }
            };
            publish_response(events.as_ref(), response).await;
        }))
    }

    async fn publish_failure(&self, request: NormalizedRequest, reason: &str) {
        error!(
            event_name = "worker.request.failed",
            request_id = %request.request_id,
            user_id = %request.user_id,
            error = %reason,
            "turn could not be queued; replying with an apology"
        );
        let response =
            ResponseReady { request, agent_name: None, content: APOLOGY_MESSAGE.to_owned() };
        publish_response(self.events.as_ref(), response).await;
    }
}

async fn publish_response(events: &dyn EventBus, response: ResponseReady) {
    let request_id = response.request.request_id.clone();
    let data = match serde_json::to_value(&response) {
        Ok(data) => data,
        Err(encode_error) => {
            error!(
                event_name = "worker.response.unencodable",
                request_id = %request_id,
                error = %encode_error,
                "response could not be encoded"
            );
            return;
        }
    };
    let event = CloudEvent::new(RESPONSE_READY, EVENT_SOURCE, data)
        .with_subject(response.request.session_id.clone())
        .with_extension("integrationtype", response.request.integration_type.as_str())
        .with_extension("requestid", request_id.0.clone());

    match events.publish(event).await {
        Ok(()) => info!(
            event_name = "worker.response.ready",
            request_id = %request_id,
            session_id = %response.request.session_id,
            agent = response.agent_name.as_deref().unwrap_or("none"),
            "agent response ready for delivery"
        ),
        Err(publish_error) => error!(
            event_name = "worker.response.publish_failed",
            request_id = %request_id,
            error = %publish_error,
            "response event could not be published"
        ),
    }
}

pub struct DeliveryWorker {
    delivery: Arc<DeliveryService>,
    events: Arc<dyn EventBus>,
    processed: Arc<dyn ProcessedEventRepository>,
}

impl DeliveryWorker {
    pub fn new(
        delivery: Arc<DeliveryService>,
        events: Arc<dyn EventBus>,
        processed: Arc<dyn ProcessedEventRepository>,
    ) -> Self {
        Self { delivery, events, processed }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let subscription = self.events.subscribe(EventFilter::for_type(RESPONSE_READY));
        let worker = Arc::new(self);
        tokio::spawn(consume(subscription, shutdown, DELIVERY_WORKER, move |event| {
            let worker = Arc::clone(&worker);
            async move {
                worker.handle(event).await;
            }
        }))
    }

    /// Stores and sends the reply in its own task, so a slow endpoint holds up only its own
    /// delivery. Returns that task, if one was started.
    pub async fn handle(&self, event: CloudEvent) -> Option<JoinHandle<()>> {
        if !first_delivery(self.processed.as_ref(), &event, DELIVERY_WORKER).await {
            return None;
        }
        let response: ResponseReady = match serde_json::from_value(event.data.clone()) {
            Ok(response) => response,
            Err(decode_error) => {
                error!(
                    event_name = "worker.delivery.undecodable",
                    event_id = %event.id,
                    error = %decode_error,
                    "response event payload could not be decoded"
                );
                return None;
            }
        };

        let delivery = Arc::clone(&self.delivery);
        let processed = Arc::clone(&self.processed);
        Some(tokio::spawn(async move {
            let accepted = delivery.accept(&response.request, &response.content).await;
            if let Err(delivery_error) = accepted {
                error!(
                    event_name = "worker.delivery.failed",
                    request_id = %response.request.request_id,
                    error = %delivery_error,
                    "delivery record could not be stored"
                );
                unmark(processed.as_ref(), &event, DELIVERY_WORKER).await;
            }
        }))
    }
}

async fn first_delivery(
    processed: &dyn ProcessedEventRepository,
    event: &CloudEvent,
    consumer: &str,
) -> bool {
    match processed.mark_processed(&event.id, consumer).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(
                event_name = "worker.event.duplicate",
                event_id = %event.id,
                consumer = consumer,
                "event already processed"
            );
            false
        }
        Err(ledger_error) => {
            // processed anyway; a duplicate is possible
            warn!(
                event_name = "worker.event.ledger_unavailable",
                event_id = %event.id,
                consumer = consumer,
                error = %ledger_error,
                "processed-event ledger unavailable"
            );
            true
        }
    }
}

async fn unmark(processed: &dyn ProcessedEventRepository, event: &CloudEvent, consumer: &str) {
    if let Err(ledger_error) = processed.forget(&event.id, consumer).await {
        warn!(
            event_name = "worker.event.unmark_failed",
            event_id = %event.id,
            consumer = consumer,
            error = %ledger_error,
            "failed event stays marked as processed"
        );
    }
}

async fn consume<F, Fut>(
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    consumer: &'static str,
    handler: F,
) where
    F: Fn(CloudEvent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!(event_name = "worker.started", consumer = consumer, "event consumer started");
    loop {
        tokio::select! {
            next = subscription.next() => match next {
                Some(event) => handler(event).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(event_name = "worker.stopped", consumer = consumer, "event consumer stopped");
}
