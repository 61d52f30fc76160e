//! HTTP surface: one ingestion route per integration plus read-only inspection routes.
//!
//! Ingestion never waits for an agent. A request is normalized, stored, announced as
//! `REQUEST_CREATED` and answered with `202 Accepted`; the workers take it from there.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use relaydesk_core::domain::conversation::{ConversationQuery, ConversationSummary};
use relaydesk_core::domain::delivery::{DeliveryAttempt, DeliveryRecord};
use relaydesk_core::domain::request::{IntegrationType, NormalizedRequest, RequestId};
use relaydesk_core::domain::session::{Session, SessionId, SessionStatus};
use relaydesk_core::errors::{ApplicationError, DomainError};
use relaydesk_core::events::{CloudEvent, EventBus, REQUEST_CREATED};
use relaydesk_core::normalizer::{
    CliRequest, GenericRequest, Normalizer, RawRequest, SlackRequest, ToolRequest, WebRequest,
};
use relaydesk_db::{
    ConversationRepository, DeliveryRepository, ProcessedEventRepository, RequestRepository,
    SessionRepository,
};
use relaydesk_slack::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use relaydesk_slack::{
    is_events_api_payload, parse_envelope_value, SignatureVerifier, SlackEvent,
};

use crate::delivery::{DeliveryError, DeliveryService};
use crate::error::ApiError;

const SLACK_INGRESS: &str = "slack-ingress";

#[derive(Clone)]
pub struct ApiState {
    pub normalizer: Arc<Normalizer>,
    pub events: Arc<dyn EventBus>,
    pub sessions: Arc<dyn SessionRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub deliveries: Arc<dyn DeliveryRepository>,
    pub processed: Arc<dyn ProcessedEventRepository>,
    pub delivery: Arc<DeliveryService>,
    /// Unset means Slack signatures are not checked.
    pub slack_verifier: Option<Arc<SignatureVerifier>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/requests/slack", post(ingest_slack))
        .route("/requests/web", post(ingest_web))
        .route("/requests/cli", post(ingest_cli))
        .route("/requests/tool", post(ingest_tool))
        .route("/requests/generic", post(ingest_generic))
        .route("/requests/{request_id}", get(request_status))
        .route("/requests/{request_id}/redeliver", post(redeliver))
        .route("/sessions/{session_id}", get(session_view))
        .route("/conversations", get(search_conversations))
        .with_state(state)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub request_id: RequestId,
    pub session_id: String,
    pub status: &'static str,
    pub message: String,
}

async fn ingest_slack(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = new_correlation_id();
    if let Some(verifier) = &state.slack_verifier {
        verifier
            .verify(header(&headers, TIMESTAMP_HEADER), header(&headers, SIGNATURE_HEADER), &body)
            .map_err(|error| ApiError::unauthorized(error.to_string(), &correlation_id))?;
    }

    let payload: Value = decode(&body, IntegrationType::Slack, &correlation_id)?;
    if !is_events_api_payload(&payload) {
        let request: SlackRequest = serde_json::from_value(payload).map_err(|error| {
            ApiError::bad_request(format!("invalid SLACK payload: {error}"), &correlation_id)
        })?;
        return accept(&state, RawRequest::Slack(request), correlation_id).await;
    }

    let envelope = parse_envelope_value(payload)
        .map_err(|error| ApiError::bad_request(error.to_string(), &correlation_id))?;
    match envelope.event {
        SlackEvent::UrlVerification { challenge } => {
            Ok(Json(json!({ "challenge": challenge })).into_response())
        }
        SlackEvent::Ignored { event_type, reason } => {
            debug!(
                event_name = "ingress.slack.ignored",
                correlation_id = %correlation_id,
                slack_event_type = %event_type,
                reason = reason,
                "slack event ignored"
            );
            Ok(Json(json!({ "status": "ignored", "reason": reason })).into_response())
        }
        SlackEvent::Message(message) => {
            if let Some(event_id) = &envelope.event_id {
                let first = state
                    .processed
                    .mark_processed(event_id, SLACK_INGRESS)
                    .await
                    .map_err(|error| ApiError::persistence(error, &correlation_id))?;
                if !first {
                    debug!(
                        event_name = "ingress.slack.duplicate",
                        correlation_id = %correlation_id,
                        slack_event_id = %event_id,
                        "slack retried an event that was already accepted"
                    );
                    return Ok(Json(json!({ "status": "duplicate" })).into_response());
                }
            }
            let team_id = envelope.team_id.unwrap_or_default();
            let request = message.into_request(&team_id);
            let accepted =
                accept(&state, RawRequest::Slack(request), correlation_id.clone()).await;
            if let (Err(_), Some(event_id)) = (&accepted, &envelope.event_id) {
                // unmark so Slack's retry is accepted instead of acknowledged as a duplicate
                if let Err(error) = state.processed.forget(event_id, SLACK_INGRESS).await {
                    warn!(
                        event_name = "ingress.slack.unmark_failed",
                        correlation_id = %correlation_id,
                        slack_event_id = %event_id,
                        error = %error,
                        "failed slack event stays marked as processed"
                    );
                }
            }
            accepted
        }
    }
}

async fn ingest_web(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let correlation_id = new_correlation_id();
    let request: WebRequest = decode(&body, IntegrationType::Web, &correlation_id)?;
    accept(&state, RawRequest::Web(request), correlation_id).await
}

async fn ingest_cli(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let correlation_id = new_correlation_id();
    let request: CliRequest = decode(&body, IntegrationType::Cli, &correlation_id)?;
    accept(&state, RawRequest::Cli(request), correlation_id).await
}

async fn ingest_tool(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let correlation_id = new_correlation_id();
    let request: ToolRequest = decode(&body, IntegrationType::Tool, &correlation_id)?;
    accept(&state, RawRequest::Tool(request), correlation_id).await
}

async fn ingest_generic(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = new_correlation_id();
    let request: GenericRequest = serde_json::from_slice(&body).map_err(|error| {
        ApiError::bad_request(format!("invalid generic payload: {error}"), &correlation_id)
    })?;
    accept(&state, RawRequest::Generic(request), correlation_id).await
}

/// Normalizes, stores and announces one request.
async fn accept(
    state: &ApiState,
    raw: RawRequest,
    correlation_id: String,
) -> Result<Response, ApiError> {
    let integration_type = raw.integration_type();
    let mut request = state.normalizer.normalize(raw, SessionId::generate().0).map_err(|error| {
        ApiError::from_application(
            ApplicationError::Domain(DomainError::from(error)),
            &correlation_id,
        )
    })?;

    let active = state
        .sessions
        .find_active_by_user(&request.user_id)
        .await
        .map_err(|error| ApiError::persistence(error, &correlation_id))?;
    if let Some(session) = active {
        request.session_id = session.session_id.0;
    }

    state
        .requests
        .save(&request)
        .await
        .map_err(|error| ApiError::persistence(error, &correlation_id))?;

    let data = serde_json::to_value(&request).map_err(|error| {
        let error = ApplicationError::Integration(error.to_string());
        ApiError::from_application(error, &correlation_id)
    })?;
    let source = format!("/requests/{}", integration_type.as_str().to_ascii_lowercase());
    let event = CloudEvent::new(REQUEST_CREATED, source, data)
        .with_subject(request.session_id.clone())
        .with_extension("integrationtype", integration_type.as_str())
        .with_extension("userid", request.user_id.clone());
    state
        .events
        .publish(event)
        .await
        .map_err(|error| ApiError::event_bus(error, &correlation_id))?;

    info!(
        event_name = "ingress.request.accepted",
        correlation_id = %correlation_id,
        request_id = %request.request_id,
        session_id = %request.session_id,
        integration_type = integration_type.as_str(),
        routed = request.requires_routing,
        "request accepted"
    );

    let accepted = Accepted {
        request_id: request.request_id,
        session_id: request.session_id,
        status: "accepted",
        message: "Request accepted for processing".to_owned(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub user_id: String,
    pub current_agent_name: String,
    pub current_state: Option<String>,
    pub email: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub status: SessionStatus,
    pub pending_reset: bool,
    pub usage: UsageView,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct UsageView {
    pub turns: u32,
    pub completion_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        let usage = session.usage;
        Self {
            current_state: session
                .state_machine_snapshot
                .map(|snapshot| snapshot.current_state),
            session_id: session.session_id,
            user_id: session.user_id,
            current_agent_name: session.current_agent_name,
            email: session.email,
            integration_type: session.integration_type,
            status: session.status,
            pending_reset: session.pending_reset,
            usage: UsageView {
                turns: usage.turns,
                completion_calls: usage.completion_calls,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens(),
            },
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

async fn session_view(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let correlation_id = new_correlation_id();
    let session = state
        .sessions
        .find_by_id(&SessionId(session_id.clone()))
        .await
        .map_err(|error| ApiError::persistence(error, &correlation_id))?
        .ok_or_else(|| ApiError::not_found("session", session_id, &correlation_id))?;
    Ok(Json(SessionView::from(session)))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestStatusView {
    pub request_id: RequestId,
    pub session_id: String,
    /// Delivery status, or `PROCESSING` while the agent has not answered yet.
    pub status: String,
    pub delivery: Option<DeliveryRecord>,
    pub attempts: Vec<DeliveryAttempt>,
}

async fn request_status(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusView>, ApiError> {
    let correlation_id = new_correlation_id();
    let request_id = RequestId(request_id);
    let persistence = |error| ApiError::persistence(error, &correlation_id);

    let record = state.deliveries.find_by_request(&request_id).await.map_err(persistence)?;
    if let Some(record) = record {
        let attempts = state.deliveries.list_attempts(&request_id).await.map_err(persistence)?;
        return Ok(Json(RequestStatusView {
            request_id,
            session_id: record.session_id.clone(),
            status: record.status.as_str().to_owned(),
            delivery: Some(record),
            attempts,
        }));
    }

    let request: NormalizedRequest = state
        .requests
        .find_by_id(&request_id)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::not_found("request", request_id.0.clone(), &correlation_id))?;
    Ok(Json(RequestStatusView {
        request_id,
        session_id: request.session_id,
        status: "PROCESSING".to_owned(),
        delivery: None,
        attempts: Vec::new(),
    }))
}

/// Makes one more attempt for a reply that is still pending; settled records come back as-is.
async fn redeliver(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusView>, ApiError> {
    let correlation_id = new_correlation_id();
    let request_id = RequestId(request_id);
    let record = state.delivery.redeliver(&request_id).await.map_err(|error| match error {
        DeliveryError::NotFound(id) => ApiError::not_found("delivery", id.0, &correlation_id),
        DeliveryError::Repository(error) => ApiError::persistence(error, &correlation_id),
    })?;
    let attempts = state
        .deliveries
        .list_attempts(&request_id)
        .await
        .map_err(|error| ApiError::persistence(error, &correlation_id))?;
    Ok(Json(RequestStatusView {
        request_id,
        session_id: record.session_id.clone(),
        status: record.status.as_str().to_owned(),
        delivery: Some(record),
        attempts,
    }))
}

/// Raw `GET /conversations` parameters; validated into a [`ConversationQuery`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConversationParams {
    pub session_id: Option<String>,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
    /// Comma-separated, e.g. `SLACK,WEB`.
    pub integration_type: Option<String>,
    pub agent_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub random_sample: Option<String>,
    pub include_messages: Option<String>,
    pub limit: Option<String>,
}

impl ConversationParams {
    pub fn into_query(self) -> Result<ConversationQuery, String> {
        let integration_types = match self.integration_type.as_deref() {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| {
                    IntegrationType::parse(item)
                        .ok_or_else(|| format!("unknown integration_type `{item}`"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let limit = self
            .limit
            .as_deref()
            .map(|value| {
                value.trim().parse::<u32>().map_err(|_| format!("invalid limit `{value}`"))
            })
            .transpose()?;

        Ok(ConversationQuery {
            session_id: non_empty(self.session_id),
            user_email: non_empty(self.user_email),
            user_id: non_empty(self.user_id),
            integration_types,
            agent_id: non_empty(self.agent_id),
            start_date: parse_date(self.start_date.as_deref(), "start_date", false)?,
            end_date: parse_date(self.end_date.as_deref(), "end_date", true)?,
            random_sample: parse_flag(self.random_sample.as_deref(), "random_sample")?,
            include_messages: parse_flag(self.include_messages.as_deref(), "include_messages")?,
            limit,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationPage {
    pub count: usize,
    pub limit: u32,
    pub conversations: Vec<ConversationSummary>,
}

async fn search_conversations(
    State(state): State<ApiState>,
    Query(params): Query<ConversationParams>,
) -> Result<Json<ConversationPage>, ApiError> {
    let correlation_id = new_correlation_id();
    let query =
        params.into_query().map_err(|message| ApiError::bad_request(message, &correlation_id))?;
    let conversations = state
        .conversations
        .search(&query)
        .await
        .map_err(|error| ApiError::persistence(error, &correlation_id))?;
    Ok(Json(ConversationPage {
        count: conversations.len(),
        limit: query.effective_limit(),
        conversations,
    }))
}

fn decode<T: DeserializeOwned>(
    body: &[u8],
    integration: IntegrationType,
    correlation_id: &str,
) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|error| {
        ApiError::bad_request(format!("invalid {integration} payload: {error}"), correlation_id)
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
}

fn parse_flag(value: Option<&str>, name: &str) -> Result<bool, String> {
    match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(format!("invalid {name} `{other}` (expected true|false)")),
    }
}

/// Accepts RFC 3339 timestamps or plain dates; a plain end date covers its whole day.
fn parse_date(
    value: Option<&str>,
    name: &str,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, String> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(timestamp.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("invalid {name} `{value}` (expected RFC 3339 or YYYY-MM-DD)"))?;
    let time = if end_of_day { date.and_hms_opt(23, 59, 59) } else { date.and_hms_opt(0, 0, 0) };
    Ok(time.map(|time| time.and_utc()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use chrono::{TimeZone, Utc};
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use relaydesk_core::delivery::DeliveryManager;
    use relaydesk_core::domain::conversation::ConversationEntry;
    use relaydesk_core::domain::request::IntegrationType;
    use relaydesk_core::domain::session::Session;
    use relaydesk_core::events::{
        CloudEvent, EventBus, EventBusError, EventFilter, InMemoryEventBus, Subscription,
        REQUEST_CREATED,
    };
    use relaydesk_core::flows::Role;
    use relaydesk_core::normalizer::{BaseRequest, Normalizer, RawRequest, WebRequest};
    use relaydesk_db::repositories::{
        InMemoryConversationRepository, InMemoryDeliveryRepository,
        InMemoryProcessedEventRepository, InMemoryRequestRepository, InMemorySessionRepository,
    };
    use relaydesk_db::{ConversationRepository, SessionRepository};
    use relaydesk_slack::SignatureVerifier;

    use super::{router, ApiState, ConversationParams};
    use crate::delivery::{DeliveryService, InlineTransport};

    struct Harness {
        state: ApiState,
        bus: Arc<InMemoryEventBus>,
        sessions: Arc<InMemorySessionRepository>,
        conversations: Arc<InMemoryConversationRepository>,
    }

    fn harness(slack_secret: Option<&str>) -> Harness {
        let bus = Arc::new(InMemoryEventBus::default());
        let sessions = Arc::new(InMemorySessionRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let deliveries = Arc::new(InMemoryDeliveryRepository::default());
        let manager = DeliveryManager::default().with_fallback(Arc::new(InlineTransport));
        let state = ApiState {
            normalizer: Arc::new(Normalizer::default()),
            events: bus.clone(),
            sessions: sessions.clone(),
            conversations: conversations.clone(),
            requests: Arc::new(InMemoryRequestRepository::default()),
            deliveries: deliveries.clone(),
            processed: Arc::new(InMemoryProcessedEventRepository::default()),
            delivery: Arc::new(DeliveryService::new(manager, deliveries)),
            slack_verifier: slack_secret.map(|secret| {
                Arc::new(SignatureVerifier::new(SecretString::from(secret.to_owned())))
            }),
        };
        Harness { state, bus, sessions, conversations }
    }

    /// Refuses the first publish, then forwards to an in-memory bus.
    #[derive(Default)]
    struct FailOnceBus {
        failed: AtomicBool,
        inner: InMemoryEventBus,
    }

    #[async_trait]
    impl EventBus for FailOnceBus {
        async fn publish(&self, event: CloudEvent) -> Result<(), EventBusError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }
            self.inner.publish(event).await
        }

        fn subscribe(&self, filter: EventFilter) -> Subscription {
            self.inner.subscribe(filter)
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn web_request_is_accepted_stored_and_announced() {
        let harness = harness(None);
        let mut created = harness.bus.subscribe(EventFilter::for_type(REQUEST_CREATED));
        let app = router(harness.state.clone());

        let (status, body) = send(
            app.clone(),
            post(
                "/requests/web",
                json!({
                    "user_id": "u-1",
                    "content": "my laptop is slow",
                    "callback_url": "https://hooks.example.com/reply"
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        let request_id = body["request_id"].as_str().expect("request id").to_owned();

        let event = created.next().await.expect("request event");
        assert_eq!(event.extension("integrationtype"), Some("WEB"));
        assert_eq!(event.extension("userid"), Some("u-1"));
        assert_eq!(event.source, "/requests/web");
        assert_eq!(event.data["request_id"], request_id.as_str());
        assert_eq!(
            event.data["integration_context"]["callback_url"],
            "https://hooks.example.com/reply"
        );

        let (status, body) = send(app, get(&format!("/requests/{request_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PROCESSING");
        assert!(body["delivery"].is_null());
    }

    #[tokio::test]
    async fn request_joins_the_users_active_session() {
        let harness = harness(None);
        let session = Session::open("u-7", "routing-agent", None);
        harness.sessions.save(&session).await.expect("save session");

        let (status, body) = send(
            router(harness.state),
            post(
                "/requests/cli",
                json!({ "user_id": "u-7", "content": "hello", "cli_session_id": "tty-1" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["session_id"], session.session_id.0.as_str());
    }

    #[tokio::test]
    async fn missing_required_fields_are_rejected_without_an_event() {
        let app = router(harness(None).state);

        let (status, body) = send(
            app.clone(),
            post("/requests/tool", json!({ "user_id": "u-1", "content": "run it" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        assert!(body["detail"].as_str().unwrap_or_default().contains("tool_id"));

        let (status, _) = send(app, post("/requests/web", json!(["not", "an", "object"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn slack_url_verification_echoes_the_challenge() {
        let harness = harness(None);
        let (status, body) = send(
            router(harness.state),
            post("/requests/slack", json!({ "type": "url_verification", "challenge": "abc123" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["challenge"], "abc123");
    }

    #[tokio::test]
    async fn slack_events_require_a_valid_signature_when_configured() {
        let harness = harness(Some("signing-secret"));
        let app = router(harness.state);
        let payload = json!({
            "type": "event_callback",
            "team_id": "T1",
            "event_id": "Ev1",
            "event": {
                "type": "message",
                "channel": "D1",
                "channel_type": "im",
                "user": "U1",
                "text": "reset my password",
                "ts": "1700000000.000100"
            }
        })
        .to_string();

        let unsigned = Request::builder()
            .method("POST")
            .uri("/requests/slack")
            .body(Body::from(payload.clone()))
            .expect("request");
        let (status, body) = send(app.clone(), unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let timestamp = Utc::now().timestamp().to_string();
        let signature = SignatureVerifier::new(SecretString::from("signing-secret".to_owned()))
            .sign(&timestamp, payload.as_bytes())
            .expect("sign");
        let signed = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/requests/slack")
                .header("x-slack-request-timestamp", timestamp.as_str())
                .header("x-slack-signature", signature.as_str())
                .body(Body::from(body))
                .expect("request")
        };

        let (status, body) = send(app.clone(), signed(payload.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");

        let (status, body) = send(app, signed(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");
    }

    #[tokio::test]
    async fn slack_retry_after_a_failed_publish_is_accepted() {
        let bus = Arc::new(FailOnceBus::default());
        let mut created = bus.subscribe(EventFilter::for_type(REQUEST_CREATED));
        let mut state = harness(None).state;
        state.events = bus;
        let app = router(state);
        let payload = json!({
            "type": "event_callback",
            "team_id": "T1",
            "event_id": "Ev7",
            "event": {
                "type": "message",
                "channel": "D1",
                "channel_type": "im",
                "user": "U1",
                "text": "my badge stopped working",
                "ts": "1700000000.000200"
            }
        });

        let (status, body) = send(app.clone(), post("/requests/slack", payload.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service_unavailable");

        let (status, body) = send(app.clone(), post("/requests/slack", payload.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        let event = created.next().await.expect("request event");
        assert_eq!(event.data["content"], "my badge stopped working");

        let (status, body) = send(app, post("/requests/slack", payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");
    }

    #[tokio::test]
    async fn bot_messages_are_acknowledged_and_ignored() {
        let harness = harness(None);
        let (status, body) = send(
            router(harness.state),
            post(
                "/requests/slack",
                json!({
                    "type": "event_callback",
                    "team_id": "T1",
                    "event": {
                        "type": "message",
                        "channel": "D1",
                        "bot_id": "B1",
                        "text": "I am a bot",
                        "ts": "1700000000.000200"
                    }
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
    }

    #[tokio::test]
    async fn session_view_reports_usage_and_unknown_ids_are_not_found() {
        let harness = harness(None);
        let email = Some("u3@example.com".to_owned());
        let mut session = Session::open("u-3", "email-change-agent", email);
        session.usage.turns = 2;
        session.usage.prompt_tokens = 120;
        session.usage.completion_tokens = 30;
        harness.sessions.save(&session).await.expect("save session");
        let app = router(harness.state);

        let (status, body) =
            send(app.clone(), get(&format!("/sessions/{}", session.session_id.0))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_agent_name"], "email-change-agent");
        assert_eq!(body["usage"]["total_tokens"], 150);
        assert_eq!(body["status"], "active");

        let (status, body) = send(app, get("/sessions/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn conversations_are_filtered_by_integration_type() {
        let harness = harness(None);
        let sessions = [("s-1", IntegrationType::Slack), ("s-2", IntegrationType::Web)];
        for (session_id, integration) in sessions {
            harness
                .conversations
                .append(ConversationEntry {
                    session_id: session_id.to_owned(),
                    user_id: "u-1".to_owned(),
                    user_email: None,
                    integration_type: Some(integration),
                    agent_name: "routing-agent".to_owned(),
                    role: Role::User,
                    content: "hi".to_owned(),
                    request_id: None,
                    created_at: Utc::now(),
                })
                .await
                .expect("append");
        }
        let app = router(harness.state);

        let (status, body) =
            send(app.clone(), get("/conversations?integration_type=web&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["conversations"][0]["session_id"], "s-2");

        let (status, _) = send(app, get("/conversations?integration_type=FAX")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn redelivery_leaves_settled_records_alone() {
        let harness = harness(None);
        let request = Normalizer::default()
            .normalize(
                RawRequest::Web(WebRequest {
                    base: BaseRequest {
                        user_id: "u-9".into(),
                        content: "status?".into(),
                        ..BaseRequest::default()
                    },
                    ..WebRequest::default()
                }),
                "s-9",
            )
            .expect("valid request");
        let record =
            harness.state.delivery.accept(&request, "All done.").await.expect("delivery stored");
        assert_eq!(record.status.as_str(), "DELIVERED");
        let app = router(harness.state);

        let uri = format!("/requests/{}/redeliver", request.request_id);
        let (status, body) = send(app.clone(), post(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "DELIVERED");
        assert_eq!(body["attempts"].as_array().map(Vec::len), Some(1));

        let (status, _) = send(app, post("/requests/nope/redeliver", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn plain_dates_cover_whole_days() {
        let query = ConversationParams {
            start_date: Some("2026-03-01".into()),
            end_date: Some("2026-03-02".into()),
            include_messages: Some("true".into()),
            ..ConversationParams::default()
        }
        .into_query()
        .expect("valid query");

        assert_eq!(query.start_date, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single());
        assert_eq!(query.end_date, Utc.with_ymd_and_hms(2026, 3, 2, 23, 59, 59).single());
        assert!(query.include_messages);
        assert!(!query.random_sample);

        let invalid =
            ConversationParams { random_sample: Some("maybe".into()), ..Default::default() };
        assert!(invalid.into_query().is_err());
    }
}
