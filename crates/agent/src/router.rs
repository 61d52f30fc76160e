//! Per-user session routing.
//!
//! Every user has at most one active session. New sessions start on the routing agent, which
//! either chats or answers with the name of a specialist; naming a specialist hands the session
//! over and the user's message is replayed to it. When a specialist finishes it emits
//! [`TASK_COMPLETE_SENTINEL`], the session is marked for reset, and the user lands back on a
//! fresh routing session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use relaydesk_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use relaydesk_core::domain::conversation::ConversationEntry;
use relaydesk_core::domain::request::{IntegrationType, NormalizedRequest};
use relaydesk_core::domain::session::{Session, SessionId};
use relaydesk_core::events::{CloudEvent, EventBus, SESSION_RESET};
use relaydesk_core::flows::Role;
use relaydesk_db::{ConversationRepository, RepositoryError, SessionRepository};

use crate::registry::AgentRegistry;
use crate::runtime::{AgentRuntime, RuntimeError, TurnOutcome, TASK_COMPLETE_SENTINEL};

/// Input replayed to the routing agent after a reset.
pub const GREETING_INPUT: &str = "hi";

const MAX_HOPS: usize = 6;
const EVENT_SOURCE: &str = "/relaydesk/router";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("routing for user `{user_id}` did not settle after {hops} hops")]
    HopLimit { user_id: String, hops: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutedReply {
    pub session_id: SessionId,
    pub agent_name: String,
    pub reply: String,
}

/// One user message entering the router.
#[derive(Clone, Debug, Default)]
pub struct TurnInput {
    pub user_id: String,
    pub text: String,
    pub email: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub request_id: Option<String>,
    /// Agent to bind directly, bypassing the routing agent.
    pub target_agent: Option<String>,
}

impl TurnInput {
    pub fn message(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), text: text.into(), ..Self::default() }
    }

    pub fn from_request(request: &NormalizedRequest) -> Self {
        Self {
            user_id: request.user_id.clone(),
            text: request.content.clone(),
            email: request.user_email().map(str::to_string),
            integration_type: Some(request.integration_type),
            request_id: Some(request.request_id.0.clone()),
            target_agent: if request.requires_routing {
                None
            } else {
                request.target_agent_id.clone()
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReplySignal {
    ReturnToRouter,
    Handoff(String),
    Plain,
}

pub struct SessionRouter {
    runtime: Arc<AgentRuntime>,
    sessions: Arc<dyn SessionRepository>,
    conversations: Arc<dyn ConversationRepository>,
    audit: Arc<dyn AuditSink>,
    events: Option<Arc<dyn EventBus>>,
}

impl SessionRouter {
    pub fn new(
        runtime: Arc<AgentRuntime>,
        sessions: Arc<dyn SessionRepository>,
        conversations: Arc<dyn ConversationRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { runtime, sessions, conversations, audit, events: None }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.runtime.registry()
    }

    pub async fn handle_user_message(
        &self,
        user_id: &str,
        text: &str,
        email: Option<&str>,
    ) -> Result<String, RouterError> {
        let mut input = TurnInput::message(user_id, text);
        input.email = email.map(str::to_string);
        Ok(self.route(&input).await?.reply)
    }

    pub async fn handle_request(
        &self,
        request: &NormalizedRequest,
    ) -> Result<RoutedReply, RouterError> {
        self.route(&TurnInput::from_request(request)).await
    }

    pub async fn route(&self, input: &TurnInput) -> Result<RoutedReply, RouterError> {
        let registry = self.runtime.registry();
        let mut text = input.text.clone();
        let mut direct_target = input.target_agent.as_deref();
        let mut carried_reply: Option<String> = None;

        for _ in 0..MAX_HOPS {
            let mut session = match self.sessions.find_active_by_user(&input.user_id).await? {
                Some(session) => session,
                None => self.open_session(input).await?,
            };

            if session.pending_reset {
                self.reset(&session, input).await?;
                text = GREETING_INPUT.to_string();
                direct_target = None;
                continue;
            }

            if let Some(target) = direct_target.take() {
                match registry.get(target) {
                    Some(definition) if !session.is_on_agent(&definition.name) => {
                        let from = session.current_agent_name.clone();
                        session.hand_off_to(definition.name.clone());
                        self.emit(input, &session, "router.session.direct_route", &[
                            ("from_agent", from.as_str()),
                            ("to_agent", definition.name.as_str()),
                        ]);
                    }
                    Some(_) => {}
                    None => warn!(
                        event_name = "router.direct_route.unknown_agent",
                        user_id = %input.user_id,
                        target_agent = %target,
                        "direct route names an unknown agent; falling back to the current agent"
                    ),
                }
            }

            let agent_name = session.current_agent_name.clone();
            let snapshot = session.state_machine_snapshot.take();
            let outcome = self.runtime.run_turn(&agent_name, snapshot, &text).await?;
            self.log_exchange(input, &session, &text, &outcome.reply).await?;

            let signal = classify(&outcome.reply, registry, &agent_name);
            debug!(
                event_name = "router.reply.classified",
                user_id = %input.user_id,
                agent = %agent_name,
                signal = ?signal,
                "agent reply classified"
            );
            absorb(&mut session, input, outcome.clone());

            match signal {
                ReplySignal::ReturnToRouter => {
                    session.pending_reset = true;
                    self.sessions.save(&session).await?;
                    self.emit(input, &session, "router.session.task_complete", &[(
                        "agent",
                        agent_name.as_str(),
                    )]);
                    let visible = strip_sentinel(&outcome.reply);
                    if !visible.is_empty() {
                        carried_reply = Some(visible);
                    }
                    text = GREETING_INPUT.to_string();
                }
                ReplySignal::Handoff(target) => {
                    session.hand_off_to(target.clone());
                    self.sessions.save(&session).await?;
                    self.emit(input, &session, "router.session.handoff", &[
                        ("from_agent", agent_name.as_str()),
                        ("to_agent", target.as_str()),
                    ]);
                    info!(
                        event_name = "router.session.handoff",
                        user_id = %input.user_id,
                        session_id = %session.session_id.0,
                        to_agent = %target,
                        "routing agent handed the session to a specialist"
                    );
                }
                ReplySignal::Plain => {
                    self.sessions.save(&session).await?;
                    let reply = match carried_reply {
                        Some(carried) => format!("{carried}\n\n{}", outcome.reply),
                        None => outcome.reply,
                    };
                    return Ok(RoutedReply {
                        session_id: session.session_id,
                        agent_name: session.current_agent_name,
                        reply,
                    });
                }
            }
        }

        warn!(
            event_name = "router.hop_limit",
            user_id = %input.user_id,
            hops = MAX_HOPS,
            "routing did not settle"
        );
        Err(RouterError::HopLimit { user_id: input.user_id.clone(), hops: MAX_HOPS })
    }

    async fn open_session(&self, input: &TurnInput) -> Result<Session, RouterError> {
        let mut session = Session::open(
            input.user_id.clone(),
            self.runtime.registry().routing_agent(),
            input.email.clone(),
        );
        session.integration_type = input.integration_type;
        self.sessions.save(&session).await?;
        self.emit(input, &session, "router.session.created", &[]);
        info!(
            event_name = "router.session.created",
            user_id = %input.user_id,
            session_id = %session.session_id.0,
            agent = %session.current_agent_name,
            "session opened on the routing agent"
        );
        Ok(session)
    }

    async fn reset(&self, session: &Session, input: &TurnInput) -> Result<(), RouterError> {
        self.sessions.close(&session.session_id).await?;
        self.emit(input, session, "router.session.reset", &[(
            "agent",
            session.current_agent_name.as_str(),
        )]);
        info!(
            event_name = "router.session.reset",
            user_id = %input.user_id,
            session_id = %session.session_id.0,
            agent = %session.current_agent_name,
            "session closed; user returns to the routing agent"
        );

        if let Some(events) = &self.events {
            let event = CloudEvent::new(
                SESSION_RESET,
                EVENT_SOURCE,
                json!({
                    "session_id": session.session_id.0,
                    "user_id": session.user_id,
                    "agent_name": session.current_agent_name,
                }),
            )
            .with_subject(session.session_id.0.clone());
            if let Err(error) = events.publish(event).await {
                warn!(
                    event_name = "router.session.reset_event_failed",
                    session_id = %session.session_id.0,
                    error = %error,
                    "failed to publish session reset event"
                );
            }
        }
        Ok(())
    }

    async fn log_exchange(
        &self,
        input: &TurnInput,
        session: &Session,
        text: &str,
        reply: &str,
    ) -> Result<(), RouterError> {
        for (role, content) in [(Role::User, text), (Role::Assistant, reply)] {
            self.conversations
                .append(ConversationEntry {
                    session_id: session.session_id.0.clone(),
                    user_id: session.user_id.clone(),
                    user_email: session.email.clone().or_else(|| input.email.clone()),
                    integration_type: input.integration_type.or(session.integration_type),
                    agent_name: session.current_agent_name.clone(),
                    role,
                    content: content.to_string(),
                    request_id: input.request_id.clone(),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    fn emit(&self, input: &TurnInput, session: &Session, event_type: &str, meta: &[(&str, &str)]) {
        let correlation_id =
            input.request_id.clone().unwrap_or_else(|| session.session_id.0.clone());
        let mut event = AuditEvent::new(
            correlation_id,
            event_type,
            AuditCategory::Routing,
            "router",
            AuditOutcome::Success,
        )
        .for_session(session.session_id.0.clone(), session.user_id.clone());
        for (key, value) in meta {
            event = event.with_metadata(*key, *value);
        }
        self.audit.emit(event);
    }
}

fn absorb(session: &mut Session, input: &TurnInput, outcome: TurnOutcome) {
    session.usage.absorb(outcome.usage);
    session.state_machine_snapshot = Some(outcome.state);
    if session.email.is_none() {
        session.email = input.email.clone();
    }
    if session.integration_type.is_none() {
        session.integration_type = input.integration_type;
    }
    session.updated_at = Utc::now();
}

fn classify(reply: &str, registry: &AgentRegistry, agent_name: &str) -> ReplySignal {
    let token = normalize_reply(reply, registry);
    let on_routing_agent = registry.is_routing_agent(agent_name);

    if token == TASK_COMPLETE_SENTINEL && !on_routing_agent {
        return ReplySignal::ReturnToRouter;
    }
    if on_routing_agent && registry.contains(&token) && !registry.is_routing_agent(&token) {
        return ReplySignal::Handoff(token);
    }
    ReplySignal::Plain
}

/// Reduces an agent reply to the token the router acts on.
///
/// Single-line replies are trimmed and lowercased. Multi-line replies yield the first line that
/// is exactly an agent name (or the completion sentinel); failing that, the last line when the
/// whole reply ends with one. Anything else comes back as the lowercased reply.
pub fn normalize_reply(reply: &str, registry: &AgentRegistry) -> String {
    let normalized = reply.trim().to_lowercase();
    if !normalized.contains('\n') {
        return normalized;
    }

    let is_token = |line: &str| line == TASK_COMPLETE_SENTINEL || registry.contains(line);
    if let Some(line) = normalized.lines().map(str::trim).find(|line| is_token(line)) {
        return line.to_string();
    }

    let ends_with_token = normalized.ends_with(TASK_COMPLETE_SENTINEL)
        || registry.names().iter().any(|name| normalized.ends_with(name));
    match normalized.lines().last() {
        Some(last) if ends_with_token => last.trim().to_string(),
        _ => normalized,
    }
}

fn strip_sentinel(reply: &str) -> String {
    reply
        .lines()
        .filter(|line| !line.trim().eq_ignore_ascii_case(TASK_COMPLETE_SENTINEL))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
