use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relaydesk_agent::{
    AgentRegistry, AgentRuntime, OpenAiCompatibleClient, RegistryError, SessionRouter,
    TurnDispatcher,
};
use relaydesk_core::audit::TracingAuditSink;
use relaydesk_core::completion::{CompletionClient, CompletionError};
use relaydesk_core::config::{AppConfig, ConfigError, LoadOptions};
use relaydesk_core::delivery::{DeliveryManager, DeliveryTransport, TransportError};
use relaydesk_core::domain::request::IntegrationType;
use relaydesk_core::events::{EventBus, InMemoryEventBus};
use relaydesk_core::normalizer::{Normalizer, ToolAgentMap};
use relaydesk_db::repositories::{
    SqlConversationRepository, SqlDeliveryRepository, SqlProcessedEventRepository,
    SqlRequestRepository, SqlSessionRepository,
};
use relaydesk_db::{connect_with_settings, migrations, DbPool, ProcessedEventRepository};
use relaydesk_slack::{SignatureVerifier, SlackTransport};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::delivery::{spawn_sweeper, DeliveryService, InlineTransport, WebhookTransport};
use crate::health::{self, HealthState};
use crate::workers::{DeliveryWorker, RequestWorker};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub events: Arc<dyn EventBus>,
    pub dispatcher: Arc<TurnDispatcher>,
    pub delivery: Arc<DeliveryService>,
    pub processed: Arc<dyn ProcessedEventRepository>,
    pub api: ApiState,
}

impl Application {
    pub fn router(&self) -> Router {
        let health = HealthState::new(self.db_pool.clone())
            .with_dispatcher(Arc::clone(&self.dispatcher));
        api::router(self.api.clone()).merge(health::router(health))
    }

    /// Starts both event consumers and the retry sweeper; all stop when `shutdown` flips.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let sweep_interval = Duration::from_millis(self.config.delivery.sweep_interval_ms);
        vec![
            RequestWorker::new(
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.events),
                Arc::clone(&self.processed),
            )
            .spawn(shutdown.clone()),
            DeliveryWorker::new(
                Arc::clone(&self.delivery),
                Arc::clone(&self.events),
                Arc::clone(&self.processed),
            )
            .spawn(shutdown.clone()),
            spawn_sweeper(Arc::clone(&self.delivery), sweep_interval, shutdown),
        ]
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("completion client could not be built: {0}")]
    Completion(#[source] CompletionError),
    #[error("delivery transport could not be built: {0}")]
    Transport(#[source] TransportError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        agents_dir = %config.agents.config_dir.display(),
        "starting application bootstrap"
    );
    let registry =
        AgentRegistry::load_dir(&config.agents.config_dir, &config.agents.routing_agent)?;
    let client = OpenAiCompatibleClient::from_config(&config.llm)
        .map_err(BootstrapError::Completion)?;
    assemble(config, registry, Arc::new(client)).await
}

/// Connects storage and wires every component around the given registry and completion client.
pub async fn assemble(
    config: AppConfig,
    registry: AgentRegistry,
    client: Arc<dyn CompletionClient>,
) -> Result<Application, BootstrapError> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let sessions = Arc::new(SqlSessionRepository::new(db_pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let requests = Arc::new(SqlRequestRepository::new(db_pool.clone()));
    let deliveries = Arc::new(SqlDeliveryRepository::new(db_pool.clone()));
    let processed: Arc<dyn ProcessedEventRepository> =
        Arc::new(SqlProcessedEventRepository::new(db_pool.clone()));
    let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::default());

    info!(
        event_name = "system.bootstrap.agents_loaded",
        correlation_id = "bootstrap",
        routing_agent = registry.routing_agent(),
        agents = registry.names().len(),
        "agent registry loaded"
    );
    let runtime = AgentRuntime::new(Arc::new(registry), client, config.llm.retry_policy())
        .with_temperature(config.llm.temperature);
    let router = SessionRouter::new(
        Arc::new(runtime),
        sessions.clone(),
        conversations.clone(),
        Arc::new(TracingAuditSink),
    )
    .with_events(Arc::clone(&events));
    let dispatcher = Arc::new(TurnDispatcher::new(Arc::new(router)));

    let manager = delivery_manager(&config)?;
    let delivery = Arc::new(DeliveryService::new(manager, deliveries.clone()));

    let slack_verifier = config
        .slack
        .signing_secret
        .clone()
        .map(|secret| Arc::new(SignatureVerifier::new(secret)));
    if slack_verifier.is_none() {
        warn!(
            event_name = "system.bootstrap.slack_unsigned",
            correlation_id = "bootstrap",
            "slack.signing_secret is unset; slack requests are accepted without verification"
        );
    }

    let api = ApiState {
        normalizer: Arc::new(Normalizer::new(ToolAgentMap::with_overrides(
            &config.agents.tool_mapping,
        ))),
        events: Arc::clone(&events),
        sessions,
        conversations,
        requests,
        deliveries,
        processed: Arc::clone(&processed),
        delivery: Arc::clone(&delivery),
        slack_verifier,
    };

    Ok(Application { config, db_pool, events, dispatcher, delivery, processed, api })
}

/// Slack replies go through the Web API when a bot token is set. Every other integration
/// posts to its callback or configured webhook and otherwise holds the reply for polling.
fn delivery_manager(config: &AppConfig) -> Result<DeliveryManager, BootstrapError> {
    let policy = config.delivery.policy();
    let timeout = policy.timeout;
    let mut manager = DeliveryManager::new(policy);

    match SlackTransport::from_config(&config.slack, timeout).map_err(BootstrapError::Transport)? {
        Some(slack) => manager = manager.with_transport(IntegrationType::Slack, Arc::new(slack)),
        None => warn!(
            event_name = "system.bootstrap.slack_delivery_disabled",
            correlation_id = "bootstrap",
            "slack.bot_token is unset; slack replies will fail delivery"
        ),
    }

    let inline: Arc<dyn DeliveryTransport> = Arc::new(InlineTransport);
    for integration in IntegrationType::ALL {
        if integration == IntegrationType::Slack {
            continue;
        }
        let webhook = WebhookTransport::new(timeout)
            .map_err(BootstrapError::Transport)?
            .with_default_url(config.delivery.webhook_for(integration).map(str::to_owned))
            .with_fallback(Arc::clone(&inline));
        manager = manager.with_transport(integration, Arc::new(webhook));
    }
    Ok(manager)
}
