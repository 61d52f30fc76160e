//! Agent definitions loaded from YAML files.
//!
//! Every `*.yaml`/`*.yml` file in the agents directory declares one agent. State-machine agents
//! embed their flow under `state_machine`; conversational agents carry a `system_prompt`.
//!
//! ```yaml
//! name: laptop-refresh-agent
//! description: Handles laptop refresh requests
//! kind: state_machine
//! state_machine:
//!   settings:
//!     initial_state: greet
//!   states: { ... }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use relaydesk_core::flows::{FlowConfigError, StateMachineConfig};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read agents from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse agent definition {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("agent `{name}` is invalid: {message}")]
    InvalidDefinition { name: String, message: String },
    #[error("agent `{name}` has an invalid state machine: {source}")]
    Flow {
        name: String,
        #[source]
        source: FlowConfigError,
    },
    #[error("agent `{0}` is defined more than once")]
    Duplicate(String),
    #[error("routing agent `{0}` is not defined")]
    MissingRoutingAgent(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    StateMachine,
    Conversational,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateMachine => "state_machine",
            Self::Conversational => "conversational",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentFile {
    name: String,
    #[serde(default)]
    description: Option<String>,
    kind: AgentKind,
    #[serde(default)]
    state_machine: Option<StateMachineConfig>,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Clone, Debug)]
pub enum AgentBehavior {
    StateMachine(Arc<StateMachineConfig>),
    Conversational { system_prompt: String },
}

#[derive(Clone, Debug)]
pub struct AgentDefinition {
    pub name: String,
    pub description: Option<String>,
    pub behavior: AgentBehavior,
}

impl AgentDefinition {
    pub fn state_machine(name: impl Into<String>, flow: StateMachineConfig) -> Self {
        Self {
            name: name.into(),
            description: None,
            behavior: AgentBehavior::StateMachine(Arc::new(flow)),
        }
    }

    pub fn conversational(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            behavior: AgentBehavior::Conversational { system_prompt: system_prompt.into() },
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self.behavior {
            AgentBehavior::StateMachine(_) => AgentKind::StateMachine,
            AgentBehavior::Conversational { .. } => AgentKind::Conversational,
        }
    }

    pub fn from_yaml_str(source: &str, path: &Path) -> Result<Self, RegistryError> {
        let file: AgentFile = serde_yaml::from_str(source).map_err(|error| {
            RegistryError::Parse { path: path.to_path_buf(), message: error.to_string() }
        })?;

        let name = file.name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                name: file.name,
                message: "name must not be empty".to_string(),
            });
        }

        let behavior = match (file.kind, file.state_machine, file.system_prompt) {
            (AgentKind::StateMachine, Some(flow), _) => {
                flow.validate()
                    .map_err(|source| RegistryError::Flow { name: name.clone(), source })?;
                AgentBehavior::StateMachine(Arc::new(flow))
            }
            (AgentKind::StateMachine, None, _) => {
                return Err(RegistryError::InvalidDefinition {
                    name,
                    message: "kind `state_machine` requires a `state_machine` block".to_string(),
                })
            }
            (AgentKind::Conversational, _, Some(prompt)) if !prompt.trim().is_empty() => {
                AgentBehavior::Conversational { system_prompt: prompt }
            }
            (AgentKind::Conversational, _, _) => {
                return Err(RegistryError::InvalidDefinition {
                    name,
                    message: "kind `conversational` requires a non-empty `system_prompt`"
                        .to_string(),
                })
            }
        };

        Ok(Self { name, description: file.description, behavior })
    }
}

/// Name-indexed agent catalogue. Lookups are case-insensitive.
#[derive(Clone, Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<AgentDefinition>>,
    routing_agent: String,
}

impl AgentRegistry {
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = AgentDefinition>,
        routing_agent: &str,
    ) -> Result<Self, RegistryError> {
        let mut agents = BTreeMap::new();
        for mut definition in definitions {
            let key = definition.name.trim().to_ascii_lowercase();
            definition.name = key.clone();
            if agents.insert(key.clone(), Arc::new(definition)).is_some() {
                return Err(RegistryError::Duplicate(key));
            }
        }

        let routing_agent = routing_agent.trim().to_ascii_lowercase();
        if !agents.contains_key(&routing_agent) {
            return Err(RegistryError::MissingRoutingAgent(routing_agent));
        }
        Ok(Self { agents, routing_agent })
    }

    /// Loads every agent file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path, routing_agent: &str) -> Result<Self, RegistryError> {
        let io_error = |source| RegistryError::Io { path: dir.to_path_buf(), source };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_error)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|extension| extension.to_str())
                        .is_some_and(|extension| matches!(extension, "yaml" | "yml"))
            })
            .collect();
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            let source = fs::read_to_string(&path)
                .map_err(|source| RegistryError::Io { path: path.clone(), source })?;
            definitions.push(AgentDefinition::from_yaml_str(&source, &path)?);
        }

        let registry = Self::from_definitions(definitions, routing_agent)?;
        info!(
            event_name = "agents.registry.loaded",
            dir = %dir.display(),
            agents = ?registry.names(),
            routing_agent = %registry.routing_agent,
            "agent definitions loaded"
        );
        Ok(registry)
    }

    pub fn routing_agent(&self) -> &str {
        &self.routing_agent
    }

    pub fn is_routing_agent(&self, name: &str) -> bool {
        self.routing_agent.eq_ignore_ascii_case(name.trim())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentDefinition>> {
        self.agents.get(&name.trim().to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    /// Specialists the routing agent may hand off to.
    pub fn specialists(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents
            .iter()
            .filter(|(key, _)| **key != self.routing_agent)
            .map(|(_, definition)| definition.as_ref())
    }

    pub fn definitions(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.values().map(|definition| definition.as_ref())
    }
}
