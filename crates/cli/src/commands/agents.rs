use std::path::PathBuf;

use relaydesk_agent::AgentRegistry;
use relaydesk_core::config::{AppConfig, LoadOptions};
use serde_json::json;

use crate::commands::CommandResult;

pub fn run(dir: Option<PathBuf>) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "agents",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let dir = dir.unwrap_or(config.agents.config_dir);
    let registry = match AgentRegistry::load_dir(&dir, &config.agents.routing_agent) {
        Ok(registry) => registry,
        Err(error) => {
            return CommandResult::failure("agents", "agent_registry", error.to_string(), 3);
        }
    };

    let agents: Vec<_> = registry
        .definitions()
        .map(|definition| {
            json!({
                "name": definition.name,
                "kind": definition.kind().as_str(),
                "description": definition.description,
                "routing": registry.is_routing_agent(&definition.name),
            })
        })
        .collect();

    CommandResult::report(
        "agents",
        json!({
            "dir": dir.display().to_string(),
            "routing_agent": registry.routing_agent(),
            "agents": agents,
        }),
    )
}
