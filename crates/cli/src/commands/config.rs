use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use relaydesk_core::config::{AppConfig, LoadOptions};
use serde_json::{json, Map, Value as JsonValue};
use toml::Value;

use crate::commands::CommandResult;

/// Settings whose origin is reported, with the environment variable that overrides each.
const TRACKED_FIELDS: &[(&str, &str)] = &[
    ("database.url", "RELAYDESK_DATABASE_URL"),
    ("database.max_connections", "RELAYDESK_DATABASE_MAX_CONNECTIONS"),
    ("llm.provider", "RELAYDESK_LLM_PROVIDER"),
    ("llm.model", "RELAYDESK_LLM_MODEL"),
    ("llm.base_url", "RELAYDESK_LLM_BASE_URL"),
    ("llm.api_key", "RELAYDESK_LLM_API_KEY"),
    ("slack.bot_token", "RELAYDESK_SLACK_BOT_TOKEN"),
    ("slack.signing_secret", "RELAYDESK_SLACK_SIGNING_SECRET"),
    ("server.bind_address", "RELAYDESK_SERVER_BIND_ADDRESS"),
    ("server.port", "RELAYDESK_SERVER_PORT"),
    ("delivery.max_attempts", "RELAYDESK_DELIVERY_MAX_ATTEMPTS"),
    ("delivery.retry_delay_seconds", "RELAYDESK_DELIVERY_RETRY_DELAY_SECONDS"),
    ("delivery.expiry_seconds", "RELAYDESK_DELIVERY_EXPIRY_SECONDS"),
    ("agents.config_dir", "RELAYDESK_AGENTS_CONFIG_DIR"),
    ("agents.routing_agent", "RELAYDESK_AGENTS_ROUTING_AGENT"),
    ("logging.level", "RELAYDESK_LOGGING_LEVEL"),
    ("logging.format", "RELAYDESK_LOGGING_FORMAT"),
];

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let sources: Map<String, JsonValue> = TRACKED_FIELDS
        .iter()
        .map(|(key_path, env_key)| {
            let source = field_source(
                key_path,
                env_key,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            );
            ((*key_path).to_string(), JsonValue::String(source))
        })
        .collect();

    CommandResult::report(
        "config",
        json!({
            "precedence": "env > file > default",
            "config_file": config_file_path.map(|path| path.display().to_string()),
            "effective": config.redacted(),
            "sources": sources,
        }),
    )
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("relaydesk.toml"), PathBuf::from("config/relaydesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var(env_key).is_ok_and(|value| !value.trim().is_empty()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn nested_keys_are_found_in_the_config_document() {
        let doc: toml::Value = "[slack]\nsigning_secret = \"x\"\n[server]\nport = 9000\n"
            .parse()
            .expect("valid toml");

        assert!(contains_path(&doc, "slack.signing_secret"));
        assert!(contains_path(&doc, "server.port"));
        assert!(!contains_path(&doc, "slack.bot_token"));
        assert!(!contains_path(&doc, "delivery.max_attempts"));
    }
}
