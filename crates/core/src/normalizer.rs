//! Inbound request normalization.
//!
//! Every integration posts its own payload shape; the normalizer validates the shape-specific
//! required fields and folds everything into one [`NormalizedRequest`]. Validation happens
//! before any session is looked up, so a rejected payload never leaves partial state behind.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::request::{IntegrationType, NormalizedRequest, RequestId};

/// Fields every integration carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackRequest {
    #[serde(flatten)]
    pub base: BaseRequest,
    /// `None` for direct messages.
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub slack_user_id: String,
    #[serde(default)]
    pub slack_team_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WebRequest {
    #[serde(flatten)]
    pub base: BaseRequest,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CliRequest {
    #[serde(flatten)]
    pub base: BaseRequest,
    #[serde(default)]
    pub cli_session_id: String,
    #[serde(default)]
    pub command_context: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    #[serde(flatten)]
    pub base: BaseRequest,
    #[serde(default)]
    pub tool_id: String,
    #[serde(default)]
    pub tool_instance_id: Option<String>,
    #[serde(default)]
    pub trigger_event: Option<String>,
    #[serde(default)]
    pub tool_context: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenericRequest {
    #[serde(flatten)]
    pub base: BaseRequest,
    pub integration_type: IntegrationType,
    #[serde(default)]
    pub integration_context: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawRequest {
    Slack(SlackRequest),
    Web(WebRequest),
    Cli(CliRequest),
    Tool(ToolRequest),
    Generic(GenericRequest),
}

impl RawRequest {
    pub fn integration_type(&self) -> IntegrationType {
        match self {
            Self::Slack(_) => IntegrationType::Slack,
            Self::Web(_) => IntegrationType::Web,
            Self::Cli(_) => IntegrationType::Cli,
            Self::Tool(_) => IntegrationType::Tool,
            Self::Generic(request) => request.integration_type,
        }
    }

    pub fn base(&self) -> &BaseRequest {
        match self {
            Self::Slack(request) => &request.base,
            Self::Web(request) => &request.base,
            Self::Cli(request) => &request.base,
            Self::Tool(request) => &request.base,
            Self::Generic(request) => &request.base,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{integration} request is missing required field `{field}`")]
    MissingField { integration: IntegrationType, field: &'static str },
}

/// Browser/OS facts pulled out of a user-agent header by substring matching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserAgentInfo {
    pub browser: &'static str,
    pub os: &'static str,
    pub is_mobile: bool,
}

pub fn parse_user_agent(user_agent: &str) -> UserAgentInfo {
    let lowered = user_agent.to_ascii_lowercase();

    // chrome and firefox-on-ios both advertise safari, so the order matters
    let browser = if lowered.contains("firefox") || lowered.contains("fxios") {
        "Firefox"
    } else if lowered.contains("chrome") || lowered.contains("crios") {
        "Chrome"
    } else if lowered.contains("safari") {
        "Safari"
    } else {
        "Unknown"
    };

    let os = if lowered.contains("iphone") || lowered.contains("ipad") || lowered.contains("ios")
    {
        "iOS"
    } else if lowered.contains("android") {
        "Android"
    } else if lowered.contains("windows") {
        "Windows"
    } else if lowered.contains("mac os") || lowered.contains("macos") || lowered.contains("macintosh")
    {
        "macOS"
    } else if lowered.contains("linux") {
        "Linux"
    } else {
        "Unknown"
    };

    UserAgentInfo { browser, os, is_mobile: user_agent.contains("Mobile") }
}

/// Tool id → agent table consulted for automated requests. `None` means "route normally".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolAgentMap {
    entries: BTreeMap<String, Option<String>>,
}

impl Default for ToolAgentMap {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("snow-integration".to_string(), Some("laptop-refresh-agent".to_string()));
        entries.insert("email-service".to_string(), Some("email-change-agent".to_string()));
        entries.insert("hr-system".to_string(), Some("routing-agent".to_string()));
        Self { entries }
    }
}

impl ToolAgentMap {
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut map = Self::default();
        for (tool_id, agent) in overrides {
            let agent = agent.trim();
            let target = if agent.is_empty() { None } else { Some(agent.to_string()) };
            map.entries.insert(tool_id.trim().to_ascii_lowercase(), target);
        }
        map
    }

    pub fn agent_for(&self, tool_id: &str) -> Option<&str> {
        self.entries.get(&tool_id.trim().to_ascii_lowercase()).and_then(|agent| agent.as_deref())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    tool_agents: ToolAgentMap,
}

impl Normalizer {
    pub fn new(tool_agents: ToolAgentMap) -> Self {
        Self { tool_agents }
    }

    pub fn normalize(
        &self,
        raw: RawRequest,
        session_id: impl Into<String>,
    ) -> Result<NormalizedRequest, NormalizeError> {
        let integration_type = raw.integration_type();
        validate_base(integration_type, raw.base())?;

        let mut target_agent_id = None;
        let (base, integration_context, mut user_context) = match raw {
            RawRequest::Slack(request) => {
                require(integration_type, "slack_user_id", &request.slack_user_id)?;
                require(integration_type, "slack_team_id", &request.slack_team_id)?;
                let context = object(json!({
                    "platform": "slack",
                    "channel_id": request.channel_id,
                    "thread_id": request.thread_id,
                    "slack_user_id": request.slack_user_id,
                    "slack_team_id": request.slack_team_id,
                }));
                (request.base, context, Map::new())
            }
            RawRequest::Web(request) => {
                let info = request.user_agent.as_deref().map(parse_user_agent);
                let mut context = object(json!({
                    "platform": "web",
                    "user_agent": request.user_agent,
                    "client_ip": request.client_ip,
                    "browser": info.as_ref().map(|info| info.browser),
                    "os": info.as_ref().map(|info| info.os),
                    "is_mobile": info.as_ref().map(|info| info.is_mobile).unwrap_or(false),
                }));
                if let Some(callback_url) = request.callback_url {
                    context.insert("callback_url".to_string(), Value::String(callback_url));
                }
                (request.base, context, Map::new())
            }
            RawRequest::Cli(request) => {
                require(integration_type, "cli_session_id", &request.cli_session_id)?;
                let context = object(json!({
                    "platform": "cli",
                    "cli_session_id": request.cli_session_id,
                }));
                let mut user_context = Map::new();
                if let Some(command_context) = request.command_context {
                    user_context.insert("command_context".to_string(), command_context);
                }
                (request.base, context, user_context)
            }
            RawRequest::Tool(request) => {
                require(integration_type, "tool_id", &request.tool_id)?;
                target_agent_id = self.tool_agents.agent_for(&request.tool_id).map(str::to_string);
                let context = object(json!({
                    "platform": "tool",
                    "tool_id": request.tool_id,
                    "tool_instance_id": request.tool_instance_id,
                    "trigger_event": request.trigger_event,
                    "tool_context": request.tool_context,
                }));
                let mut user_context = Map::new();
                user_context.insert("automated_request".to_string(), Value::Bool(true));
                (request.base, context, user_context)
            }
            RawRequest::Generic(request) => {
                let mut context = request.integration_context;
                context
                    .entry("platform".to_string())
                    .or_insert_with(|| json!(integration_type.as_str().to_ascii_lowercase()));
                (request.base, context, Map::new())
            }
        };

        if let Some(email) = base.user_email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            user_context.insert("email".to_string(), Value::String(email.to_string()));
        }
        for (key, value) in base.metadata {
            user_context.entry(key).or_insert(value);
        }

        let requires_routing = target_agent_id.is_none();
        Ok(NormalizedRequest {
            request_id: RequestId::generate(),
            session_id: session_id.into(),
            user_id: base.user_id.trim().to_string(),
            integration_type,
            content: base.content,
            integration_context,
            user_context,
            target_agent_id,
            requires_routing,
            created_at: Utc::now(),
        })
    }
}

fn validate_base(integration: IntegrationType, base: &BaseRequest) -> Result<(), NormalizeError> {
    require(integration, "user_id", &base.user_id)?;
    require(integration, "content", &base.content)
}

fn require(
    integration: IntegrationType,
    field: &'static str,
    value: &str,
) -> Result<(), NormalizeError> {
    if value.trim().is_empty() {
        return Err(NormalizeError::MissingField { integration, field });
    }
    Ok(())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::{
        parse_user_agent, BaseRequest, CliRequest, GenericRequest, NormalizeError, Normalizer,
        RawRequest, SlackRequest, ToolAgentMap, ToolRequest, WebRequest,
    };
    use crate::domain::request::IntegrationType;

    fn base(content: &str) -> BaseRequest {
        BaseRequest {
            user_id: "U-100".to_string(),
            content: content.to_string(),
            user_email: Some("pat@example.com".to_string()),
            ..BaseRequest::default()
        }
    }

    #[test]
    fn slack_direct_message_has_null_channel_and_requires_routing() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Slack(SlackRequest {
                    base: base("my laptop is slow"),
                    channel_id: None,
                    thread_id: Some("1730000000.0001".to_string()),
                    slack_user_id: "U-SLACK".to_string(),
                    slack_team_id: "T-1".to_string(),
                }),
                "session-1",
            )
            .expect("valid slack request");

        assert_eq!(request.integration_type, IntegrationType::Slack);
        assert_eq!(request.integration_context["platform"], "slack");
        assert_eq!(request.integration_context["channel_id"], Value::Null);
        assert_eq!(request.integration_context["thread_id"], "1730000000.0001");
        assert!(request.requires_routing);
        assert_eq!(request.target_agent_id, None);
        assert_eq!(request.user_email(), Some("pat@example.com"));
        assert_eq!(request.session_id, "session-1");
    }

    #[test]
    fn slack_request_without_team_is_rejected() {
        let error = Normalizer::default()
            .normalize(
                RawRequest::Slack(SlackRequest {
                    base: base("hello"),
                    slack_user_id: "U-SLACK".to_string(),
                    ..SlackRequest::default()
                }),
                "session-1",
            )
            .expect_err("team id is required");

        assert_eq!(
            error,
            NormalizeError::MissingField {
                integration: IntegrationType::Slack,
                field: "slack_team_id"
            }
        );
    }

    #[test]
    fn missing_content_fails_before_shape_specific_checks() {
        let error = Normalizer::default()
            .normalize(RawRequest::Web(WebRequest { base: base("   "), ..WebRequest::default() }), "s")
            .expect_err("blank content is rejected");

        assert!(matches!(error, NormalizeError::MissingField { field: "content", .. }));
    }

    #[test]
    fn web_request_extracts_user_agent_facts() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Web(WebRequest {
                    base: base("hi"),
                    user_agent: Some(
                        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 \
                         (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1"
                            .to_string(),
                    ),
                    client_ip: Some("10.0.0.7".to_string()),
                    callback_url: None,
                }),
                "session-2",
            )
            .expect("valid web request");

        assert_eq!(request.integration_context["browser"], "Safari");
        assert_eq!(request.integration_context["os"], "iOS");
        assert_eq!(request.integration_context["is_mobile"], true);
        assert_eq!(request.integration_context["client_ip"], "10.0.0.7");
        assert!(request.requires_routing);
    }

    #[test]
    fn user_agent_parsing_prefers_chrome_over_safari_token() {
        let info = parse_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/120.0 Safari/537.36",
        );
        assert_eq!(info.browser, "Chrome");
        assert_eq!(info.os, "Windows");
        assert!(!info.is_mobile);

        let android = parse_user_agent(
            "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 Chrome/120.0 Mobile Safari/537.36",
        );
        assert_eq!(android.os, "Android");
        assert!(android.is_mobile);

        let mac = parse_user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) Firefox/121.0");
        assert_eq!(mac.browser, "Firefox");
        assert_eq!(mac.os, "macOS");
    }

    #[test]
    fn cli_request_passes_command_context_through() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Cli(CliRequest {
                    base: base("refresh my laptop"),
                    cli_session_id: "cli-42".to_string(),
                    command_context: Some(json!({"command": "chat", "args": ["--verbose"]})),
                }),
                "session-3",
            )
            .expect("valid cli request");

        assert_eq!(request.integration_context["platform"], "cli");
        assert_eq!(request.integration_context["cli_session_id"], "cli-42");
        assert_eq!(
            request.user_context["command_context"],
            json!({"command": "chat", "args": ["--verbose"]})
        );
    }

    #[test]
    fn known_tool_maps_to_agent_and_skips_routing() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Tool(ToolRequest {
                    base: base("laptop refresh ticket opened"),
                    tool_id: "snow-integration".to_string(),
                    ..ToolRequest::default()
                }),
                "session-4",
            )
            .expect("valid tool request");

        assert_eq!(request.target_agent_id.as_deref(), Some("laptop-refresh-agent"));
        assert!(!request.requires_routing);
        assert_eq!(request.user_context["automated_request"], true);
    }

    #[test]
    fn unknown_tool_requires_routing() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Tool(ToolRequest {
                    base: base("ping"),
                    tool_id: "mystery-bot".to_string(),
                    ..ToolRequest::default()
                }),
                "session-5",
            )
            .expect("valid tool request");

        assert_eq!(request.target_agent_id, None);
        assert!(request.requires_routing);
    }

    #[test]
    fn tool_overrides_extend_and_clear_the_builtin_table() {
        let mut overrides = BTreeMap::new();
        overrides.insert("payroll".to_string(), "payroll-agent".to_string());
        overrides.insert("snow-integration".to_string(), String::new());
        let map = ToolAgentMap::with_overrides(&overrides);

        assert_eq!(map.agent_for("payroll"), Some("payroll-agent"));
        assert_eq!(map.agent_for("snow-integration"), None);
        assert_eq!(map.agent_for("EMAIL-SERVICE"), Some("email-change-agent"));
    }

    #[test]
    fn generic_request_keeps_declared_integration_type() {
        let request = Normalizer::default()
            .normalize(
                RawRequest::Generic(GenericRequest {
                    base: base("forwarded mail"),
                    integration_type: IntegrationType::Email,
                    integration_context: serde_json::Map::new(),
                }),
                "session-6",
            )
            .expect("valid generic request");

        assert_eq!(request.integration_type, IntegrationType::Email);
        assert_eq!(request.integration_context["platform"], "email");
        assert!(request.requires_routing);
    }
}
