use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use relaydesk_core::normalizer::{BaseRequest, SlackRequest};

const URL_VERIFICATION: &str = "url_verification";
const EVENT_CALLBACK: &str = "event_callback";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub event_id: Option<String>,
    pub team_id: Option<String>,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    UrlVerification { challenge: String },
    Message(MessageEvent),
    Ignored { event_type: String, reason: &'static str },
}

impl SlackEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::UrlVerification { .. } => URL_VERIFICATION,
            Self::Message(message) => message.kind.as_str(),
            Self::Ignored { event_type, .. } => event_type,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    AppMention,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::AppMention => "app_mention",
        }
    }
}

/// A human-authored message the bot should answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub kind: MessageKind,
    pub channel_id: String,
    pub channel_type: Option<String>,
    pub user_id: String,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
}

impl MessageEvent {
    pub fn is_direct_message(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }

    /// Converts the event into the Slack ingestion shape.
    ///
    /// Direct messages carry no channel id (replies go to the user). Channel messages reply in
    /// the thread they came from, or start one under the triggering message.
    pub fn into_request(self, team_id: &str) -> SlackRequest {
        let direct = self.is_direct_message();
        let thread_id =
            if direct { self.thread_ts } else { self.thread_ts.or(Some(self.ts.clone())) };

        let mut metadata = Map::new();
        metadata.insert("slack_message_ts".to_owned(), Value::String(self.ts));
        metadata
            .insert("slack_event_type".to_owned(), Value::String(self.kind.as_str().to_owned()));

        SlackRequest {
            base: BaseRequest {
                user_id: self.user_id.clone(),
                content: self.text,
                user_email: None,
                metadata,
            },
            channel_id: (!direct).then_some(self.channel_id),
            thread_id,
            slack_user_id: self.user_id,
            slack_team_id: team_id.to_owned(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("slack payload is not valid json: {0}")]
    Json(String),
    #[error("slack payload is missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct WireCallback {
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    event: WireEvent,
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

/// True when `payload` is an Events API envelope rather than a plain Slack request body.
pub fn is_events_api_payload(payload: &Value) -> bool {
    matches!(
        payload.get("type").and_then(Value::as_str),
        Some(URL_VERIFICATION) | Some(EVENT_CALLBACK)
    )
}

pub fn parse_envelope(body: &[u8]) -> Result<SlackEnvelope, EventParseError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|error| EventParseError::Json(error.to_string()))?;
    parse_envelope_value(payload)
}

pub fn parse_envelope_value(payload: Value) -> Result<SlackEnvelope, EventParseError> {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EventParseError::MissingField("type"))?
        .to_owned();

    match kind.as_str() {
        URL_VERIFICATION => {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or(EventParseError::MissingField("challenge"))?;
            Ok(SlackEnvelope {
                event_id: None,
                team_id: None,
                event: SlackEvent::UrlVerification { challenge: challenge.to_owned() },
            })
        }
        EVENT_CALLBACK => {
            let callback: WireCallback = serde_json::from_value(payload)
                .map_err(|error| EventParseError::Json(error.to_string()))?;
            Ok(SlackEnvelope {
                event_id: callback.event_id,
                team_id: callback.team_id,
                event: classify(callback.event)?,
            })
        }
        _ => Ok(SlackEnvelope {
            event_id: None,
            team_id: None,
            event: SlackEvent::Ignored { event_type: kind, reason: "unsupported envelope type" },
        }),
    }
}

fn classify(event: WireEvent) -> Result<SlackEvent, EventParseError> {
    let kind = match event.kind.as_str() {
        "message" => MessageKind::Message,
        "app_mention" => MessageKind::AppMention,
        _ => return Ok(ignored(event.kind.clone(), "unsupported event type")),
    };
    if event.bot_id.is_some() || event.subtype.as_deref() == Some("bot_message") {
        return Ok(ignored(event.kind, "bot message"));
    }
    if event.subtype.is_some() {
        // edits, deletions, joins
        return Ok(ignored(event.kind, "message subtype"));
    }

    let text = strip_leading_mentions(event.text.as_deref().unwrap_or_default());
    if text.is_empty() {
        return Ok(ignored(event.kind, "empty message"));
    }

    Ok(SlackEvent::Message(MessageEvent {
        kind,
        channel_id: event.channel.ok_or(EventParseError::MissingField("event.channel"))?,
        channel_type: event.channel_type,
        user_id: event.user.ok_or(EventParseError::MissingField("event.user"))?,
        text,
        ts: event.ts.ok_or(EventParseError::MissingField("event.ts"))?,
        thread_ts: event.thread_ts,
    }))
}

fn ignored(event_type: String, reason: &'static str) -> SlackEvent {
    SlackEvent::Ignored { event_type, reason }
}

/// Drops `<@U123>` mentions at the start of the text.
fn strip_leading_mentions(text: &str) -> String {
    let mut rest = text.trim_start();
    while let Some(after) = rest.strip_prefix("<@") {
        match after.find('>') {
            Some(end) => rest = after[end + 1..].trim_start(),
            None => break,
        }
    }
    rest.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{is_events_api_payload, parse_envelope, EventParseError, MessageKind, SlackEvent};

    fn callback(event: serde_json::Value) -> Vec<u8> {
        json!({
            "type": "event_callback",
            "team_id": "T001",
            "event_id": "Ev001",
            "event": event,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn url_verification_echoes_challenge() {
        let body = json!({"type": "url_verification", "challenge": "abc123", "token": "x"});

        let envelope = parse_envelope(body.to_string().as_bytes()).expect("parse");

        assert_eq!(envelope.event, SlackEvent::UrlVerification { challenge: "abc123".to_owned() });
        assert!(is_events_api_payload(&body));
    }

    #[test]
    fn direct_message_becomes_request_without_channel() {
        let envelope = parse_envelope(&callback(json!({
            "type": "message",
            "channel": "D024BE91L",
            "channel_type": "im",
            "user": "U2147483697",
            "text": "I need a new laptop",
            "ts": "1355517523.000005",
        })))
        .expect("parse");

        assert_eq!(envelope.event_id.as_deref(), Some("Ev001"));
        let SlackEvent::Message(message) = envelope.event else {
            panic!("expected a message event");
        };
        assert!(message.is_direct_message());

        let request = message.into_request("T001");
        assert_eq!(request.channel_id, None);
        assert_eq!(request.thread_id, None);
        assert_eq!(request.slack_user_id, "U2147483697");
        assert_eq!(request.slack_team_id, "T001");
        assert_eq!(request.base.user_id, "U2147483697");
        assert_eq!(request.base.content, "I need a new laptop");
    }

    #[test]
    fn channel_mention_strips_bot_mention_and_threads_reply() {
        let envelope = parse_envelope(&callback(json!({
            "type": "app_mention",
            "channel": "C0LAN2Q65",
            "user": "U061F7AUR",
            "text": "<@U0LAN0Z89> change my email please",
            "ts": "1515449522.000016",
        })))
        .expect("parse");

        let SlackEvent::Message(message) = envelope.event else {
            panic!("expected a message event");
        };
        assert_eq!(message.kind, MessageKind::AppMention);
        assert_eq!(message.text, "change my email please");

        let request = message.into_request("T001");
        assert_eq!(request.channel_id.as_deref(), Some("C0LAN2Q65"));
        assert_eq!(request.thread_id.as_deref(), Some("1515449522.000016"));
    }

    #[test]
    fn threaded_channel_message_keeps_parent_thread() {
        let envelope = parse_envelope(&callback(json!({
            "type": "message",
            "channel": "C1",
            "channel_type": "channel",
            "user": "U1",
            "text": "follow up",
            "ts": "2.0",
            "thread_ts": "1.0",
        })))
        .expect("parse");

        let SlackEvent::Message(message) = envelope.event else {
            panic!("expected a message event");
        };
        assert_eq!(message.into_request("T1").thread_id.as_deref(), Some("1.0"));
    }

    #[test]
    fn bot_messages_and_edits_are_ignored() {
        let bot = parse_envelope(&callback(json!({
            "type": "message",
            "channel": "D1",
            "bot_id": "B1",
            "text": "echo",
            "ts": "1.0",
        })))
        .expect("parse");
        assert_eq!(
            bot.event,
            SlackEvent::Ignored { event_type: "message".to_owned(), reason: "bot message" }
        );

        let edit = parse_envelope(&callback(json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "D1",
            "ts": "1.0",
        })))
        .expect("parse");
        assert_eq!(
            edit.event,
            SlackEvent::Ignored { event_type: "message".to_owned(), reason: "message subtype" }
        );
    }

    #[test]
    fn unsupported_events_are_ignored_not_rejected() {
        let envelope = parse_envelope(&callback(json!({
            "type": "reaction_added",
            "user": "U1",
            "reaction": "thumbsup",
        })))
        .expect("parse");

        assert_eq!(envelope.event.event_type(), "reaction_added");
        assert!(matches!(envelope.event, SlackEvent::Ignored { .. }));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(parse_envelope(b"not json"), Err(EventParseError::Json(_))));
        assert_eq!(
            parse_envelope(br#"{"challenge": "x"}"#),
            Err(EventParseError::MissingField("type"))
        );
        assert_eq!(
            parse_envelope(&callback(json!({
                "type": "message",
                "channel": "D1",
                "text": "hello",
                "ts": "1.0",
            }))),
            Err(EventParseError::MissingField("event.user"))
        );
        assert!(!is_events_api_payload(&json!({"user_id": "U1", "content": "hi"})));
    }
}
