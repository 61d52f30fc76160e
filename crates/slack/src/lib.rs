//! Slack integration - Events API ingress and `chat.postMessage` delivery
//!
//! This crate provides the Slack edge of relaydesk:
//! - **Events** (`events`) - Events API envelopes: URL verification and message callbacks
//! - **Signatures** (`signature`) - `v0` request signing checks with a replay window
//! - **Transport** (`transport`) - posts delivery records back into the originating conversation
//!
//! # Getting Started
//!
//! 1. Create a Slack app at https://api.slack.com/apps
//! 2. Subscribe to `message.im` and `app_mention` with the request URL `/requests/slack`
//! 3. Set `RELAYDESK_SLACK_BOT_TOKEN` and `RELAYDESK_SLACK_SIGNING_SECRET`
//!
//! # Architecture
//!
//! ```text
//! Slack → SignatureVerifier → parse_envelope → SlackRequest → Normalizer → agents
//!                                                                            ↓
//!                            chat.postMessage ← SlackTransport ← DeliveryManager
//! ```
//!
//! # Key Types
//!
//! - `SlackEnvelope` - one parsed Events API callback
//! - `SignatureVerifier` - checks `X-Slack-Signature` against the signing secret
//! - `SlackTransport` - `DeliveryTransport` backed by the Web API

pub mod events;
pub mod signature;
pub mod transport;

pub use events::{
    is_events_api_payload, parse_envelope, parse_envelope_value, EventParseError, MessageEvent,
    MessageKind, SlackEnvelope, SlackEvent,
};
pub use signature::{SignatureError, SignatureVerifier};
pub use transport::{post_message_for, SlackTransport};
