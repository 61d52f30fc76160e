//! Slack request signing (`v0`).
//!
//! Slack signs `v0:{timestamp}:{raw body}` with the app's signing secret and sends the hex
//! digest as `X-Slack-Signature: v0=<hex>`. Requests older than the tolerance are refused to
//! stop replays.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

const VERSION: &str = "v0";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),
    #[error("invalid request timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("request timestamp is {age_secs}s away from now")]
    Stale { age_secs: i64 },
    #[error("signature is not a `v0=` hex digest")]
    Malformed,
    #[error("signature does not match")]
    Mismatch,
}

#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret, tolerance_secs: DEFAULT_TOLERANCE_SECS }
    }

    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        self.verify_at(timestamp, signature, body, Utc::now())
    }

    pub fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?.trim();
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?.trim();

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_owned()))?;
        let age_secs = now.timestamp() - sent_at;
        if age_secs.abs() > self.tolerance_secs {
            return Err(SignatureError::Stale { age_secs });
        }

        let digest = signature
            .strip_prefix("v0=")
            .and_then(|hex_digest| hex::decode(hex_digest).ok())
            .ok_or(SignatureError::Malformed)?;

        self.mac(timestamp, body)?.verify_slice(&digest).map_err(|_| SignatureError::Mismatch)
    }

    /// Produces the header value Slack would send for `body` at `timestamp`.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, body)?.finalize().into_bytes();
        Ok(format!("{VERSION}={}", hex::encode(digest)))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(VERSION.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use secrecy::SecretString;

    use super::{SignatureError, SignatureVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};

    const BODY: &[u8] = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&command=%2Fhelp";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SecretString::from("8f742231b10e8888abcd99yyyzzz85a5".to_owned()))
    }

    #[test]
    fn accepts_known_slack_signature() {
        // Reference values from Slack's request-verification guide.
        let now = Utc.timestamp_opt(1_531_420_618, 0).single().expect("timestamp");
        let body = concat!(
            "token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&team_domain=testteamnow",
            "&channel_id=G8PSS9T3V&channel_name=foobar&user_id=U2CERLKJA&user_name=roadrunner",
            "&command=%2Fwebhook-collect&text=&response_url=https%3A%2F%2Fhooks.slack.com",
            "%2Fcommands%2FT1DC2JH3J%2F397700885554%2F96rGlfmibIGlgcZRskXaIFfN",
            "&trigger_id=398738663015.47445629121.803a0bc887a14d10d2c447fce8b6703c"
        )
        .as_bytes();

        let result = verifier().verify_at(
            Some("1531420618"),
            Some("v0=a2114d57b48eac39b9ad189dd8316235a7b4a8d21a10bd27519666489c69b503"),
            body,
            now,
        );

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn signed_body_verifies_and_tampered_body_does_not() {
        let verifier = verifier();
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let signature = verifier.sign(&timestamp, BODY).expect("sign");

        assert_eq!(verifier.verify_at(Some(&timestamp), Some(&signature), BODY, now), Ok(()));
        assert_eq!(
            verifier.verify_at(Some(&timestamp), Some(&signature), b"tampered", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let verifier = verifier();
        let now = Utc::now();
        let old = (now.timestamp() - 301).to_string();
        let signature = verifier.sign(&old, BODY).expect("sign");

        assert_eq!(
            verifier.verify_at(Some(&old), Some(&signature), BODY, now),
            Err(SignatureError::Stale { age_secs: 301 })
        );
    }

    #[test]
    fn missing_and_malformed_headers_are_reported() {
        let verifier = verifier();
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();

        assert_eq!(
            verifier.verify_at(None, Some("v0=00"), BODY, now),
            Err(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        );
        assert_eq!(
            verifier.verify_at(Some(&timestamp), None, BODY, now),
            Err(SignatureError::MissingHeader(SIGNATURE_HEADER))
        );
        assert_eq!(
            verifier.verify_at(Some("yesterday"), Some("v0=00"), BODY, now),
            Err(SignatureError::InvalidTimestamp("yesterday".to_owned()))
        );
        assert_eq!(
            verifier.verify_at(Some(&timestamp), Some("sha256=abcd"), BODY, now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verifier.verify_at(Some(&timestamp), Some("v0=zz"), BODY, now),
            Err(SignatureError::Malformed)
        );
    }
}
