//! HMAC-signed webhook notifications on phase and run completion.
//!
//! Grounded on the teacher's webhook crate: same `reqwest::blocking`
//! client-per-call shape and JSON body, extended with an
//! `X-Wreckit-Signature` header so a receiver can verify the payload came
//! from this repo's configured secret rather than trusting the network.

use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use wreckit_types::item::{ItemId, Phase};

type HmacSha256 = Hmac<Sha256>;

/// What happened, turned into a notification. One event per call to
/// [`send_notification`] — the orchestrator fires these from `run_item`
/// and `run_all` rather than batching them.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PhaseSucceeded { item: ItemId, phase: Phase },
    PhaseFailed { item: ItemId, phase: Phase, message: String },
    RunCompleted { succeeded: usize, failed: usize },
}

#[derive(Debug, Serialize)]
struct Payload {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<&'static str>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    succeeded: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<usize>,
}

impl From<&WebhookEvent> for Payload {
    fn from(event: &WebhookEvent) -> Self {
        match event {
            WebhookEvent::PhaseSucceeded { item, phase } => Payload {
                event: "phase_succeeded",
                item: Some(item.as_str().to_string()),
                phase: Some(phase.as_str()),
                success: true,
                message: None,
                succeeded: None,
                failed: None,
            },
            WebhookEvent::PhaseFailed { item, phase, message } => Payload {
                event: "phase_failed",
                item: Some(item.as_str().to_string()),
                phase: Some(phase.as_str()),
                success: false,
                message: Some(message.clone()),
                succeeded: None,
                failed: None,
            },
            WebhookEvent::RunCompleted { succeeded, failed } => Payload {
                event: "run_completed",
                item: None,
                phase: None,
                success: *failed == 0,
                message: None,
                succeeded: Some(*succeeded),
                failed: Some(*failed),
            },
        }
    }
}

/// A configured delivery target. `secret` is read out of an env var by
/// the caller (§6: secrets never live in `config.json` itself) and
/// handed in already resolved.
pub struct WebhookNotifier {
    pub url: String,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: Option<String>) -> Self {
        Self {
            url,
            secret,
            timeout: Duration::from_secs(10),
        }
    }
}

fn sign(secret: &str, body: &str) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).context("hmac accepts any key length")?;
    mac.update(body.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sends one notification. Failures here never fail the phase or run
/// that triggered them — the caller logs and moves on (§10: notification
/// delivery is best-effort).
pub fn send_notification(notifier: &WebhookNotifier, event: &WebhookEvent) -> Result<()> {
    let payload = Payload::from(event);
    let body = serde_json::to_string(&payload).context("serializing webhook payload")?;

    let client = reqwest::blocking::Client::builder()
        .timeout(notifier.timeout)
        .build()
        .context("failed to create HTTP client")?;

    let mut request = client
        .post(&notifier.url)
        .header("Content-Type", "application/json");

    if let Some(secret) = &notifier.secret {
        let signature = sign(secret, &body)?;
        request = request.header("X-Wreckit-Signature", format!("sha256={signature}"));
    }

    let response = request
        .body(body)
        .send()
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        anyhow::bail!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().unwrap_or_default()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_succeeded_serializes_with_item_and_phase() {
        let event = WebhookEvent::PhaseSucceeded {
            item: ItemId::from_raw("features/001-a"),
            phase: Phase::Research,
        };
        let payload = Payload::from(&event);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"event\":\"phase_succeeded\""));
        assert!(json.contains("\"phase\":\"research\""));
        assert!(json.contains("\"success\":true"));
    }

    #[test]
    fn run_completed_reports_failure_when_any_item_failed() {
        let event = WebhookEvent::RunCompleted { succeeded: 2, failed: 1 };
        let payload = Payload::from(&event);
        assert!(!payload.success);
        assert_eq!(payload.failed, Some(1));
    }

    #[test]
    fn same_secret_and_body_produce_a_stable_signature() {
        let a = sign("shh", "hello").unwrap();
        let b = sign("shh", "hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = sign("shh", "hello").unwrap();
        let b = sign("other", "hello").unwrap();
        assert_ne!(a, b);
    }
}
