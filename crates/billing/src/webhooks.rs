//! Stripe webhook entry point: signature verification, API version gating,
//! event dispatch.
//!
//! Uses manual signature verification over the raw body so the accepted
//! Stripe API version is not tied to the SDK's pinned one.

pub mod events;
pub mod handlers;
mod sendslot;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use events::{Event, EventKind};
use handlers::EventHandlers;

type HmacSha256 = Hmac<Sha256>;

/// The Stripe API version this router understands. Events declaring a newer
/// version are acknowledged without processing; older ones are rejected so
/// the sending endpoint gets fixed rather than silently half-working.
pub const ACCEPTED_API_VERSION: &str = "2022-11-15";

/// Maximum accepted age of a signed payload.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Transport-free handler result; the HTTP layer maps it to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event was processed and state converged.
    Handled,
    /// Recognized but deliberately not acted on.
    Ignored(&'static str),
    /// The event declares a newer API version than we speak; acknowledged
    /// so the provider stops redelivering, acted on by nobody.
    NewerVersion,
}

pub struct WebhookRouter {
    secret: String,
    handlers: EventHandlers,
    clock: std::sync::Arc<dyn Clock>,
}

impl WebhookRouter {
    pub fn new(secret: String, handlers: EventHandlers, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            secret,
            handlers,
            clock,
        }
    }

    /// Verify, gate, parse and dispatch one delivery.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature_header: &str,
        declared_version: Option<&str>,
    ) -> BillingResult<Outcome> {
        verify_signature(payload, signature_header, &self.secret, self.clock.as_ref())?;

        let event: Event = serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedEvent(format!("event envelope: {e}")))?;

        // The version query parameter wins over the envelope field; both
        // absent means the sender predates versioned endpoints, which we
        // treat as current.
        let version = declared_version.or(event.api_version.as_deref());
        match check_api_version(version)? {
            VersionCheck::Newer => {
                tracing::warn!(
                    event_id = %event.id,
                    declared = version.unwrap_or_default(),
                    accepted = ACCEPTED_API_VERSION,
                    "Event from a newer API version, acknowledging without processing"
                );
                return Ok(Outcome::NewerVersion);
            }
            VersionCheck::Proceed => {}
        }

        let kind = EventKind::from_event(&event)?;
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Dispatching webhook event");
        self.handlers.dispatch(kind).await
    }
}

pub enum VersionCheck {
    Proceed,
    Newer,
}

/// Compare a declared API version against the accepted one. Stripe versions
/// are ISO dates (optionally suffixed), so lexicographic comparison of the
/// date part orders them correctly.
pub fn check_api_version(declared: Option<&str>) -> BillingResult<VersionCheck> {
    let Some(declared) = declared else {
        return Ok(VersionCheck::Proceed);
    };
    let date = declared.split('.').next().unwrap_or(declared);
    match date.cmp(ACCEPTED_API_VERSION) {
        std::cmp::Ordering::Less => Err(BillingError::StaleWebhookVersion(declared.to_string())),
        std::cmp::Ordering::Equal => Ok(VersionCheck::Proceed),
        std::cmp::Ordering::Greater => Ok(VersionCheck::Newer),
    }
}

/// Verify a `Stripe-Signature` header over the raw payload.
/// Header format: `t=<unix>,v1=<hex hmac>,...`.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    clock: &dyn Clock,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    let now = clock.now_secs();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}
