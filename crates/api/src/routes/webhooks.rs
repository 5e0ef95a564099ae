//! Stripe webhook endpoint.
//!
//! The body must stay raw bytes: the signature covers the exact payload
//! Stripe sent, and any re-serialization breaks it.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use wildpatch_billing::{BillingError, Outcome};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    /// Stripe API version the sending endpoint is configured for.
    pub version: Option<String>,
}

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(BillingError::WebhookSignatureInvalid)
        .map_err(ApiError::from)?;

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature, query.version.as_deref())
        .await?;

    let received = match outcome {
        Outcome::Handled => json!({ "received": true }),
        Outcome::Ignored(reason) => json!({ "received": true, "ignored": reason }),
        Outcome::NewerVersion => json!({ "received": true, "ignored": "newer api version" }),
    };
    Ok(Json(received))
}
