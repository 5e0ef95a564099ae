//! Billing error taxonomy.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad caller input (unknown price id, malformed identifier). No state
    /// was mutated.
    #[error("validation error: {0}")]
    Validation(String),

    /// The user already has an active and paid subscription. Surfaced to the
    /// caller to prevent double billing.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network or 5xx failure from the billing provider. The orchestrator
    /// does not retry; webhook handlers fail their response so the provider
    /// redelivers.
    #[error("billing provider error: {0}")]
    Provider(String),

    /// An expected local or provider-side field is missing. Webhook handlers
    /// fail closed on this instead of sending a broken notification.
    #[error("data consistency error: {0}")]
    DataConsistency(String),

    /// Local state store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Webhook signature did not verify over the raw body.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// The declared webhook API version is older than the accepted one.
    #[error("stale webhook API version: {0}")]
    StaleWebhookVersion(String),

    /// Malformed webhook payload.
    #[error("malformed webhook payload: {0}")]
    MalformedEvent(String),

    /// Task queue failure.
    #[error("task queue error: {0}")]
    TaskQueue(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Provider(e.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Store(e.to_string())
    }
}
