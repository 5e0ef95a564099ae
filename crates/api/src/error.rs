//! HTTP error mapping for the API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use wildpatch_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Billing(e) => match e {
                BillingError::Validation(_)
                | BillingError::WebhookSignatureInvalid
                | BillingError::StaleWebhookVersion(_)
                | BillingError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
                BillingError::Conflict(_) => StatusCode::CONFLICT,
                // Transient upstream failures; webhook senders retry on these.
                BillingError::Provider(_) => StatusCode::BAD_GATEWAY,
                BillingError::DataConsistency(_)
                | BillingError::Store(_)
                | BillingError::TaskQueue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, status = %status, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
