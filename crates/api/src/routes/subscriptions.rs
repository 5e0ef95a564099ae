//! Membership purchase and billing portal endpoints.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub price_id: String,
    pub locale: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub subscription_id: String,
    /// Payment intent client secret for the payment element.
    pub client_secret: String,
}

/// Start or resume a membership purchase. Retry-safe; the same pending
/// checkout returns the same client secret.
pub async fn create_or_resume(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let handle = state
        .billing
        .orchestrator
        .create_or_resume(&user_id, &request.price_id, request.locale.as_deref())
        .await?;
    Ok(Json(CheckoutResponse {
        subscription_id: handle.subscription_id,
        client_secret: handle.client_secret,
    }))
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

/// Short-lived billing portal session for the account page.
pub async fn portal_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PortalResponse>, ApiError> {
    let url = state.billing.portal.session_url(&user_id).await?;
    Ok(Json(PortalResponse { url }))
}
