//! Billing portal sessions for the account page.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::UserStore;

pub struct PortalService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn UserStore>,
    return_url: String,
}

impl PortalService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn UserStore>,
        return_url: String,
    ) -> Self {
        Self {
            provider,
            store,
            return_url,
        }
    }

    /// Short-lived portal URL for the user's billing self-service. Users
    /// without a billing identity have nothing to manage.
    pub async fn session_url(&self, user_id: &str) -> BillingResult<String> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::Validation(format!("unknown user: {user_id}")))?;
        let customer_id = record.customer_id.as_deref().ok_or_else(|| {
            BillingError::Validation(format!("user {user_id} has no billing account"))
        })?;
        self.provider
            .create_portal_session(customer_id, &self.return_url)
            .await
    }
}
