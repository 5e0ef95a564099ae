//! Billing identity management.
//!
//! A Stripe customer is created lazily on the first purchase attempt, with
//! the local user id stamped into its metadata. Once stored, the customer id
//! never changes for that user.

use crate::catalog::resolve_locale;
use crate::error::{BillingError, BillingResult};
use crate::notifier::Recipient;
use crate::provider::BillingProvider;
use crate::store::UserStore;
use crate::types::UserRecord;

/// Return the user's provider customer id, creating the customer first if
/// the user has none yet.
pub async fn ensure_customer(
    provider: &dyn BillingProvider,
    store: &dyn UserStore,
    record: &UserRecord,
) -> BillingResult<String> {
    if let Some(customer_id) = &record.customer_id {
        return Ok(customer_id.clone());
    }

    let email = record.email.as_deref().ok_or_else(|| {
        BillingError::DataConsistency(format!("user {} has no email", record.user_id))
    })?;
    let name = record.first_name.as_deref().unwrap_or_default();

    let customer = provider
        .create_customer(&record.user_id, email, name)
        .await?;
    store.set_customer_id(&record.user_id, &customer.id).await?;
    Ok(customer.id)
}

/// Resolve the local user id behind a provider customer: metadata first,
/// store reverse lookup as fallback for customers created before metadata
/// stamping.
pub async fn resolve_user_id(
    provider: &dyn BillingProvider,
    store: &dyn UserStore,
    customer_id: &str,
) -> BillingResult<Option<String>> {
    let customer = provider.retrieve_customer(customer_id).await?;
    if customer.deleted {
        return Ok(None);
    }
    if let Some(user_id) = customer.user_id {
        return Ok(Some(user_id));
    }
    Ok(store
        .find_by_customer(customer_id)
        .await?
        .map(|r| r.user_id))
}

/// Email recipient for a user record. Fails closed when the record has no
/// email rather than sending to an empty address.
pub fn recipient(record: &UserRecord) -> BillingResult<Recipient> {
    let email = record.email.clone().ok_or_else(|| {
        BillingError::DataConsistency(format!("user {} has no email", record.user_id))
    })?;
    Ok(Recipient {
        email,
        first_name: record.first_name.clone(),
        language: resolve_locale(record.language.as_deref()).to_string(),
    })
}
