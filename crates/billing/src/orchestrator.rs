//! Checkout orchestration: `create_or_resume` is the single entry point for
//! starting or retrying a membership purchase.
//!
//! The provider's subscription list is treated as ground truth on every
//! call; the local mirror is only written after provider operations
//! succeed. At most one active-and-paid membership can exist per user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::catalog::{resolve_locale, PriceCatalog};
use crate::clock::Clock;
use crate::customer;
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, OneOffInvoiceItem, Subscription};
use crate::store::UserStore;
use crate::types::{CollectionMethod, InvoiceStatus, SubscriptionPatch, SubscriptionStatus};

/// Incomplete checkouts older than this are abandoned: the subscription is
/// cancelled and a fresh one created instead of resuming.
pub const STALE_CHECKOUT_SECS: i64 = 24 * 60 * 60;

/// What the client needs to collect payment for a pending subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutHandle {
    pub subscription_id: String,
    pub client_secret: String,
}

pub struct Orchestrator {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn UserStore>,
    catalog: PriceCatalog,
    clock: Arc<dyn Clock>,
    // Serializes create_or_resume per user within this process. Concurrent
    // calls hitting different instances can still race; the provider list
    // re-read keeps that window narrow.
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn UserStore>,
        catalog: PriceCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            catalog,
            clock,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a membership purchase, or resume the pending one if it exists.
    ///
    /// Safe to retry: the same pending checkout returns the same payment
    /// intent. A different requested price repurposes the pending
    /// subscription in place instead of stacking a second one.
    pub async fn create_or_resume(
        &self,
        user_id: &str,
        price_id: &str,
        locale: Option<&str>,
    ) -> BillingResult<CheckoutHandle> {
        if !self.catalog.contains(price_id) {
            return Err(BillingError::Validation(format!(
                "unrecognized price id: {price_id}"
            )));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::Validation(format!("unknown user: {user_id}")))?;

        let language = resolve_locale(locale);
        if record.language.as_deref() != Some(language) {
            self.store.set_language(user_id, language).await?;
        }

        let customer_id =
            customer::ensure_customer(self.provider.as_ref(), self.store.as_ref(), &record)
                .await?;

        let subscriptions = self.provider.list_subscriptions(&customer_id).await?;
        let ours: Vec<Subscription> = subscriptions
            .into_iter()
            .filter(|s| self.catalog.contains_opt(s.price_id.as_deref()))
            .collect();

        if ours.iter().any(Subscription::is_active_and_paid) {
            return Err(BillingError::Conflict(format!(
                "user {user_id} already has an active paid membership"
            )));
        }

        let now = self.clock.now_secs();
        let mut resumable: Option<Subscription> = None;
        for sub in ours {
            if sub.status == SubscriptionStatus::Incomplete
                && now - sub.created > STALE_CHECKOUT_SECS
            {
                self.abandon_stale(user_id, &sub).await?;
                continue;
            }
            if resumable.is_none() && sub.is_resumable() {
                resumable = Some(sub);
            }
        }

        match resumable {
            Some(sub) if sub.price_id.as_deref() == Some(price_id) => self.resume(sub),
            Some(sub) => self.change_price(user_id, &customer_id, &sub, price_id).await,
            None => self.create_new(user_id, &customer_id, price_id).await,
        }
    }

    /// Cancel a checkout that went stale; its open invoice is voided so it
    /// cannot be paid later.
    async fn abandon_stale(&self, user_id: &str, sub: &Subscription) -> BillingResult<()> {
        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            age_secs = self.clock.now_secs() - sub.created,
            "Abandoning stale incomplete checkout"
        );
        self.provider.cancel_subscription(&sub.id).await?;
        if let Some(invoice) = sub.latest_invoice.as_ref().filter(|inv| inv.is_open()) {
            self.provider.void_invoice(&invoice.id).await?;
        }
        Ok(())
    }

    /// Same price, pending invoice still open: hand back the existing
    /// payment intent.
    fn resume(&self, sub: Subscription) -> BillingResult<CheckoutHandle> {
        let client_secret = sub
            .latest_invoice
            .as_ref()
            .and_then(|inv| inv.payment_intent.as_ref())
            .and_then(|pi| pi.client_secret.clone())
            .ok_or_else(|| {
                BillingError::DataConsistency(format!(
                    "resumable subscription {} has no payment intent client secret",
                    sub.id
                ))
            })?;
        tracing::info!(subscription_id = %sub.id, "Resuming pending checkout");
        Ok(CheckoutHandle {
            subscription_id: sub.id,
            client_secret,
        })
    }

    /// Repurpose the pending subscription for a different price tier.
    ///
    /// The open invoice is voided, the subscription item swapped to the new
    /// price, the prorated lines Stripe generates are dropped, and a single
    /// full-amount line for the original billing period is billed instead.
    async fn change_price(
        &self,
        user_id: &str,
        customer_id: &str,
        sub: &Subscription,
        price_id: &str,
    ) -> BillingResult<CheckoutHandle> {
        let item_id = sub.item_id.clone().ok_or_else(|| {
            BillingError::DataConsistency(format!("subscription {} has no item", sub.id))
        })?;
        let old_invoice = sub.latest_invoice.as_ref().ok_or_else(|| {
            BillingError::DataConsistency(format!("subscription {} has no invoice", sub.id))
        })?;
        let period = old_invoice.period.ok_or_else(|| {
            BillingError::DataConsistency(format!("invoice {} has no billing period", old_invoice.id))
        })?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            old_price = sub.price_id.as_deref().unwrap_or_default(),
            new_price = %price_id,
            "Switching pending checkout to a different price"
        );

        self.provider.void_invoice(&old_invoice.id).await?;
        let updated = self
            .provider
            .change_subscription_price(&sub.id, &item_id, price_id)
            .await?;
        let new_invoice = updated.latest_invoice.as_ref().ok_or_else(|| {
            BillingError::DataConsistency(format!(
                "price change on {} produced no invoice",
                sub.id
            ))
        })?;

        for item_id in self.provider.list_invoice_item_ids(&new_invoice.id).await? {
            self.provider.delete_invoice_item(&item_id).await?;
        }

        let price = self.provider.retrieve_price(price_id).await?;
        let unit_amount = price.unit_amount.ok_or_else(|| {
            BillingError::DataConsistency(format!("price {price_id} has no unit amount"))
        })?;
        self.provider
            .create_invoice_item(OneOffInvoiceItem {
                invoice_id: new_invoice.id.clone(),
                customer_id: customer_id.to_string(),
                subscription_id: sub.id.clone(),
                period,
                unit_amount,
                quantity: 1,
                currency: price.currency,
            })
            .await?;

        let finalized = self.provider.finalize_invoice(&new_invoice.id).await?;
        let client_secret = finalized
            .payment_intent
            .as_ref()
            .and_then(|pi| pi.client_secret.clone())
            .ok_or_else(|| {
                BillingError::DataConsistency(format!(
                    "finalized invoice {} has no client secret",
                    finalized.id
                ))
            })?;

        self.store
            .update_subscription(
                user_id,
                &SubscriptionPatch {
                    id: Some(sub.id.clone()),
                    price_id: Some(price_id.to_string()),
                    latest_invoice_status: Some(InvoiceStatus::Open),
                    ..Default::default()
                },
            )
            .await?;

        Ok(CheckoutHandle {
            subscription_id: sub.id.clone(),
            client_secret,
        })
    }

    async fn create_new(
        &self,
        user_id: &str,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<CheckoutHandle> {
        let sub = self
            .provider
            .create_subscription(customer_id, price_id)
            .await?;
        let invoice_id = sub
            .latest_invoice
            .as_ref()
            .map(|inv| inv.id.clone())
            .ok_or_else(|| {
                BillingError::DataConsistency(format!(
                    "new subscription {} has no first invoice",
                    sub.id
                ))
            })?;

        // Save whatever method pays this invoice for off-session renewals.
        self.provider.prime_off_session(&sub.id).await?;

        // The first invoice is left draft by the provider; finalize it now
        // so the payment intent exists before the client asks for it.
        let invoice = self.provider.finalize_invoice(&invoice_id).await?;
        let client_secret = invoice
            .payment_intent
            .as_ref()
            .and_then(|pi| pi.client_secret.clone())
            .ok_or_else(|| {
                BillingError::DataConsistency(format!(
                    "finalized invoice {invoice_id} has no client secret"
                ))
            })?;

        self.store
            .update_subscription(
                user_id,
                &SubscriptionPatch {
                    id: Some(sub.id.clone()),
                    price_id: Some(price_id.to_string()),
                    status: Some(SubscriptionStatus::Incomplete),
                    latest_invoice_status: Some(InvoiceStatus::Open),
                    current_period_start: Some(sub.current_period_start),
                    current_period_end: Some(sub.current_period_end),
                    start_date: Some(sub.start_date),
                    cancel_at: Some(None),
                    canceled_at: Some(None),
                    payment_processing: Some(false),
                    collection_method: Some(CollectionMethod::SendInvoice),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            price_id = %price_id,
            "Created new membership checkout"
        );
        Ok(CheckoutHandle {
            subscription_id: sub.id,
            client_secret,
        })
    }
}
