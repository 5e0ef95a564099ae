//! The webhook event handlers.
//!
//! Handlers re-derive decision state from the provider instead of trusting
//! event payloads, so redelivered or reordered events converge on the same
//! mirror state. Everything is filtered through the price catalog first;
//! the Stripe account may carry other products.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::catalog::PriceCatalog;
use crate::clock::Clock;
use crate::customer;
use crate::error::{BillingError, BillingResult};
use crate::notifier::{Notification, Notifier, PaymentDetail, Recipient};
use crate::provider::{BillingProvider, PaymentMethod, PaymentMethodKind};
use crate::store::UserStore;
use crate::tasks::{Task, TaskQueue};
use crate::types::{
    CollectionMethod, InvoiceStatus, SubscriptionPatch, SubscriptionStatus, UserRecord,
};
use crate::webhooks::events::{
    EventKind, InvoiceEvent, PaymentIntentEvent, SubscriptionEvent,
};
use crate::webhooks::{sendslot, Outcome};

pub struct EventHandlers {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    queue: Arc<dyn TaskQueue>,
    catalog: PriceCatalog,
    clock: Arc<dyn Clock>,
    portal_return_url: String,
    /// Wait before the sibling re-check on subscription deletion, giving a
    /// concurrent replacement checkout time to land. Zero in tests.
    deletion_grace: Duration,
    /// How recently a sibling must have been created to count as a
    /// replacement for a deleted subscription.
    sibling_window_secs: i64,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        queue: Arc<dyn TaskQueue>,
        catalog: PriceCatalog,
        clock: Arc<dyn Clock>,
        portal_return_url: String,
        deletion_grace: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
            queue,
            catalog,
            clock,
            portal_return_url,
            deletion_grace,
            sibling_window_secs: deletion_grace.as_secs() as i64 + 10,
        }
    }

    pub async fn dispatch(&self, kind: EventKind) -> BillingResult<Outcome> {
        match kind {
            EventKind::InvoiceCreated(inv) => self.invoice_created(inv).await,
            EventKind::InvoicePaid(inv) => self.invoice_paid(inv).await,
            EventKind::InvoiceUpcoming(inv) => self.invoice_upcoming(inv).await,
            EventKind::PaymentIntentProcessing(pi) => self.payment_intent_processing(pi).await,
            EventKind::PaymentIntentPaymentFailed(pi) => {
                self.payment_intent_payment_failed(pi).await
            }
            EventKind::SubscriptionCreated(sub) => self.subscription_created(sub).await,
            EventKind::SubscriptionUpdated(sub) => self.subscription_updated(sub).await,
            EventKind::SubscriptionDeleted(sub) => self.subscription_deleted(sub).await,
            EventKind::Unhandled { event_type } => {
                tracing::debug!(event_type = %event_type, "Acknowledging unhandled event type");
                Ok(Outcome::Ignored("unhandled event type"))
            }
        }
    }

    /// Resolve the user behind a provider customer. `None` when the
    /// customer was deleted in the meantime or no local record matches;
    /// events on such customers are acknowledged rather than retried, since
    /// redelivery can never make them resolvable again.
    async fn resolve_user(&self, customer_id: &str) -> BillingResult<Option<UserRecord>> {
        let Some(user_id) =
            customer::resolve_user_id(self.provider.as_ref(), self.store.as_ref(), customer_id)
                .await?
        else {
            tracing::info!(customer_id = %customer_id, "No user behind customer, skipping event");
            return Ok(None);
        };
        let record = self.store.get(&user_id).await?;
        if record.is_none() {
            tracing::warn!(user_id = %user_id, "User record missing, skipping event");
        }
        Ok(record)
    }

    fn send_or_log(&self, recipient: Recipient, notification: Notification) -> impl std::future::Future<Output = ()> + '_ {
        let notifier = self.notifier.clone();
        async move {
            if let Err(e) = notifier.send(&recipient, notification).await {
                tracing::warn!(error = %e, "Notification send failed, continuing");
            }
        }
    }

    /// invoice.created: a renewal invoice was drafted. Finalize it so it is
    /// payable, remember the hosted link for the reminder sweep, and tell
    /// invoice-collection members their renewal is due. First invoices
    /// carry a different billing reason and are finalized by the checkout
    /// flow itself.
    async fn invoice_created(&self, inv: InvoiceEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(inv.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        if !inv
            .billing_reason
            .is_some_and(|r| r == crate::types::BillingReason::SubscriptionCycle)
        {
            return Ok(Outcome::Ignored("not a renewal invoice"));
        }
        let invoice_id = inv
            .id
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("created invoice without id".into()))?;
        let customer_id = inv
            .customer
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("invoice without customer".into()))?;
        let Some(record) = self.resolve_user(customer_id).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };

        // Stripe auto-finalizes renewal drafts on its own schedule; a slow
        // or redelivered event can lose that race. A fresh read settles it.
        let invoice = match self.provider.finalize_invoice(invoice_id).await {
            Ok(invoice) => invoice,
            Err(e) => {
                let invoice = self.provider.retrieve_invoice(invoice_id).await?;
                if invoice.status == Some(InvoiceStatus::Draft) {
                    return Err(e);
                }
                tracing::info!(invoice_id = %invoice_id, "Invoice already finalized elsewhere");
                invoice
            }
        };

        let subscription_id = invoice
            .subscription_id
            .as_deref()
            .or(inv.subscription.as_deref());
        let mut invoice_based = false;
        if let Some(subscription_id) = subscription_id {
            let sub = self.provider.retrieve_subscription(subscription_id).await?;
            if sub.collection_method == CollectionMethod::SendInvoice {
                // Whatever method pays this invoice should be saved for
                // off-session use, so next year can charge automatically.
                self.provider.prime_off_session(&sub.id).await?;
                invoice_based = true;
            }
        }

        let invoice_url = invoice.hosted_invoice_url.clone().ok_or_else(|| {
            BillingError::DataConsistency(format!(
                "finalized renewal invoice {invoice_id} has no hosted url"
            ))
        })?;
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    latest_invoice_status: invoice.status.or(Some(InvoiceStatus::Open)),
                    renewal_invoice_link: Some(invoice_url.clone()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(user_id = %record.user_id, invoice_id = %invoice_id, "Finalized renewal invoice");

        // Auto-charge members get charged without doing anything; only
        // invoice-collection members need the payment link.
        if invoice_based {
            match customer::recipient(&record) {
                Ok(recipient) => {
                    self.send_or_log(recipient, Notification::RenewalInvoice { invoice_url })
                        .await
                }
                Err(e) => tracing::warn!(error = %e, "Cannot build recipient, skipping email"),
            }
        }
        Ok(Outcome::Handled)
    }

    /// invoice.paid: the payment settled. Mirror is rebuilt from a fresh
    /// subscription read; the confirmation email is skipped when the
    /// processing handler already sent it optimistically.
    async fn invoice_paid(&self, inv: InvoiceEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(inv.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let customer_id = inv
            .customer
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("invoice without customer".into()))?;
        let subscription_id = inv
            .subscription
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("paid invoice without subscription".into()))?;

        let Some(record) = self.resolve_user(customer_id).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };
        let sub = self.provider.retrieve_subscription(subscription_id).await?;

        let already_notified = record
            .subscription
            .as_ref()
            .and_then(|s| s.payment_processing)
            .unwrap_or(false);

        self.store.set_superfan(&record.user_id, true).await?;
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    id: Some(sub.id.clone()),
                    price_id: sub.price_id.clone(),
                    status: Some(SubscriptionStatus::Active),
                    latest_invoice_status: Some(InvoiceStatus::Paid),
                    current_period_start: Some(sub.current_period_start),
                    current_period_end: Some(sub.current_period_end),
                    start_date: Some(sub.start_date),
                    payment_processing: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %sub.id,
            "Membership payment settled"
        );

        if !already_notified {
            let is_creation = inv.billing_reason.is_some_and(|r| r.is_creation());
            let notification = if is_creation {
                Notification::MembershipConfirmed
            } else {
                Notification::RenewalThankYou
            };
            match customer::recipient(&record) {
                Ok(recipient) => self.send_or_log(recipient, notification).await,
                Err(e) => tracing::warn!(error = %e, "Cannot build recipient, skipping email"),
            }
        }

        // Paying by card or SEPA leaves a reusable payment method behind;
        // switch future renewals to automatic collection.
        if sub.collection_method == CollectionMethod::SendInvoice {
            if let Err(e) = self.upgrade_to_auto_charge(&record.user_id, customer_id, &sub.id, inv.charge.as_deref()).await {
                tracing::warn!(
                    user_id = %record.user_id,
                    error = %e,
                    "Auto-charge upgrade failed, staying on invoice collection"
                );
            }
        }

        Ok(Outcome::Handled)
    }

    async fn upgrade_to_auto_charge(
        &self,
        user_id: &str,
        customer_id: &str,
        subscription_id: &str,
        charge_id: Option<&str>,
    ) -> BillingResult<()> {
        let methods = self.provider.list_payment_methods(customer_id).await?;
        // Prefer the method this very charge generated (redirect payments
        // leave a SEPA debit method behind), else any reusable one.
        let chosen: Option<&PaymentMethod> = methods
            .iter()
            .find(|m| {
                charge_id.is_some() && m.generated_from_charge.as_deref() == charge_id
            })
            .or_else(|| methods.iter().find(|m| m.reusable_off_session()));
        let Some(method) = chosen else {
            tracing::info!(user_id = %user_id, "No reusable payment method, keeping invoice collection");
            return Ok(());
        };
        self.provider
            .enable_auto_charge(customer_id, subscription_id, &method.id)
            .await?;
        self.store
            .update_subscription(
                user_id,
                &SubscriptionPatch {
                    collection_method: Some(CollectionMethod::ChargeAutomatically),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            user_id = %user_id,
            payment_method_id = %method.id,
            "Upgraded membership to automatic renewal"
        );
        Ok(())
    }

    /// payment_intent.payment_failed: final settlement of a provisionally
    /// approved delayed-settlement payment fell through. Only a membership
    /// granted optimistically by the processing handler is rolled back;
    /// without that record the event is a strict no-op.
    async fn payment_intent_payment_failed(
        &self,
        pi: PaymentIntentEvent,
    ) -> BillingResult<Outcome> {
        let Some(invoice_id) = pi.invoice.as_deref() else {
            return Ok(Outcome::Ignored("payment intent without invoice"));
        };
        let invoice = self.provider.retrieve_invoice(invoice_id).await?;
        if !self.catalog.contains_opt(invoice.price_id.as_deref()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let customer_id = invoice.customer_id.as_deref().ok_or_else(|| {
            BillingError::DataConsistency(format!("invoice {invoice_id} has no customer"))
        })?;
        let Some(record) = self.resolve_user(customer_id).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };

        let was_processing = record
            .subscription
            .as_ref()
            .and_then(|s| s.payment_processing)
            .unwrap_or(false);
        if !was_processing {
            return Ok(Outcome::Ignored("no processing payment on record"));
        }

        self.store.set_superfan(&record.user_id, false).await?;
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    latest_invoice_status: invoice.status,
                    payment_processing: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            user_id = %record.user_id,
            invoice_id = %invoice_id,
            "Delayed-settlement payment failed, optimistic grant revoked"
        );
        Ok(Outcome::Handled)
    }

    /// invoice.upcoming: an automatic renewal charge is near. Fails closed:
    /// a notice without portal link or payment details is worse than a
    /// retried event.
    async fn invoice_upcoming(&self, inv: InvoiceEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(inv.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let subscription_id = inv.subscription.as_deref().ok_or_else(|| {
            BillingError::MalformedEvent("upcoming invoice without subscription".into())
        })?;
        let sub = self.provider.retrieve_subscription(subscription_id).await?;
        if sub.collection_method != CollectionMethod::ChargeAutomatically {
            return Ok(Outcome::Ignored("manual collection, renewal sweep handles it"));
        }

        let Some(record) = self.resolve_user(&sub.customer_id).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };
        let recipient = customer::recipient(&record)?;

        let portal_url = self
            .provider
            .create_portal_session(&sub.customer_id, &self.portal_return_url)
            .await?;

        let method_id = sub.default_payment_method.as_deref().ok_or_else(|| {
            BillingError::DataConsistency(format!(
                "auto-charge subscription {} has no default payment method",
                sub.id
            ))
        })?;
        let method = self.provider.retrieve_payment_method(method_id).await?;
        let payment = self.describe_payment_method(&method).await?;

        self.notifier
            .send(
                &recipient,
                Notification::RenewalUpcoming {
                    portal_url,
                    payment,
                },
            )
            .await?;
        tracing::info!(user_id = %record.user_id, subscription_id = %sub.id, "Sent upcoming renewal notice");
        Ok(Outcome::Handled)
    }

    /// Masked payment details for the renewal notice. SEPA methods that
    /// were generated by a redirect payment find their mandate through the
    /// generating charge.
    async fn describe_payment_method(
        &self,
        method: &PaymentMethod,
    ) -> BillingResult<PaymentDetail> {
        match method.kind {
            PaymentMethodKind::SepaDebit => {
                let mut mandate_id = None;
                if let Some(charge_id) = &method.generated_from_charge {
                    let charge = self.provider.retrieve_charge(charge_id).await?;
                    mandate_id = charge
                        .generated_sepa_debit_mandate
                        .or(charge.sepa_mandate);
                }
                let mandate_reference = match mandate_id {
                    Some(id) => self.provider.retrieve_mandate(&id).await?.reference,
                    None => None,
                };
                Ok(PaymentDetail::SepaDebit {
                    last4: method.last4.clone(),
                    mandate_reference,
                })
            }
            _ => Ok(PaymentDetail::Card {
                last4: method.last4.clone(),
            }),
        }
    }

    /// payment_intent.processing: a delayed-settlement method (SOFORT, SEPA
    /// debit) was provisionally approved. Grant membership optimistically
    /// and remember that the confirmation already went out.
    async fn payment_intent_processing(&self, pi: PaymentIntentEvent) -> BillingResult<Outcome> {
        let Some(invoice_id) = pi.invoice.as_deref() else {
            return Ok(Outcome::Ignored("payment intent without invoice"));
        };
        let invoice = self.provider.retrieve_invoice(invoice_id).await?;
        if !self.catalog.contains_opt(invoice.price_id.as_deref()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let customer_id = invoice.customer_id.as_deref().ok_or_else(|| {
            BillingError::DataConsistency(format!("invoice {invoice_id} has no customer"))
        })?;
        let charge_id = invoice.charge_id.as_deref().ok_or_else(|| {
            BillingError::DataConsistency(format!("processing invoice {invoice_id} has no charge"))
        })?;
        let charge = self.provider.retrieve_charge(charge_id).await?;
        if !charge.is_network_approved_pending() {
            return Ok(Outcome::Ignored("charge not network approved"));
        }

        let Some(record) = self.resolve_user(customer_id).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };
        if record
            .subscription
            .as_ref()
            .and_then(|s| s.payment_processing)
            .unwrap_or(false)
        {
            return Ok(Outcome::Ignored("already recorded as processing"));
        }

        // Email before the flag flip: a failed send retries the whole event
        // without having marked the confirmation as sent.
        let recipient = customer::recipient(&record)?;
        let is_creation = invoice.billing_reason.is_some_and(|r| r.is_creation());
        let notification = if is_creation {
            Notification::MembershipConfirmed
        } else {
            Notification::RenewalThankYou
        };
        self.notifier.send(&recipient, notification).await?;

        self.store.set_superfan(&record.user_id, true).await?;
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    payment_processing: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            user_id = %record.user_id,
            invoice_id = %invoice_id,
            "Granted membership on network-approved pending payment"
        );
        Ok(Outcome::Handled)
    }

    /// customer.subscription.created: a checkout started. Queue the nudge
    /// for people who never finish paying, quantized to a daytime send slot.
    async fn subscription_created(&self, sub: SubscriptionEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(sub.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        if sub.mirrored_status() != Some(SubscriptionStatus::Incomplete) {
            return Ok(Outcome::Ignored("not a fresh checkout"));
        }
        let Some(record) = self.resolve_user(&sub.customer).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };
        // Slot off the checkout instant, not processing time; a delayed
        // event delivery must not shift the nudge to a later slot.
        let created = OffsetDateTime::from_unix_timestamp(sub.created).map_err(|_| {
            BillingError::MalformedEvent("subscription creation timestamp".into())
        })?;
        let run_at = sendslot::next_send_slot(created);
        self.queue
            .enqueue(
                Task::AbandonedCheckout {
                    user_id: record.user_id.clone(),
                },
                run_at,
            )
            .await?;
        tracing::info!(user_id = %record.user_id, run_at = %run_at, "Queued checkout reminder");
        Ok(Outcome::Handled)
    }

    /// customer.subscription.updated: mirror the fields we track.
    async fn subscription_updated(&self, sub: SubscriptionEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(sub.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let Some(record) = self.resolve_user(&sub.customer).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };
        let collection_method = match sub.collection_method.as_deref() {
            Some("charge_automatically") => Some(CollectionMethod::ChargeAutomatically),
            Some("send_invoice") => Some(CollectionMethod::SendInvoice),
            _ => None,
        };
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    id: Some(sub.id.clone()),
                    price_id: sub.price_id().map(str::to_string),
                    status: sub.mirrored_status(),
                    current_period_start: sub.current_period_start,
                    current_period_end: sub.current_period_end,
                    start_date: sub.start_date,
                    cancel_at: Some(sub.cancel_at),
                    canceled_at: Some(sub.canceled_at),
                    collection_method,
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(user_id = %record.user_id, subscription_id = %sub.id, "Mirrored subscription update");
        Ok(Outcome::Handled)
    }

    /// customer.subscription.deleted: the membership ended. A short grace
    /// wait plus a sibling re-check protects against the checkout flow that
    /// replaces a pending subscription; the ended email only goes to
    /// memberships that actually ran a renewal term.
    async fn subscription_deleted(&self, sub: SubscriptionEvent) -> BillingResult<Outcome> {
        if !self.catalog.contains_opt(sub.price_id()) {
            return Ok(Outcome::Ignored("foreign product"));
        }
        let Some(record) = self.resolve_user(&sub.customer).await? else {
            return Ok(Outcome::Ignored("customer no longer resolvable"));
        };

        if !self.deletion_grace.is_zero() {
            tokio::time::sleep(self.deletion_grace).await;
        }
        let siblings = self.provider.list_subscriptions(&sub.customer).await?;
        let now = self.clock.now_secs();
        let replaced = siblings.iter().any(|s| {
            s.id != sub.id
                && self.catalog.contains_opt(s.price_id.as_deref())
                && now - s.created <= self.sibling_window_secs
        });
        if replaced {
            tracing::info!(
                user_id = %record.user_id,
                subscription_id = %sub.id,
                "Deleted subscription was replaced, leaving mirror to its successor"
            );
            return Ok(Outcome::Ignored("replaced by newer subscription"));
        }

        self.store.set_superfan(&record.user_id, false).await?;
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    id: Some(sub.id.clone()),
                    status: Some(SubscriptionStatus::Canceled),
                    canceled_at: Some(sub.canceled_at.or(Some(now))),
                    cancel_at: Some(None),
                    payment_processing: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(user_id = %record.user_id, subscription_id = %sub.id, "Membership ended");

        // current_period_start == start_date means the first term never
        // renewed; those users abandoned checkout rather than lapsing.
        let ran_a_term = match (sub.current_period_start, sub.start_date) {
            (Some(period_start), Some(start)) => period_start != start,
            _ => false,
        };
        if ran_a_term {
            match customer::recipient(&record) {
                Ok(recipient) => self.send_or_log(recipient, Notification::MembershipEnded).await,
                Err(e) => tracing::warn!(error = %e, "Cannot build recipient, skipping email"),
            }
        }
        Ok(Outcome::Handled)
    }
}
