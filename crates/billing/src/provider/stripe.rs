//! Stripe-backed [`BillingProvider`] implementation over async-stripe.
//!
//! All mapping between Stripe's wire objects and the domain types lives
//! here; nothing outside this module touches async-stripe types.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, ChargeId, Client, CreateBillingPortalSession, CreateCustomer,
    CreateInvoiceItem, CreateSubscription, CreateSubscriptionItems, Currency, CustomerId,
    Expandable, InvoiceId, InvoiceItemId, ListInvoiceItems, ListPaymentMethods,
    ListSubscriptions, MandateId, Object, PaymentMethodId, PaymentMethodTypeFilter, PriceId,
    SubscriptionId, SubscriptionPaymentBehavior, UpdateSubscription, UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, Charge, ChargeStatus, Customer, Invoice, InvoicePeriod, Mandate,
    OneOffInvoiceItem, PaymentIntent, PaymentMethod, PaymentMethodKind, Price,
};
use crate::types::{BillingReason, CollectionMethod, InvoiceStatus, SubscriptionStatus};

/// Metadata key linking a Stripe customer back to the local user.
pub const USER_ID_METADATA_KEY: &str = "wildpatch_id";

/// Invoice-based first invoices are due one day after finalization; Stripe
/// flips the subscription to past_due once that passes.
const FIRST_INVOICE_DAYS_UNTIL_DUE: u32 = 1;

#[derive(Clone)]
pub struct StripeProvider {
    client: Client,
}

impl StripeProvider {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Validation("STRIPE_SECRET_KEY is not set".into()))?;
        Ok(Self::new(&secret_key))
    }

    fn parse_id<T: FromStr>(&self, kind: &str, raw: &str) -> BillingResult<T> {
        raw.parse::<T>()
            .map_err(|_| BillingError::Validation(format!("invalid {kind} id: {raw}")))
    }
}

fn expandable_id<T: Object>(e: &Expandable<T>) -> String
where
    T::Id: ToString,
{
    match e {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(obj) => obj.id().to_string(),
    }
}

fn map_subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Incomplete => SubscriptionStatus::Incomplete,
        S::Trialing | S::Active => SubscriptionStatus::Active,
        S::PastDue | S::Unpaid => SubscriptionStatus::PastDue,
        _ => SubscriptionStatus::Canceled,
    }
}

fn map_invoice_status(status: stripe::InvoiceStatus) -> Option<InvoiceStatus> {
    use stripe::InvoiceStatus as S;
    match status {
        S::Draft => Some(InvoiceStatus::Draft),
        S::Open => Some(InvoiceStatus::Open),
        S::Paid => Some(InvoiceStatus::Paid),
        S::Void => Some(InvoiceStatus::Void),
        S::Uncollectible => Some(InvoiceStatus::Uncollectible),
        _ => None,
    }
}

fn map_billing_reason(reason: stripe::InvoiceBillingReason) -> BillingReason {
    use stripe::InvoiceBillingReason as R;
    match reason {
        R::SubscriptionCreate => BillingReason::SubscriptionCreate,
        R::SubscriptionCycle => BillingReason::SubscriptionCycle,
        R::SubscriptionUpdate => BillingReason::SubscriptionUpdate,
        _ => BillingReason::Other,
    }
}

fn map_collection_method(method: Option<stripe::CollectionMethod>) -> CollectionMethod {
    match method {
        Some(stripe::CollectionMethod::ChargeAutomatically) => {
            CollectionMethod::ChargeAutomatically
        }
        _ => CollectionMethod::SendInvoice,
    }
}

fn map_payment_method_kind(kind: stripe::PaymentMethodType) -> PaymentMethodKind {
    use stripe::PaymentMethodType as T;
    match kind {
        T::Card => PaymentMethodKind::Card,
        T::SepaDebit => PaymentMethodKind::SepaDebit,
        T::Bancontact => PaymentMethodKind::Bancontact,
        T::Ideal => PaymentMethodKind::Ideal,
        T::Sofort => PaymentMethodKind::Sofort,
        _ => PaymentMethodKind::Other,
    }
}

fn map_customer(customer: stripe::Customer) -> Customer {
    let deleted = customer.deleted;
    let user_id = customer
        .metadata
        .as_ref()
        .and_then(|m| m.get(USER_ID_METADATA_KEY))
        .cloned();
    Customer {
        id: customer.id.to_string(),
        email: customer.email,
        user_id,
        deleted,
    }
}

fn map_invoice(invoice: stripe::Invoice) -> Invoice {
    let first_line = invoice.lines.as_ref().and_then(|l| l.data.first());
    let price_id = first_line
        .and_then(|l| l.price.as_ref())
        .map(|p| p.id.to_string());
    let unit_amount = first_line.and_then(|l| l.price.as_ref()).and_then(|p| p.unit_amount);
    let period = first_line.and_then(|l| l.period.as_ref()).and_then(|p| {
        Some(InvoicePeriod {
            start: p.start?,
            end: p.end?,
        })
    });
    let payment_intent = invoice.payment_intent.as_ref().and_then(|pi| match pi {
        Expandable::Object(pi) => Some(PaymentIntent {
            id: pi.id.to_string(),
            client_secret: pi.client_secret.clone(),
            status: Some(pi.status.to_string()),
        }),
        Expandable::Id(id) => Some(PaymentIntent {
            id: id.to_string(),
            client_secret: None,
            status: None,
        }),
    });
    Invoice {
        id: invoice.id.to_string(),
        status: invoice.status.and_then(map_invoice_status),
        customer_id: invoice.customer.as_ref().map(expandable_id),
        customer_email: invoice.customer_email.clone(),
        billing_reason: invoice.billing_reason.map(map_billing_reason),
        subscription_id: invoice.subscription.as_ref().map(expandable_id),
        hosted_invoice_url: invoice.hosted_invoice_url.clone(),
        payment_intent,
        price_id,
        unit_amount,
        currency: invoice.currency.map(|c| c.to_string()),
        period,
        charge_id: invoice.charge.as_ref().map(expandable_id),
    }
}

fn map_subscription(sub: stripe::Subscription) -> crate::provider::Subscription {
    let first_item = sub.items.data.first();
    let latest_invoice = sub.latest_invoice.as_ref().and_then(|inv| match inv {
        Expandable::Object(inv) => Some(map_invoice((**inv).clone())),
        Expandable::Id(_) => None,
    });
    // An unexpanded latest invoice still carries its id.
    let latest_invoice = match (latest_invoice, sub.latest_invoice.as_ref()) {
        (Some(inv), _) => Some(inv),
        (None, Some(Expandable::Id(id))) => Some(Invoice {
            id: id.to_string(),
            status: None,
            customer_id: None,
            customer_email: None,
            billing_reason: None,
            subscription_id: Some(sub.id.to_string()),
            hosted_invoice_url: None,
            payment_intent: None,
            price_id: None,
            unit_amount: None,
            currency: None,
            period: None,
            charge_id: None,
        }),
        (None, _) => None,
    };
    crate::provider::Subscription {
        id: sub.id.to_string(),
        customer_id: expandable_id(&sub.customer),
        status: map_subscription_status(sub.status),
        price_id: first_item
            .and_then(|i| i.price.as_ref())
            .map(|p| p.id.to_string()),
        item_id: first_item.map(|i| i.id.to_string()),
        collection_method: map_collection_method(sub.collection_method),
        created: sub.created,
        start_date: sub.start_date,
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        cancel_at: sub.cancel_at,
        canceled_at: sub.canceled_at,
        default_payment_method: sub.default_payment_method.as_ref().map(expandable_id),
        latest_invoice,
    }
}

fn map_payment_method(pm: stripe::PaymentMethod) -> PaymentMethod {
    let kind = map_payment_method_kind(pm.type_);
    let last4 = match kind {
        PaymentMethodKind::Card => pm.card.as_ref().map(|c| c.last4.clone()),
        PaymentMethodKind::SepaDebit => pm.sepa_debit.as_ref().and_then(|s| s.last4.clone()),
        _ => None,
    };
    let generated_from_charge = pm
        .sepa_debit
        .as_ref()
        .and_then(|s| s.generated_from.as_ref())
        .and_then(|g| g.charge.as_ref())
        .map(expandable_id);
    PaymentMethod {
        id: pm.id.to_string(),
        kind,
        last4,
        generated_from_charge,
    }
}

fn map_charge(charge: stripe::Charge) -> Charge {
    let status = match charge.status {
        stripe::ChargeStatus::Pending => ChargeStatus::Pending,
        stripe::ChargeStatus::Succeeded => ChargeStatus::Succeeded,
        stripe::ChargeStatus::Failed => ChargeStatus::Failed,
    };
    let details = charge.payment_method_details.as_ref();
    // Infer the method family from whichever details object is present.
    let (payment_method_kind, iban_last4, sepa_mandate, generated_sepa_debit_mandate) =
        if let Some(sepa) = details.and_then(|d| d.sepa_debit.as_ref()) {
            (
                Some(PaymentMethodKind::SepaDebit),
                None,
                sepa.mandate.clone(),
                None,
            )
        } else if let Some(bancontact) = details.and_then(|d| d.bancontact.as_ref()) {
            (
                Some(PaymentMethodKind::Bancontact),
                bancontact.iban_last4.clone(),
                None,
                bancontact
                    .generated_sepa_debit_mandate
                    .as_ref()
                    .map(expandable_id),
            )
        } else if let Some(ideal) = details.and_then(|d| d.ideal.as_ref()) {
            (
                Some(PaymentMethodKind::Ideal),
                ideal.iban_last4.clone(),
                None,
                ideal
                    .generated_sepa_debit_mandate
                    .as_ref()
                    .map(expandable_id),
            )
        } else if details.and_then(|d| d.sofort.as_ref()).is_some() {
            (Some(PaymentMethodKind::Sofort), None, None, None)
        } else if details.and_then(|d| d.card.as_ref()).is_some() {
            (Some(PaymentMethodKind::Card), None, None, None)
        } else {
            (None, None, None, None)
        };
    Charge {
        id: charge.id.to_string(),
        status,
        network_status: charge.outcome.as_ref().and_then(|o| o.network_status.clone()),
        payment_method_kind,
        iban_last4,
        sepa_mandate,
        generated_sepa_debit_mandate,
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn create_customer(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer> {
        let mut metadata = HashMap::new();
        metadata.insert(USER_ID_METADATA_KEY.to_string(), user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = Some(name);
        params.metadata = Some(metadata);

        let customer = stripe::Customer::create(&self.client, params).await?;
        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(map_customer(customer))
    }

    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Customer> {
        let id: CustomerId = self.parse_id("customer", customer_id)?;
        let customer = stripe::Customer::retrieve(&self.client, &id, &[]).await?;
        Ok(map_customer(customer))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<crate::provider::Subscription>> {
        let id: CustomerId = self.parse_id("customer", customer_id)?;
        let params = ListSubscriptions {
            customer: Some(id),
            expand: &["data.latest_invoice", "data.latest_invoice.payment_intent"],
            ..Default::default()
        };
        let subscriptions = stripe::Subscription::list(&self.client, &params).await?;
        Ok(subscriptions.data.into_iter().map(map_subscription).collect())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<crate::provider::Subscription> {
        let id: SubscriptionId = self.parse_id("subscription", subscription_id)?;
        let sub = stripe::Subscription::retrieve(
            &self.client,
            &id,
            &["latest_invoice", "latest_invoice.payment_intent"],
        )
        .await?;
        Ok(map_subscription(sub))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<crate::provider::Subscription> {
        let id: CustomerId = self.parse_id("customer", customer_id)?;

        let mut params = CreateSubscription::new(id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        // Invoice-based collection covers cards and every redirect method
        // uniformly; the invoice is finalized manually right after creation.
        params.collection_method = Some(stripe::CollectionMethod::SendInvoice);
        params.days_until_due = Some(FIRST_INVOICE_DAYS_UNTIL_DUE);
        params.expand = &["latest_invoice"];

        let sub = stripe::Subscription::create(&self.client, params).await?;
        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %sub.id,
            price_id = %price_id,
            "Created Stripe subscription"
        );
        Ok(map_subscription(sub))
    }

    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<crate::provider::Subscription> {
        let id: SubscriptionId = self.parse_id("subscription", subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(false);
        // Invoice the change immediately; the generated prorated invoice is
        // rewritten by the orchestrator afterwards.
        params.proration_behavior = Some(SubscriptionProrationBehavior::AlwaysInvoice);
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id.to_string()),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.expand = &["latest_invoice"];

        let sub = stripe::Subscription::update(&self.client, &id, params).await?;
        Ok(map_subscription(sub))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<crate::provider::Subscription> {
        let id: SubscriptionId = self.parse_id("subscription", subscription_id)?;
        let sub =
            stripe::Subscription::cancel(&self.client, &id, CancelSubscription::default()).await?;
        tracing::info!(subscription_id = %subscription_id, "Cancelled Stripe subscription");
        Ok(map_subscription(sub))
    }

    async fn enable_auto_charge(
        &self,
        customer_id: &str,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let cust_id: CustomerId = self.parse_id("customer", customer_id)?;
        let sub_id: SubscriptionId = self.parse_id("subscription", subscription_id)?;
        let pm_id: PaymentMethodId = self.parse_id("payment method", payment_method_id)?;

        // Default payment method lives on the customer so it also covers
        // future subscriptions.
        let mut customer_params = stripe::UpdateCustomer::new();
        customer_params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(pm_id.to_string()),
            ..Default::default()
        });
        stripe::Customer::update(&self.client, &cust_id, customer_params).await?;

        let mut params = UpdateSubscription::new();
        params.collection_method = Some(stripe::CollectionMethod::ChargeAutomatically);
        params.default_payment_method = Some(&payment_method_id);
        stripe::Subscription::update(&self.client, &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            payment_method_id = %payment_method_id,
            "Switched subscription to automatic collection"
        );
        Ok(())
    }

    async fn prime_off_session(&self, subscription_id: &str) -> BillingResult<()> {
        let id: SubscriptionId = self.parse_id("subscription", subscription_id)?;
        let mut params = UpdateSubscription::new();
        params.payment_settings = Some(stripe::UpdateSubscriptionPaymentSettings {
            save_default_payment_method: Some(
                stripe::UpdateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription,
            ),
            ..Default::default()
        });
        stripe::Subscription::update(&self.client, &id, params).await?;
        Ok(())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
        let id: InvoiceId = self.parse_id("invoice", invoice_id)?;
        let invoice =
            stripe::Invoice::retrieve(&self.client, &id, &["payment_intent"]).await?;
        Ok(map_invoice(invoice))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
        let id: InvoiceId = self.parse_id("invoice", invoice_id)?;
        stripe::Invoice::finalize(&self.client, &id, Default::default()).await?;
        // Re-fetch with the payment intent expanded; finalization creates it.
        let invoice =
            stripe::Invoice::retrieve(&self.client, &id, &["payment_intent"]).await?;
        Ok(map_invoice(invoice))
    }

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
        let id: InvoiceId = self.parse_id("invoice", invoice_id)?;
        let invoice = stripe::Invoice::void(&self.client, &id).await?;
        tracing::info!(invoice_id = %invoice_id, "Voided Stripe invoice");
        Ok(map_invoice(invoice))
    }

    async fn list_invoice_item_ids(&self, invoice_id: &str) -> BillingResult<Vec<String>> {
        let id: InvoiceId = self.parse_id("invoice", invoice_id)?;
        let params = ListInvoiceItems {
            invoice: Some(id),
            ..Default::default()
        };
        let items = stripe::InvoiceItem::list(&self.client, &params).await?;
        Ok(items.data.into_iter().map(|i| i.id.to_string()).collect())
    }

    async fn delete_invoice_item(&self, invoice_item_id: &str) -> BillingResult<()> {
        let id: InvoiceItemId = self.parse_id("invoice item", invoice_item_id)?;
        stripe::InvoiceItem::delete(&self.client, &id).await?;
        Ok(())
    }

    async fn create_invoice_item(&self, item: OneOffInvoiceItem) -> BillingResult<()> {
        let customer_id: CustomerId = self.parse_id("customer", &item.customer_id)?;
        let invoice_id: InvoiceId = self.parse_id("invoice", &item.invoice_id)?;
        let subscription_id: SubscriptionId = self.parse_id("subscription", &item.subscription_id)?;
        let currency = Currency::from_str(&item.currency)
            .map_err(|_| BillingError::Validation(format!("unknown currency {}", item.currency)))?;

        let mut params = CreateInvoiceItem::new(customer_id);
        params.invoice = Some(invoice_id);
        params.subscription = Some(subscription_id);
        // A recurring price cannot be attached directly to an invoice item,
        // so the full amount goes on as unit_amount * quantity.
        params.unit_amount = Some(item.unit_amount);
        params.quantity = Some(item.quantity);
        params.currency = Some(currency);
        params.period = Some(stripe::Period {
            start: Some(item.period.start),
            end: Some(item.period.end),
        });

        stripe::InvoiceItem::create(&self.client, params).await?;
        Ok(())
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price> {
        let id: PriceId = self.parse_id("price", price_id)?;
        let price = stripe::Price::retrieve(&self.client, &id, &[]).await?;
        Ok(Price {
            id: price.id.to_string(),
            unit_amount: price.unit_amount,
            currency: price
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "eur".to_string()),
        })
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethod> {
        let id: PaymentMethodId = self.parse_id("payment method", payment_method_id)?;
        let pm = stripe::PaymentMethod::retrieve(&self.client, &id, &[]).await?;
        Ok(map_payment_method(pm))
    }

    async fn list_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>> {
        let id: CustomerId = self.parse_id("customer", customer_id)?;
        let mut methods = Vec::new();
        for type_ in [PaymentMethodTypeFilter::Card, PaymentMethodTypeFilter::SepaDebit] {
            let params = ListPaymentMethods {
                customer: Some(id.clone()),
                type_: Some(type_),
                ..Default::default()
            };
            let page = stripe::PaymentMethod::list(&self.client, &params).await?;
            methods.extend(page.data.into_iter().map(map_payment_method));
        }
        Ok(methods)
    }

    async fn retrieve_charge(&self, charge_id: &str) -> BillingResult<Charge> {
        let id: ChargeId = self.parse_id("charge", charge_id)?;
        let charge = stripe::Charge::retrieve(&self.client, &id, &[]).await?;
        Ok(map_charge(charge))
    }

    async fn retrieve_mandate(&self, mandate_id: &str) -> BillingResult<Mandate> {
        let id: MandateId = self.parse_id("mandate", mandate_id)?;
        let mandate = stripe::Mandate::retrieve(&self.client, &id, &[]).await?;
        let reference = mandate
            .payment_method_details
            .sepa_debit
            .as_ref()
            .map(|s| s.reference.clone());
        Ok(Mandate {
            id: mandate.id.to_string(),
            reference,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let id: CustomerId = self.parse_id("customer", customer_id)?;
        let mut params = CreateBillingPortalSession::new(id);
        params.return_url = Some(return_url);
        let session = stripe::BillingPortalSession::create(&self.client, params).await?;
        Ok(session.url)
    }
}
