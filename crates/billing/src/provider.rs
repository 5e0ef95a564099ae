//! Billing provider abstraction.
//!
//! Only the fields that drive decisions in the orchestrator, webhook
//! handlers and renewal sweep are modeled; everything else stays inside the
//! Stripe adapter. The production implementation is
//! [`stripe::StripeProvider`].

pub mod stripe;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::types::{BillingReason, CollectionMethod, InvoiceStatus, SubscriptionStatus};

#[derive(Debug, Clone)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    /// Local user id stamped into provider metadata at creation time.
    pub user_id: Option<String>,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoicePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub id: String,
    pub status: Option<InvoiceStatus>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub billing_reason: Option<BillingReason>,
    pub subscription_id: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub payment_intent: Option<PaymentIntent>,
    /// Price id of the first line item.
    pub price_id: Option<String>,
    /// Unit amount of the first line item, in minor units.
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    /// Billing period of the first line item.
    pub period: Option<InvoicePeriod>,
    pub charge_id: Option<String>,
}

impl Invoice {
    pub fn is_open(&self) -> bool {
        self.status == Some(InvoiceStatus::Open)
    }

    pub fn is_paid(&self) -> bool {
        self.status == Some(InvoiceStatus::Paid)
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    /// Subscription item carrying the price, needed for price changes.
    pub item_id: Option<String>,
    pub collection_method: CollectionMethod,
    pub created: i64,
    pub start_date: i64,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub default_payment_method: Option<String>,
    pub latest_invoice: Option<Invoice>,
}

impl Subscription {
    /// An active subscription whose latest invoice is paid: the one
    /// configuration that must stay unique per user.
    pub fn is_active_and_paid(&self) -> bool {
        self.status == SubscriptionStatus::Active
            && self.latest_invoice.as_ref().is_some_and(Invoice::is_paid)
    }

    /// An unfinished purchase: open latest invoice with a payment intent the
    /// client can resume.
    pub fn is_resumable(&self) -> bool {
        self.latest_invoice
            .as_ref()
            .is_some_and(|inv| inv.is_open() && inv.payment_intent.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethodKind {
    Card,
    SepaDebit,
    Bancontact,
    Ideal,
    Sofort,
    Other,
}

#[derive(Debug, Clone)]
pub struct PaymentMethod {
    pub id: String,
    pub kind: PaymentMethodKind,
    pub last4: Option<String>,
    /// For SEPA debit methods silently generated from a redirect payment
    /// (Bancontact/iDEAL): the charge that generated them.
    pub generated_from_charge: Option<String>,
}

impl PaymentMethod {
    /// Whether this method can be charged off-session for renewals.
    pub fn reusable_off_session(&self) -> bool {
        matches!(
            self.kind,
            PaymentMethodKind::Card | PaymentMethodKind::SepaDebit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Charge {
    pub id: String,
    pub status: ChargeStatus,
    /// `approved_by_network` marks provisional approval of a
    /// delayed-settlement payment.
    pub network_status: Option<String>,
    pub payment_method_kind: Option<PaymentMethodKind>,
    /// IBAN last4 on redirect-method charges (Bancontact/iDEAL).
    pub iban_last4: Option<String>,
    /// Mandate id on direct SEPA debit charges.
    pub sepa_mandate: Option<String>,
    /// Mandate generated by a redirect-method charge.
    pub generated_sepa_debit_mandate: Option<String>,
}

impl Charge {
    pub fn is_network_approved_pending(&self) -> bool {
        self.status == ChargeStatus::Pending
            && self.network_status.as_deref() == Some("approved_by_network")
    }
}

#[derive(Debug, Clone)]
pub struct Mandate {
    pub id: String,
    /// Human-readable SEPA mandate reference, shown in renewal notices.
    pub reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Price {
    pub id: String,
    pub unit_amount: Option<i64>,
    pub currency: String,
}

/// One-off line item re-added to a repriced first invoice, covering the
/// original billing period at the full new amount.
#[derive(Debug, Clone)]
pub struct OneOffInvoiceItem {
    pub invoice_id: String,
    pub customer_id: String,
    pub subscription_id: String,
    pub period: InvoicePeriod,
    pub unit_amount: i64,
    pub quantity: u64,
    pub currency: String,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_customer(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer>;
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Customer>;

    /// Fresh list of the customer's subscriptions with latest invoice and
    /// payment intent expanded. Treated as ground truth on every call.
    async fn list_subscriptions(&self, customer_id: &str) -> BillingResult<Vec<Subscription>>;
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    /// Create an invoice-based subscription (covers every payment method
    /// family at creation time) with its first invoice left draft.
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<Subscription>;

    /// In-place price change on the subscription's existing item, invoicing
    /// immediately so the generated invoice can be rewritten.
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
    ) -> BillingResult<Subscription>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    /// Switch the subscription to automatic collection with the given
    /// default payment method, restricting payment options to off-session
    /// capable ones (drops redirect-only methods).
    async fn enable_auto_charge(
        &self,
        customer_id: &str,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Ask the provider to save the payment method used for the next
    /// payment of this subscription for future off-session use.
    async fn prime_off_session(&self, subscription_id: &str) -> BillingResult<()>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<Invoice>;
    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<Invoice>;
    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<Invoice>;

    async fn list_invoice_item_ids(&self, invoice_id: &str) -> BillingResult<Vec<String>>;
    async fn delete_invoice_item(&self, invoice_item_id: &str) -> BillingResult<()>;
    async fn create_invoice_item(&self, item: OneOffInvoiceItem) -> BillingResult<()>;

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price>;
    async fn retrieve_payment_method(&self, payment_method_id: &str)
        -> BillingResult<PaymentMethod>;
    async fn list_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>>;
    async fn retrieve_charge(&self, charge_id: &str) -> BillingResult<Charge>;
    async fn retrieve_mandate(&self, mandate_id: &str) -> BillingResult<Mandate>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;
}
