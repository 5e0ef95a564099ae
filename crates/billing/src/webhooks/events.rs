//! Wire shapes of the webhook events we consume.
//!
//! Events deserialize into a closed tagged union; types we receive but do
//! not act on land in [`EventKind::Unhandled`] so the dispatcher can
//! acknowledge them explicitly.

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::types::{BillingReason, InvoiceStatus, SubscriptionStatus};

/// Raw webhook envelope, deserialized straight off the request body.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub api_version: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    InvoiceCreated(InvoiceEvent),
    InvoicePaid(InvoiceEvent),
    InvoiceUpcoming(InvoiceEvent),
    PaymentIntentProcessing(PaymentIntentEvent),
    PaymentIntentPaymentFailed(PaymentIntentEvent),
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    SubscriptionDeleted(SubscriptionEvent),
    Unhandled { event_type: String },
}

impl EventKind {
    pub fn from_event(event: &Event) -> BillingResult<Self> {
        fn parse<T: serde::de::DeserializeOwned>(event: &Event) -> BillingResult<T> {
            serde_json::from_value(event.data.object.clone()).map_err(|e| {
                BillingError::MalformedEvent(format!("{} object: {e}", event.event_type))
            })
        }

        Ok(match event.event_type.as_str() {
            "invoice.created" => EventKind::InvoiceCreated(parse(event)?),
            "invoice.paid" => EventKind::InvoicePaid(parse(event)?),
            "invoice.upcoming" => EventKind::InvoiceUpcoming(parse(event)?),
            "payment_intent.processing" => EventKind::PaymentIntentProcessing(parse(event)?),
            "payment_intent.payment_failed" => {
                EventKind::PaymentIntentPaymentFailed(parse(event)?)
            }
            "customer.subscription.created" => EventKind::SubscriptionCreated(parse(event)?),
            "customer.subscription.updated" => EventKind::SubscriptionUpdated(parse(event)?),
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted(parse(event)?),
            other => EventKind::Unhandled {
                event_type: other.to_string(),
            },
        })
    }
}

/// Invoice object as it appears inside invoice.* events. Identifiers only;
/// anything decision-critical is re-fetched from the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceEvent {
    /// Absent on invoice.upcoming, which describes an invoice that does not
    /// exist yet.
    pub id: Option<String>,
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    pub subscription: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub billing_reason: Option<BillingReason>,
    pub hosted_invoice_url: Option<String>,
    pub charge: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub lines: InvoiceEventLines,
}

impl InvoiceEvent {
    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .data
            .first()
            .and_then(|l| l.price.as_ref())
            .map(|p| p.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceEventLines {
    #[serde(default)]
    pub data: Vec<InvoiceEventLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceEventLine {
    pub price: Option<EventPrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPrice {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentEvent {
    pub id: String,
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEvent {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub created: i64,
    pub start_date: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub collection_method: Option<String>,
    #[serde(default)]
    pub items: SubscriptionEventItems,
}

impl SubscriptionEvent {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|i| i.price.as_ref())
            .map(|p| p.id.as_str())
    }

    /// Collapse the provider's status vocabulary onto the mirrored one.
    pub fn mirrored_status(&self) -> Option<SubscriptionStatus> {
        match self.status.as_str() {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" | "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "incomplete_expired" | "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionEventItems {
    #[serde(default)]
    pub data: Vec<SubscriptionEventItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEventItem {
    pub price: Option<EventPrice>,
}
