//! Local billing state: the per-user subscription mirror and its patch type.
//!
//! The mirror is eventually consistent with Stripe and may lag it briefly;
//! it is only ever overwritten or nulled, never hard-deleted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How invoices are collected. Only ever moves from `SendInvoice` to
/// `ChargeAutomatically`, and only once a reusable off-session payment
/// method is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    SendInvoice,
    ChargeAutomatically,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    SubscriptionCreate,
    SubscriptionCycle,
    SubscriptionUpdate,
    #[serde(other)]
    Other,
}

impl BillingReason {
    /// Whether this invoice belongs to the first subscription payment.
    pub fn is_creation(&self) -> bool {
        matches!(self, BillingReason::SubscriptionCreate)
    }
}

/// The locally mirrored subscription record, one per user.
/// Timestamps are unix seconds, Stripe's native representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_invoice_status: Option<InvoiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    /// A set `cancel_at` implies cancellation at period end. A forced
    /// immediate cancellation afterwards nulls it again.
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    /// True only between provisional network approval and final settlement
    /// of a delayed-settlement payment. Doubles as the "confirmation already
    /// sent" guard for `invoice.paid`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_processing: Option<bool>,
    /// Stripe-hosted invoice link, set when a renewal invoice is finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_invoice_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_method: Option<CollectionMethod>,
}

/// Partial update for [`SubscriptionState`]. `None` fields are skipped by
/// the store, never written. The doubly-optional fields distinguish
/// "leave untouched" from "explicitly null".
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub id: Option<String>,
    pub price_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub latest_invoice_status: Option<InvoiceStatus>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub start_date: Option<i64>,
    pub cancel_at: Option<Option<i64>>,
    pub canceled_at: Option<Option<i64>>,
    pub payment_processing: Option<bool>,
    pub renewal_invoice_link: Option<String>,
    pub collection_method: Option<CollectionMethod>,
}

impl SubscriptionPatch {
    /// Apply this patch on top of an existing (or default) state.
    /// Shared by every store implementation so partial-update semantics
    /// cannot drift between them.
    pub fn apply(&self, state: &mut SubscriptionState) {
        if let Some(id) = &self.id {
            state.id = id.clone();
        }
        if let Some(v) = &self.price_id {
            state.price_id = Some(v.clone());
        }
        if let Some(v) = self.status {
            state.status = Some(v);
        }
        if let Some(v) = self.latest_invoice_status {
            state.latest_invoice_status = Some(v);
        }
        if let Some(v) = self.current_period_start {
            state.current_period_start = Some(v);
        }
        if let Some(v) = self.current_period_end {
            state.current_period_end = Some(v);
        }
        if let Some(v) = self.start_date {
            state.start_date = Some(v);
        }
        if let Some(v) = self.cancel_at {
            state.cancel_at = v;
        }
        if let Some(v) = self.canceled_at {
            state.canceled_at = v;
        }
        if let Some(v) = self.payment_processing {
            state.payment_processing = Some(v);
        }
        if let Some(v) = &self.renewal_invoice_link {
            state.renewal_invoice_link = Some(v.clone());
        }
        if let Some(v) = self.collection_method {
            state.collection_method = Some(v);
        }
    }
}

/// One user's billing document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Preferred communication language (BCP 47 subset, e.g. "nl").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Provider customer id; created lazily on first purchase attempt and
    /// never changed afterward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// The paying-member flag on the user aggregate.
    #[serde(default)]
    pub superfan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionState>,
}

impl UserRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}
