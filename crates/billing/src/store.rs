//! User record store abstraction.
//!
//! Records are whole JSON documents; subscription updates go through
//! [`SubscriptionPatch`] so unset fields are never clobbered. Production
//! implementation is [`postgres::PgUserStore`], tests use
//! [`memory::MemoryStore`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::types::{InvoiceStatus, SubscriptionPatch, SubscriptionStatus, UserRecord};

/// Coarse indexed filter for sweep queries. Exact time windows are refined
/// in memory by the caller; the store only narrows by indexed status fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionQuery {
    pub status: Option<SubscriptionStatus>,
    pub latest_invoice_status: Option<InvoiceStatus>,
}

impl SubscriptionQuery {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_invoice_status(mut self, status: InvoiceStatus) -> Self {
        self.latest_invoice_status = Some(status);
        self
    }

    /// In-memory equivalent of the indexed filter, shared by the memory
    /// store and by tests.
    pub fn matches(&self, record: &UserRecord) -> bool {
        let Some(sub) = record.subscription.as_ref() else {
            return false;
        };
        if let Some(status) = self.status {
            if sub.status != Some(status) {
                return false;
            }
        }
        if let Some(invoice_status) = self.latest_invoice_status {
            if sub.latest_invoice_status != Some(invoice_status) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: &str) -> BillingResult<Option<UserRecord>>;

    /// Reverse lookup by provider customer id, for webhook events whose
    /// customer metadata is missing the user id.
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserRecord>>;

    /// Record the lazily created billing identity. Set once, never changed.
    async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()>;

    async fn set_superfan(&self, user_id: &str, superfan: bool) -> BillingResult<()>;

    /// Remember the user's preferred communication language.
    async fn set_language(&self, user_id: &str, language: &str) -> BillingResult<()>;

    /// Partial update of the subscription mirror. Fields the patch leaves
    /// unset keep their stored value.
    async fn update_subscription(
        &self,
        user_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<()>;

    /// Coarse indexed query over subscription mirrors.
    async fn query_subscriptions(&self, query: SubscriptionQuery)
        -> BillingResult<Vec<UserRecord>>;
}
