// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wildpatch Membership Billing
//!
//! Handles Stripe integration for the yearly "superfan" membership.
//!
//! ## Features
//!
//! - **Checkout orchestration**: create-or-resume purchase flow with stale
//!   checkout reset and in-place price changes
//! - **Webhooks**: signature-verified, version-gated Stripe event handling
//! - **Renewal reconciliation**: hourly reminder / cancellation / feedback
//!   sweep over unpaid renewals
//! - **Auto-charge upgrade**: invoice collection switches to automatic
//!   charging once a reusable payment method exists
//! - **Email notifications**: confirmations, reminders, failure and
//!   end-of-membership messages
//! - **Billing portal**: self-service session links

pub mod catalog;
pub mod clock;
pub mod customer;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod portal;
pub mod provider;
pub mod renewals;
pub mod store;
pub mod tasks;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use catalog::{resolve_locale, PriceCatalog, DEFAULT_LOCALE, SUPPORTED_LOCALES};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{BillingError, BillingResult};
pub use notifier::{Notification, Notifier, PaymentDetail, Recipient};
pub use orchestrator::{CheckoutHandle, Orchestrator};
pub use portal::PortalService;
pub use provider::{stripe::StripeProvider, BillingProvider};
pub use renewals::{RenewalSweep, SweepStats};
pub use store::{memory::MemoryStore, postgres::PgUserStore, SubscriptionQuery, UserStore};
pub use tasks::{postgres::PgTaskQueue, Task, TaskQueue, TaskRunner};
pub use types::{
    BillingReason, CollectionMethod, InvoiceStatus, SubscriptionPatch, SubscriptionState,
    SubscriptionStatus, UserRecord,
};
pub use webhooks::{Outcome, WebhookRouter, ACCEPTED_API_VERSION};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use notifier::email::EmailNotifier;
use webhooks::handlers::EventHandlers;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub orchestrator: Orchestrator,
    pub webhooks: WebhookRouter,
    pub renewals: RenewalSweep,
    pub portal: PortalService,
    pub tasks: PgTaskQueue,
    pub task_runner: TaskRunner,
    pub store: Arc<dyn UserStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let env = |name: &str| {
            std::env::var(name)
                .map_err(|_| BillingError::Validation(format!("{name} is not set")))
        };

        let provider: Arc<dyn BillingProvider> = Arc::new(StripeProvider::from_env()?);
        let store: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pool.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(EmailNotifier::from_env()?);
        let queue = PgTaskQueue::new(pool);
        let catalog = PriceCatalog::from_env()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let webhook_secret = env("STRIPE_WEBHOOK_SECRET")?;
        let portal_return_url = env("PORTAL_RETURN_URL")?;
        let deletion_grace_secs = std::env::var("WEBHOOK_DELETION_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10u64);

        let handlers = EventHandlers::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            Arc::new(queue.clone()),
            catalog.clone(),
            clock.clone(),
            portal_return_url.clone(),
            Duration::from_secs(deletion_grace_secs),
        );
        let task_runner = TaskRunner::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            catalog.clone(),
            clock.clone(),
        );

        Ok(Self {
            orchestrator: Orchestrator::new(
                provider.clone(),
                store.clone(),
                catalog,
                clock.clone(),
            ),
            webhooks: WebhookRouter::new(webhook_secret, handlers, clock.clone()),
            renewals: RenewalSweep::new(
                provider.clone(),
                store.clone(),
                notifier.clone(),
                clock,
            ),
            portal: PortalService::new(provider, store.clone(), portal_return_url),
            tasks: queue,
            task_runner,
            store,
            notifier,
        })
    }
}
