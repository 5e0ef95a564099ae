//! Delayed task queue. The only producer today is the abandoned-checkout
//! reminder scheduled from `customer.subscription.created`; the worker
//! drains due tasks once a minute.

pub mod postgres;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::{resolve_locale, PriceCatalog};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::notifier::{Notification, Notifier, Recipient};
use crate::provider::BillingProvider;
use crate::store::UserStore;

/// A second checkout within this window re-enqueues the reminder; only one
/// nudge may actually send.
const RECENT_CHECKOUT_WINDOW_SECS: i64 = 14 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// Nudge a user who started checkout but never completed payment.
    AbandonedCheckout { user_id: String },
}

impl Task {
    pub fn task_type(&self) -> &'static str {
        match self {
            Task::AbandonedCheckout { .. } => "abandoned_checkout",
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule a task for execution at or after `run_at`.
    async fn enqueue(&self, task: Task, run_at: OffsetDateTime) -> BillingResult<()>;
}

/// Runs claimed tasks in the worker.
pub struct TaskRunner {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    catalog: PriceCatalog,
    clock: Arc<dyn Clock>,
}

impl TaskRunner {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        catalog: PriceCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
            catalog,
            clock,
        }
    }

    pub async fn run(&self, task: &Task) -> BillingResult<()> {
        match task {
            Task::AbandonedCheckout { user_id } => self.abandoned_checkout(user_id).await,
        }
    }

    /// Checkout reminder, skipped when the user completed payment in the
    /// meantime or already got a nudge for a recent checkout attempt.
    async fn abandoned_checkout(&self, user_id: &str) -> BillingResult<()> {
        let Some(record) = self.store.get(user_id).await? else {
            tracing::warn!(user_id = %user_id, "Checkout reminder for unknown user, dropping");
            return Ok(());
        };
        if record.superfan {
            tracing::info!(user_id = %user_id, "User already paid, skipping checkout reminder");
            return Ok(());
        }
        // Every subscription.created enqueues one of these; a retried
        // checkout would otherwise nudge the same person twice.
        if let Some(customer_id) = record.customer_id.as_deref() {
            let subs = self.provider.list_subscriptions(customer_id).await?;
            let cutoff = self.clock.now_secs() - RECENT_CHECKOUT_WINDOW_SECS;
            let recent = subs
                .iter()
                .filter(|s| {
                    self.catalog.contains_opt(s.price_id.as_deref()) && s.created >= cutoff
                })
                .count();
            if recent > 1 {
                tracing::info!(
                    user_id = %user_id,
                    recent_checkouts = recent,
                    "Multiple recent checkouts, one reminder is enough"
                );
                return Ok(());
            }
        }
        let email = record.email.clone().ok_or_else(|| {
            BillingError::DataConsistency(format!("user {user_id} has no email"))
        })?;
        let recipient = Recipient {
            email,
            first_name: record.first_name.clone(),
            language: resolve_locale(record.language.as_deref()).to_string(),
        };
        self.notifier
            .send(&recipient, Notification::CheckoutReminder)
            .await?;
        Ok(())
    }
}

/// Test double that records enqueued tasks.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<(Task, OffsetDateTime)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> Vec<(Task, OffsetDateTime)> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task, run_at: OffsetDateTime) -> BillingResult<()> {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((task, run_at));
        Ok(())
    }
}
