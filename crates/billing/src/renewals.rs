//! Hourly renewal reconciliation.
//!
//! Invoice-collection memberships do not fail loudly when the member stops
//! paying; the sweep picks them up from the mirror. Selection is two-phase:
//! a coarse indexed store query, then exact time windows in memory. The
//! one-hour slack on the reminder and feedback windows matches the sweep
//! cadence, so each fires exactly once per membership.

use std::sync::Arc;

use futures::StreamExt;

use crate::clock::Clock;
use crate::customer;
use crate::error::BillingResult;
use crate::notifier::{Notification, Notifier};
use crate::provider::BillingProvider;
use crate::store::{SubscriptionQuery, UserStore};
use crate::types::{
    InvoiceStatus, SubscriptionPatch, SubscriptionState, SubscriptionStatus, UserRecord,
};

const DAY_SECS: i64 = 24 * 60 * 60;

/// Sweep cadence; windows of this width fire once per membership.
pub const WINDOW_SLACK_SECS: i64 = 60 * 60;

/// Only memberships past their first year are in renewal; younger past_due
/// subscriptions belong to unfinished checkouts.
pub const RENEWAL_MIN_AGE_SECS: i64 = 365 * DAY_SECS;

/// Reminder goes out five days into an unpaid renewal.
pub const REMINDER_AFTER_SECS: i64 = 5 * DAY_SECS;

/// Unpaid renewals are cancelled between one week and one month overdue.
pub const CANCEL_MIN_SECS: i64 = 7 * DAY_SECS;
pub const CANCEL_MAX_SECS: i64 = 31 * DAY_SECS;

/// Feedback request twelve days into the lapsed period, which is five days
/// after the cancellation pass forced the subscription closed.
pub const FEEDBACK_AFTER_SECS: i64 = 12 * DAY_SECS;

/// Bounded concurrency for the cancellation pass; each item is two provider
/// calls.
const MAX_CONCURRENT_CANCELS: usize = 3;

pub fn due_for_reminder(overdue_secs: i64) -> bool {
    (REMINDER_AFTER_SECS..REMINDER_AFTER_SECS + WINDOW_SLACK_SECS).contains(&overdue_secs)
}

pub fn due_for_cancellation(overdue_secs: i64) -> bool {
    (CANCEL_MIN_SECS..=CANCEL_MAX_SECS).contains(&overdue_secs)
}

pub fn due_for_feedback(overdue_secs: i64) -> bool {
    (FEEDBACK_AFTER_SECS..FEEDBACK_AFTER_SECS + WINDOW_SLACK_SECS).contains(&overdue_secs)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub reminders_sent: usize,
    pub cancelled: usize,
    pub feedback_sent: usize,
}

pub struct RenewalSweep {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl RenewalSweep {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
            clock,
        }
    }

    pub async fn run(&self) -> BillingResult<SweepStats> {
        let mut stats = SweepStats::default();
        let now = self.clock.now_secs();

        // Coarse phase: everyone whose renewal invoice is open and unpaid.
        let overdue = self
            .store
            .query_subscriptions(
                SubscriptionQuery::status(SubscriptionStatus::PastDue)
                    .with_invoice_status(InvoiceStatus::Open),
            )
            .await?;
        let in_renewal: Vec<&UserRecord> = overdue
            .iter()
            .filter(|r| {
                r.subscription
                    .as_ref()
                    .and_then(|s| s.start_date)
                    .is_some_and(|start| now - start > RENEWAL_MIN_AGE_SECS)
            })
            .collect();

        stats.reminders_sent = self.reminder_pass(&in_renewal, now).await;
        stats.cancelled = self.cancellation_pass(&in_renewal, now).await;

        // Second coarse phase for the feedback pass; cancelled memberships
        // fall out of the past_due query.
        let cancelled = self
            .store
            .query_subscriptions(SubscriptionQuery::status(SubscriptionStatus::Canceled))
            .await?;
        stats.feedback_sent = self.feedback_pass(&cancelled, now).await;

        tracing::info!(
            reminders = stats.reminders_sent,
            cancelled = stats.cancelled,
            feedback = stats.feedback_sent,
            "Renewal sweep finished"
        );
        Ok(stats)
    }

    fn overdue_secs(sub: &SubscriptionState, now: i64) -> Option<i64> {
        sub.current_period_start.map(|start| now - start)
    }

    async fn reminder_pass(&self, records: &[&UserRecord], now: i64) -> usize {
        let mut sent = 0;
        for record in records {
            let Some(sub) = record.subscription.as_ref() else {
                continue;
            };
            let due = Self::overdue_secs(sub, now).is_some_and(due_for_reminder);
            if !due {
                continue;
            }
            let Some(invoice_url) = sub.renewal_invoice_link.clone() else {
                tracing::warn!(
                    user_id = %record.user_id,
                    "Renewal reminder due but no invoice link stored, skipping"
                );
                continue;
            };
            match self.notify(record, Notification::RenewalInvoice { invoice_url }).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::error!(user_id = %record.user_id, error = %e, "Renewal reminder failed")
                }
            }
        }
        sent
    }

    /// Cancel memberships whose renewal invoice stayed unpaid past the
    /// grace window. The open invoice is voided so a later payment attempt
    /// cannot half-revive the membership.
    async fn cancellation_pass(&self, records: &[&UserRecord], now: i64) -> usize {
        let due: Vec<UserRecord> = records
            .iter()
            .filter(|r| {
                r.subscription
                    .as_ref()
                    .and_then(|s| Self::overdue_secs(s, now))
                    .is_some_and(due_for_cancellation)
            })
            .map(|r| (*r).clone())
            .collect();

        let results = futures::stream::iter(due)
            .map(|record| async move {
                match self.cancel_one(&record).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            user_id = %record.user_id,
                            error = %e,
                            "Overdue membership cancellation failed"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_CANCELS)
            .collect::<Vec<bool>>()
            .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    async fn cancel_one(&self, record: &UserRecord) -> BillingResult<()> {
        let sub_id = record
            .subscription
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        tracing::info!(user_id = %record.user_id, subscription_id = %sub_id, "Cancelling overdue membership");

        let cancelled = self.provider.cancel_subscription(&sub_id).await?;
        if let Some(invoice) = cancelled.latest_invoice.as_ref().filter(|inv| inv.is_open()) {
            self.provider.void_invoice(&invoice.id).await?;
        }
        // The deletion webhook rewrites the mirror too; writing the invoice
        // status here keeps the feedback query correct if that event lags.
        self.store
            .update_subscription(
                &record.user_id,
                &SubscriptionPatch {
                    latest_invoice_status: Some(InvoiceStatus::Void),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Keyed on the period start rather than the cancellation instant, so a
    /// manual provider-side cancellation cannot restart the countdown.
    /// Twelve days overdue is five days after the cancellation pass fired.
    async fn feedback_pass(&self, records: &[UserRecord], now: i64) -> usize {
        let mut sent = 0;
        for record in records {
            let Some(sub) = record.subscription.as_ref() else {
                continue;
            };
            let due = Self::overdue_secs(sub, now).is_some_and(due_for_feedback);
            if !due {
                continue;
            }
            // Only lapsed renewals get the feedback ask. A renewal invoice
            // link exists only once a second cycle started, and a first
            // term that never rolled over is an abandoned checkout.
            if sub.renewal_invoice_link.is_none() {
                continue;
            }
            if sub.current_period_start == sub.start_date {
                continue;
            }
            match self.notify(record, Notification::CancellationFeedback).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::error!(user_id = %record.user_id, error = %e, "Feedback request failed")
                }
            }
        }
        sent
    }

    async fn notify(&self, record: &UserRecord, notification: Notification) -> BillingResult<()> {
        let recipient = customer::recipient(record)?;
        self.notifier.send(&recipient, notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reminder_window_opens_once_fully_overdue() {
        assert!(!due_for_reminder(REMINDER_AFTER_SECS - 1));
        assert!(due_for_reminder(REMINDER_AFTER_SECS));
        assert!(due_for_reminder(REMINDER_AFTER_SECS + WINDOW_SLACK_SECS - 1));
        assert!(!due_for_reminder(REMINDER_AFTER_SECS + WINDOW_SLACK_SECS));
        // Half a sweep in, as a period start five days plus thirty minutes ago
        assert!(due_for_reminder(REMINDER_AFTER_SECS + 1800));
    }

    #[test]
    fn cancellation_window_spans_week_to_month() {
        assert!(!due_for_cancellation(CANCEL_MIN_SECS - 1));
        assert!(due_for_cancellation(CANCEL_MIN_SECS));
        assert!(due_for_cancellation(CANCEL_MAX_SECS));
        assert!(!due_for_cancellation(CANCEL_MAX_SECS + 1));
    }

    #[test]
    fn feedback_window_opens_once_fully_overdue() {
        assert!(!due_for_feedback(FEEDBACK_AFTER_SECS - 1));
        assert!(due_for_feedback(FEEDBACK_AFTER_SECS));
        assert!(due_for_feedback(FEEDBACK_AFTER_SECS + WINDOW_SLACK_SECS - 1));
        assert!(!due_for_feedback(FEEDBACK_AFTER_SECS + WINDOW_SLACK_SECS));
    }

    #[test]
    fn reminder_and_cancellation_windows_do_not_overlap() {
        // Eight days overdue cancels and no longer reminds; five days
        // overdue reminds and does not cancel yet.
        let eight_days = 8 * DAY_SECS;
        assert!(due_for_cancellation(eight_days));
        assert!(!due_for_reminder(eight_days));
        assert!(due_for_reminder(REMINDER_AFTER_SECS + 1800));
        assert!(!due_for_cancellation(REMINDER_AFTER_SECS + 1800));
    }
}
