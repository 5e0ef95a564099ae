//! Outbound member email. Template content lives with the email provider;
//! this module only names the messages and carries their dynamic payloads.
//!
//! Notification failures are logged and swallowed by callers. A committed
//! billing state change is never rolled back because an email did not go out.

pub mod email;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::BillingResult;

/// Who the message goes to, in their preferred language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub first_name: Option<String>,
    pub language: String,
}

/// Masked payment details shown in renewal notices. Full numbers never
/// leave the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDetail {
    Card {
        last4: Option<String>,
    },
    SepaDebit {
        last4: Option<String>,
        mandate_reference: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// First membership payment settled.
    MembershipConfirmed,
    /// A renewal payment settled.
    RenewalThankYou,
    /// Upcoming automatic renewal notice with portal link and the payment
    /// method that will be charged.
    RenewalUpcoming {
        portal_url: String,
        payment: PaymentDetail,
    },
    /// Manual-collection renewal reminder carrying the open invoice link.
    RenewalInvoice { invoice_url: String },
    /// Membership ended after running its full term.
    MembershipEnded,
    /// Post-cancellation feedback request.
    CancellationFeedback,
    /// Started checkout but never paid.
    CheckoutReminder,
}

impl Notification {
    /// Stable key used to select the provider-side template.
    pub fn template_key(&self) -> &'static str {
        match self {
            Notification::MembershipConfirmed => "membership_confirmed",
            Notification::RenewalThankYou => "renewal_thank_you",
            Notification::RenewalUpcoming { .. } => "renewal_upcoming",
            Notification::RenewalInvoice { .. } => "renewal_invoice",
            Notification::MembershipEnded => "membership_ended",
            Notification::CancellationFeedback => "cancellation_feedback",
            Notification::CheckoutReminder => "checkout_reminder",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &Recipient, notification: Notification) -> BillingResult<()>;
}

/// Test double that records every send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Recipient, Notification)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Recipient, Notification)> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn sent_keys(&self) -> Vec<&'static str> {
        self.sent()
            .iter()
            .map(|(_, n)| n.template_key())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &Recipient, notification: Notification) -> BillingResult<()> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((recipient.clone(), notification));
        Ok(())
    }
}
