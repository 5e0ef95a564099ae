//! Transactional email adapter. Posts template sends to the email provider's
//! HTTP API; template ids are resolved provider-side from a key + language.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::notifier::{Notification, Notifier, PaymentDetail, Recipient};

#[derive(Clone)]
pub struct EmailNotifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    from: &'a str,
    template: &'a str,
    language: &'a str,
    data: serde_json::Value,
}

impl EmailNotifier {
    pub fn new(api_url: String, api_key: String, sender: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            sender,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| BillingError::Validation(format!("{name} is not set")))
        };
        Ok(Self::new(
            var("EMAIL_API_URL")?,
            var("EMAIL_API_KEY")?,
            var("EMAIL_SENDER")?,
        ))
    }

    fn template_data(recipient: &Recipient, notification: &Notification) -> serde_json::Value {
        let mut data = serde_json::json!({
            "first_name": recipient.first_name,
        });
        match notification {
            Notification::RenewalUpcoming {
                portal_url,
                payment,
            } => {
                data["portal_url"] = serde_json::json!(portal_url);
                match payment {
                    PaymentDetail::Card { last4 } => {
                        data["payment_method"] = serde_json::json!("card");
                        data["last4"] = serde_json::json!(last4);
                    }
                    PaymentDetail::SepaDebit {
                        last4,
                        mandate_reference,
                    } => {
                        data["payment_method"] = serde_json::json!("sepa_debit");
                        data["last4"] = serde_json::json!(last4);
                        data["mandate_reference"] = serde_json::json!(mandate_reference);
                    }
                }
            }
            Notification::RenewalInvoice { invoice_url } => {
                data["invoice_url"] = serde_json::json!(invoice_url);
            }
            _ => {}
        }
        data
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, recipient: &Recipient, notification: Notification) -> BillingResult<()> {
        let body = SendRequest {
            to: &recipient.email,
            from: &self.sender,
            template: notification.template_key(),
            language: &recipient.language,
            data: Self::template_data(recipient, &notification),
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("email send failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "email provider returned {status}: {detail}"
            )));
        }

        tracing::info!(
            template = notification.template_key(),
            language = %recipient.language,
            "Sent member email"
        );
        Ok(())
    }
}
