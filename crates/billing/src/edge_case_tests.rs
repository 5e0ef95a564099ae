// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Membership Billing
//!
//! Tests critical boundary conditions in:
//! - Checkout orchestration (resume, staleness, price change, conflicts)
//! - Webhook handlers (idempotence, notify guard, sibling re-check)
//! - Renewal sweep windows (reminder, cancellation, feedback)
//! - Queued task execution

mod fakes {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{BillingError, BillingResult};
    use crate::provider::{
        BillingProvider, Charge, Customer, Invoice, InvoicePeriod, Mandate, OneOffInvoiceItem,
        PaymentIntent, PaymentMethod, Price, Subscription,
    };
    use crate::types::{BillingReason, CollectionMethod, InvoiceStatus, SubscriptionStatus};

    pub const T0: i64 = 1_700_000_000;
    pub const DAY: i64 = 24 * 60 * 60;
    pub const YEAR: i64 = 365 * DAY;

    #[derive(Default)]
    pub struct Inner {
        pub now: i64,
        pub seq: u64,
        pub customers: HashMap<String, Customer>,
        pub subs: BTreeMap<String, Subscription>,
        pub invoices: HashMap<String, Invoice>,
        pub invoice_items: HashMap<String, Vec<String>>,
        pub methods: Vec<PaymentMethod>,
        pub charges: HashMap<String, Charge>,
        pub mandates: HashMap<String, Mandate>,
        pub prices: HashMap<String, Price>,
        pub calls: Vec<String>,
    }

    pub struct FakeProvider {
        inner: Mutex<Inner>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            let mut inner = Inner {
                now: T0,
                ..Default::default()
            };
            inner.prices.insert(
                "price_normal".into(),
                Price {
                    id: "price_normal".into(),
                    unit_amount: Some(6000),
                    currency: "eur".into(),
                },
            );
            inner.prices.insert(
                "price_reduced".into(),
                Price {
                    id: "price_reduced".into(),
                    unit_amount: Some(3600),
                    currency: "eur".into(),
                },
            );
            Self {
                inner: Mutex::new(inner),
            }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
            f(&mut self.inner.lock().unwrap_or_else(|p| p.into_inner()))
        }

        pub fn calls(&self) -> Vec<String> {
            self.with(|i| i.calls.clone())
        }

        fn refreshed(inner: &Inner, sub: &Subscription) -> Subscription {
            let mut sub = sub.clone();
            if let Some(inv) = sub.latest_invoice.as_ref() {
                if let Some(current) = inner.invoices.get(&inv.id) {
                    sub.latest_invoice = Some(current.clone());
                }
            }
            sub
        }
    }

    pub fn invoice(
        id: &str,
        customer: &str,
        subscription: &str,
        reason: BillingReason,
        status: InvoiceStatus,
        price_id: &str,
        period: (i64, i64),
    ) -> Invoice {
        Invoice {
            id: id.into(),
            status: Some(status),
            customer_id: Some(customer.into()),
            customer_email: None,
            billing_reason: Some(reason),
            subscription_id: Some(subscription.into()),
            hosted_invoice_url: Some(format!("https://invoice.test/{id}")),
            payment_intent: None,
            price_id: Some(price_id.into()),
            unit_amount: Some(6000),
            currency: Some("eur".into()),
            period: Some(InvoicePeriod {
                start: period.0,
                end: period.1,
            }),
            charge_id: None,
        }
    }

    pub fn subscription(
        id: &str,
        customer: &str,
        price_id: &str,
        status: SubscriptionStatus,
        created: i64,
    ) -> Subscription {
        Subscription {
            id: id.into(),
            customer_id: customer.into(),
            status,
            price_id: Some(price_id.into()),
            item_id: Some(format!("si_{id}")),
            collection_method: CollectionMethod::SendInvoice,
            created,
            start_date: created,
            current_period_start: created,
            current_period_end: created + YEAR,
            cancel_at: None,
            canceled_at: None,
            default_payment_method: None,
            latest_invoice: None,
        }
    }

    #[async_trait]
    impl BillingProvider for FakeProvider {
        async fn create_customer(
            &self,
            user_id: &str,
            email: &str,
            _name: &str,
        ) -> BillingResult<Customer> {
            self.with(|i| {
                i.seq += 1;
                let customer = Customer {
                    id: format!("cus_{}", i.seq),
                    email: Some(email.into()),
                    user_id: Some(user_id.into()),
                    deleted: false,
                };
                i.customers.insert(customer.id.clone(), customer.clone());
                i.calls.push(format!("create_customer:{user_id}"));
                Ok(customer)
            })
        }

        async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Customer> {
            self.with(|i| {
                i.customers
                    .get(customer_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider(format!("no customer {customer_id}")))
            })
        }

        async fn list_subscriptions(&self, customer_id: &str) -> BillingResult<Vec<Subscription>> {
            self.with(|i| {
                Ok(i.subs
                    .values()
                    .filter(|s| s.customer_id == customer_id)
                    .map(|s| Self::refreshed(i, s))
                    .collect())
            })
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Subscription> {
            self.with(|i| {
                i.subs
                    .get(subscription_id)
                    .map(|s| Self::refreshed(i, s))
                    .ok_or_else(|| {
                        BillingError::Provider(format!("no subscription {subscription_id}"))
                    })
            })
        }

        async fn create_subscription(
            &self,
            customer_id: &str,
            price_id: &str,
        ) -> BillingResult<Subscription> {
            self.with(|i| {
                i.seq += 1;
                let sub_id = format!("sub_{}", i.seq);
                let invoice_id = format!("in_{}", i.seq);
                let inv = invoice(
                    &invoice_id,
                    customer_id,
                    &sub_id,
                    BillingReason::SubscriptionCreate,
                    InvoiceStatus::Draft,
                    price_id,
                    (i.now, i.now + YEAR),
                );
                let mut sub = subscription(
                    &sub_id,
                    customer_id,
                    price_id,
                    SubscriptionStatus::Incomplete,
                    i.now,
                );
                sub.latest_invoice = Some(inv.clone());
                i.invoices.insert(invoice_id.clone(), inv);
                i.invoice_items
                    .insert(invoice_id, vec![format!("ii_base_{}", i.seq)]);
                i.subs.insert(sub_id.clone(), sub.clone());
                i.calls.push(format!("create_subscription:{price_id}"));
                Ok(sub)
            })
        }

        async fn change_subscription_price(
            &self,
            subscription_id: &str,
            _item_id: &str,
            price_id: &str,
        ) -> BillingResult<Subscription> {
            self.with(|i| {
                i.seq += 1;
                let invoice_id = format!("in_{}", i.seq);
                let now = i.now;
                let prorate_id = format!("ii_prorate_{}", i.seq);
                let sub = i
                    .subs
                    .get_mut(subscription_id)
                    .ok_or_else(|| BillingError::Provider("no subscription".into()))?;
                sub.price_id = Some(price_id.into());
                let inv = invoice(
                    &invoice_id,
                    &sub.customer_id.clone(),
                    subscription_id,
                    BillingReason::SubscriptionUpdate,
                    InvoiceStatus::Draft,
                    price_id,
                    (now, now + YEAR),
                );
                sub.latest_invoice = Some(inv.clone());
                let result = sub.clone();
                i.invoices.insert(invoice_id.clone(), inv);
                i.invoice_items.insert(invoice_id, vec![prorate_id]);
                i.calls.push(format!("change_price:{price_id}"));
                Ok(result)
            })
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Subscription> {
            self.with(|i| {
                let now = i.now;
                let sub = i
                    .subs
                    .get_mut(subscription_id)
                    .ok_or_else(|| BillingError::Provider("no subscription".into()))?;
                sub.status = SubscriptionStatus::Canceled;
                sub.canceled_at = Some(now);
                let result = sub.clone();
                i.calls.push(format!("cancel:{subscription_id}"));
                Ok(Self::refreshed(i, &result))
            })
        }

        async fn enable_auto_charge(
            &self,
            _customer_id: &str,
            subscription_id: &str,
            payment_method_id: &str,
        ) -> BillingResult<()> {
            self.with(|i| {
                let sub = i
                    .subs
                    .get_mut(subscription_id)
                    .ok_or_else(|| BillingError::Provider("no subscription".into()))?;
                sub.collection_method = CollectionMethod::ChargeAutomatically;
                sub.default_payment_method = Some(payment_method_id.into());
                i.calls
                    .push(format!("enable_auto_charge:{payment_method_id}"));
                Ok(())
            })
        }

        async fn prime_off_session(&self, subscription_id: &str) -> BillingResult<()> {
            self.with(|i| {
                i.calls.push(format!("prime_off_session:{subscription_id}"));
                Ok(())
            })
        }

        async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
            self.with(|i| {
                i.invoices
                    .get(invoice_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider(format!("no invoice {invoice_id}")))
            })
        }

        async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
            self.with(|i| {
                let inv = i
                    .invoices
                    .get_mut(invoice_id)
                    .ok_or_else(|| BillingError::Provider("no invoice".into()))?;
                if inv.status != Some(InvoiceStatus::Draft) {
                    return Err(BillingError::Provider(format!(
                        "invoice {invoice_id} is already finalized"
                    )));
                }
                inv.status = Some(InvoiceStatus::Open);
                inv.payment_intent = Some(PaymentIntent {
                    id: format!("pi_{invoice_id}"),
                    client_secret: Some(format!("cs_{invoice_id}")),
                    status: Some("requires_payment_method".into()),
                });
                let result = inv.clone();
                i.calls.push(format!("finalize:{invoice_id}"));
                Ok(result)
            })
        }

        async fn void_invoice(&self, invoice_id: &str) -> BillingResult<Invoice> {
            self.with(|i| {
                let inv = i
                    .invoices
                    .get_mut(invoice_id)
                    .ok_or_else(|| BillingError::Provider("no invoice".into()))?;
                inv.status = Some(InvoiceStatus::Void);
                let result = inv.clone();
                i.calls.push(format!("void:{invoice_id}"));
                Ok(result)
            })
        }

        async fn list_invoice_item_ids(&self, invoice_id: &str) -> BillingResult<Vec<String>> {
            self.with(|i| Ok(i.invoice_items.get(invoice_id).cloned().unwrap_or_default()))
        }

        async fn delete_invoice_item(&self, invoice_item_id: &str) -> BillingResult<()> {
            self.with(|i| {
                for items in i.invoice_items.values_mut() {
                    items.retain(|id| id != invoice_item_id);
                }
                i.calls.push(format!("delete_item:{invoice_item_id}"));
                Ok(())
            })
        }

        async fn create_invoice_item(&self, item: OneOffInvoiceItem) -> BillingResult<()> {
            self.with(|i| {
                i.seq += 1;
                let id = format!("ii_oneoff_{}", i.seq);
                i.invoice_items
                    .entry(item.invoice_id.clone())
                    .or_default()
                    .push(id);
                i.calls.push(format!(
                    "create_item:{}:{}:{}",
                    item.invoice_id, item.unit_amount, item.period.start
                ));
                Ok(())
            })
        }

        async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price> {
            self.with(|i| {
                i.prices
                    .get(price_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider(format!("no price {price_id}")))
            })
        }

        async fn retrieve_payment_method(
            &self,
            payment_method_id: &str,
        ) -> BillingResult<PaymentMethod> {
            self.with(|i| {
                i.methods
                    .iter()
                    .find(|m| m.id == payment_method_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider("no payment method".into()))
            })
        }

        async fn list_payment_methods(
            &self,
            _customer_id: &str,
        ) -> BillingResult<Vec<PaymentMethod>> {
            self.with(|i| Ok(i.methods.clone()))
        }

        async fn retrieve_charge(&self, charge_id: &str) -> BillingResult<Charge> {
            self.with(|i| {
                i.charges
                    .get(charge_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider(format!("no charge {charge_id}")))
            })
        }

        async fn retrieve_mandate(&self, mandate_id: &str) -> BillingResult<Mandate> {
            self.with(|i| {
                i.mandates
                    .get(mandate_id)
                    .cloned()
                    .ok_or_else(|| BillingError::Provider(format!("no mandate {mandate_id}")))
            })
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            _return_url: &str,
        ) -> BillingResult<String> {
            self.with(|i| {
                i.calls.push(format!("portal:{customer_id}"));
                Ok(format!("https://billing.test/portal/{customer_id}"))
            })
        }
    }
}

mod orchestrator_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::fakes::{FakeProvider, DAY, T0};
    use crate::catalog::PriceCatalog;
    use crate::clock::FixedClock;
    use crate::error::BillingError;
    use crate::orchestrator::Orchestrator;
    use crate::store::memory::MemoryStore;
    use crate::store::UserStore;
    use crate::types::{InvoiceStatus, SubscriptionStatus, UserRecord};

    fn catalog() -> PriceCatalog {
        let mut prices = BTreeMap::new();
        prices.insert("normal".to_string(), "price_normal".to_string());
        prices.insert("reduced".to_string(), "price_reduced".to_string());
        PriceCatalog::new(prices)
    }

    fn member(user_id: &str) -> UserRecord {
        UserRecord {
            user_id: user_id.into(),
            email: Some("ann@example.test".into()),
            first_name: Some("Ann".into()),
            language: Some("nl".into()),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<FakeProvider>, Arc<MemoryStore>, FixedClock, Orchestrator) {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let clock = FixedClock::at(T0);
        store.insert(member("user1"));
        let orchestrator = Orchestrator::new(
            provider.clone(),
            store.clone(),
            catalog(),
            Arc::new(clock.clone()),
        );
        (provider, store, clock, orchestrator)
    }

    // =========================================================================
    // Unknown price id is rejected before any provider call
    // =========================================================================
    #[tokio::test]
    async fn rejects_unknown_price() {
        let (provider, _store, _clock, orch) = setup();
        let result = orch.create_or_resume("user1", "price_other", Some("nl")).await;
        assert!(matches!(result, Err(BillingError::Validation(_))));
        assert!(provider.calls().is_empty(), "No provider call expected");
    }

    // =========================================================================
    // First purchase: customer created lazily, first invoice finalized,
    // mirror written as incomplete/open
    // =========================================================================
    #[tokio::test]
    async fn creates_customer_and_checkout_on_first_purchase() {
        let (provider, store, _clock, orch) = setup();
        let handle = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();
        assert!(handle.client_secret.starts_with("cs_"));

        let record = store.get("user1").await.unwrap().unwrap();
        assert!(record.customer_id.is_some(), "Customer id should be stored");
        let sub = record.subscription.unwrap();
        assert_eq!(sub.id, handle.subscription_id);
        assert_eq!(sub.status, Some(SubscriptionStatus::Incomplete));
        assert_eq!(sub.latest_invoice_status, Some(InvoiceStatus::Open));

        let calls = provider.calls();
        assert!(calls.iter().any(|c| c.starts_with("create_customer")));
        assert!(calls.iter().any(|c| c.starts_with("finalize")));
    }

    // =========================================================================
    // Retry with the same price resumes the pending checkout: same
    // subscription, same client secret, no second subscription
    // =========================================================================
    #[tokio::test]
    async fn retry_is_idempotent() {
        let (provider, _store, _clock, orch) = setup();
        let first = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();
        let second = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.with(|i| i.subs.len()), 1, "No duplicate subscription");
    }

    // =========================================================================
    // An active and paid membership blocks a second purchase
    // =========================================================================
    #[tokio::test]
    async fn active_paid_membership_conflicts() {
        let (provider, store, _clock, orch) = setup();
        store.set_customer_id("user1", "cus_1").await.unwrap();
        provider.with(|i| {
            let mut sub = super::fakes::subscription(
                "sub_paid",
                "cus_1",
                "price_normal",
                SubscriptionStatus::Active,
                T0 - 100 * DAY,
            );
            let inv = super::fakes::invoice(
                "in_paid",
                "cus_1",
                "sub_paid",
                crate::types::BillingReason::SubscriptionCreate,
                InvoiceStatus::Paid,
                "price_normal",
                (T0 - 100 * DAY, T0 + 265 * DAY),
            );
            sub.latest_invoice = Some(inv.clone());
            i.invoices.insert("in_paid".into(), inv);
            i.subs.insert("sub_paid".into(), sub);
        });

        let result = orch.create_or_resume("user1", "price_normal", None).await;
        assert!(matches!(result, Err(BillingError::Conflict(_))));
    }

    // =========================================================================
    // An incomplete checkout older than a day is abandoned: cancelled,
    // invoice voided, and a fresh subscription created
    // =========================================================================
    #[tokio::test]
    async fn stale_checkout_is_reset() {
        let (provider, _store, clock, orch) = setup();
        let first = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();

        clock.advance(25 * 60 * 60);
        provider.with(|i| i.now += 25 * 60 * 60);

        let second = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();
        assert_ne!(first.subscription_id, second.subscription_id);

        let old = provider.with(|i| i.subs.get(&first.subscription_id).cloned().unwrap());
        assert_eq!(old.status, SubscriptionStatus::Canceled);
        assert!(provider
            .calls()
            .iter()
            .any(|c| c.starts_with("void:")), "Stale invoice should be voided");
    }

    // =========================================================================
    // Requesting a different price repurposes the pending subscription:
    // old invoice voided, prorated lines dropped, one full-amount line
    // for the original period, mirror updated
    // =========================================================================
    #[tokio::test]
    async fn price_change_rewrites_pending_invoice() {
        let (provider, store, _clock, orch) = setup();
        let first = orch
            .create_or_resume("user1", "price_normal", Some("nl"))
            .await
            .unwrap();
        let second = orch
            .create_or_resume("user1", "price_reduced", Some("nl"))
            .await
            .unwrap();
        assert_eq!(
            first.subscription_id, second.subscription_id,
            "Price change keeps the subscription"
        );
        assert_ne!(first.client_secret, second.client_secret);

        let calls = provider.calls();
        assert!(calls.iter().any(|c| c == "change_price:price_reduced"));
        assert!(calls.iter().any(|c| c.starts_with("delete_item:ii_prorate")));
        // One-off line bills the reduced amount for the original period start
        assert!(calls
            .iter()
            .any(|c| c.starts_with("create_item:") && c.contains(":3600:")));

        let record = store.get("user1").await.unwrap().unwrap();
        assert_eq!(
            record.subscription.unwrap().price_id.as_deref(),
            Some("price_reduced")
        );
    }
}

mod webhook_handler_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::fakes::{self, FakeProvider, DAY, T0, YEAR};
    use crate::catalog::PriceCatalog;
    use crate::clock::FixedClock;
    use crate::notifier::{Notification, PaymentDetail, RecordingNotifier};
    use crate::provider::{
        Charge, ChargeStatus, Customer, Mandate, PaymentMethod, PaymentMethodKind,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::UserStore;
    use crate::tasks::{RecordingQueue, Task};
    use crate::types::{
        BillingReason, CollectionMethod, InvoiceStatus, SubscriptionState, SubscriptionStatus,
        UserRecord,
    };
    use crate::webhooks::events::{
        EventKind, EventPrice, InvoiceEvent, PaymentIntentEvent, SubscriptionEvent,
        SubscriptionEventItem, SubscriptionEventItems,
    };
    use crate::webhooks::handlers::EventHandlers;
    use crate::webhooks::Outcome;

    struct Harness {
        provider: Arc<FakeProvider>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        queue: Arc<RecordingQueue>,
        handlers: EventHandlers,
    }

    fn harness() -> Harness {
        harness_at(T0)
    }

    fn harness_at(now: i64) -> Harness {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let queue = Arc::new(RecordingQueue::new());
        let mut prices = BTreeMap::new();
        prices.insert("normal".to_string(), "price_normal".to_string());
        let catalog = PriceCatalog::new(prices);

        provider.with(|i| {
            i.customers.insert(
                "cus_1".into(),
                Customer {
                    id: "cus_1".into(),
                    email: Some("ann@example.test".into()),
                    user_id: Some("user1".into()),
                    deleted: false,
                },
            );
        });
        store.insert(UserRecord {
            user_id: "user1".into(),
            email: Some("ann@example.test".into()),
            first_name: Some("Ann".into()),
            language: Some("nl".into()),
            customer_id: Some("cus_1".into()),
            ..Default::default()
        });

        let handlers = EventHandlers::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            queue.clone(),
            catalog,
            Arc::new(FixedClock::at(now)),
            "https://wildpatch.test/account".into(),
            Duration::ZERO,
        );
        Harness {
            provider,
            store,
            notifier,
            queue,
            handlers,
        }
    }

    fn invoice_event(reason: BillingReason) -> InvoiceEvent {
        InvoiceEvent {
            id: Some("in_1".into()),
            customer: Some("cus_1".into()),
            customer_email: Some("ann@example.test".into()),
            subscription: Some("sub_1".into()),
            status: Some(InvoiceStatus::Paid),
            billing_reason: Some(reason),
            hosted_invoice_url: Some("https://invoice.test/in_1".into()),
            charge: None,
            payment_intent: None,
            lines: serde_json::from_value(serde_json::json!({
                "data": [ { "price": { "id": "price_normal" } } ]
            }))
            .unwrap(),
        }
    }

    fn subscription_event(id: &str, status: &str) -> SubscriptionEvent {
        SubscriptionEvent {
            id: id.into(),
            customer: "cus_1".into(),
            status: status.into(),
            created: T0,
            start_date: Some(T0),
            current_period_start: Some(T0),
            current_period_end: Some(T0 + YEAR),
            cancel_at: None,
            canceled_at: None,
            collection_method: Some("send_invoice".into()),
            items: SubscriptionEventItems {
                data: vec![SubscriptionEventItem {
                    price: Some(EventPrice {
                        id: "price_normal".into(),
                    }),
                }],
            },
        }
    }

    // =========================================================================
    // invoice.paid settles the membership: superfan flag, mirror rebuilt
    // from a fresh provider read, confirmation email sent once
    // =========================================================================
    #[tokio::test]
    async fn invoice_paid_grants_membership_and_notifies() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Active,
                    T0,
                ),
            );
        });

        let outcome = h
            .handlers
            .dispatch(EventKind::InvoicePaid(invoice_event(
                BillingReason::SubscriptionCreate,
            )))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(record.superfan);
        let sub = record.subscription.unwrap();
        assert_eq!(sub.status, Some(SubscriptionStatus::Active));
        assert_eq!(sub.latest_invoice_status, Some(InvoiceStatus::Paid));
        assert_eq!(sub.payment_processing, Some(false));
        assert_eq!(h.notifier.sent_keys(), vec!["membership_confirmed"]);
    }

    // =========================================================================
    // The processing handler already emailed: invoice.paid must not resend
    // =========================================================================
    #[tokio::test]
    async fn invoice_paid_skips_email_after_optimistic_grant() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Active,
                    T0,
                ),
            );
        });
        h.store
            .update_subscription(
                "user1",
                &crate::types::SubscriptionPatch {
                    id: Some("sub_1".into()),
                    payment_processing: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.handlers
            .dispatch(EventKind::InvoicePaid(invoice_event(
                BillingReason::SubscriptionCreate,
            )))
            .await
            .unwrap();
        assert!(h.notifier.sent().is_empty(), "Confirmation already went out");
    }

    // =========================================================================
    // A reusable payment method upgrades invoice collection to auto-charge
    // =========================================================================
    #[tokio::test]
    async fn invoice_paid_upgrades_to_auto_charge() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Active,
                    T0,
                ),
            );
            i.methods.push(PaymentMethod {
                id: "pm_card".into(),
                kind: PaymentMethodKind::Card,
                last4: Some("4242".into()),
                generated_from_charge: None,
            });
        });

        h.handlers
            .dispatch(EventKind::InvoicePaid(invoice_event(
                BillingReason::SubscriptionCreate,
            )))
            .await
            .unwrap();

        let sub = h.provider.with(|i| i.subs.get("sub_1").cloned().unwrap());
        assert_eq!(sub.collection_method, CollectionMethod::ChargeAutomatically);
        let record = h.store.get("user1").await.unwrap().unwrap();
        assert_eq!(
            record.subscription.unwrap().collection_method,
            Some(CollectionMethod::ChargeAutomatically)
        );
    }

    // =========================================================================
    // payment_intent.processing with network approval grants optimistically
    // and is idempotent on redelivery
    // =========================================================================
    #[tokio::test]
    async fn processing_grants_optimistically_once() {
        let h = harness();
        h.provider.with(|i| {
            let mut inv = fakes::invoice(
                "in_1",
                "cus_1",
                "sub_1",
                BillingReason::SubscriptionCreate,
                InvoiceStatus::Open,
                "price_normal",
                (T0, T0 + YEAR),
            );
            inv.charge_id = Some("ch_1".into());
            i.invoices.insert("in_1".into(), inv);
            i.charges.insert(
                "ch_1".into(),
                Charge {
                    id: "ch_1".into(),
                    status: ChargeStatus::Pending,
                    network_status: Some("approved_by_network".into()),
                    payment_method_kind: Some(PaymentMethodKind::Sofort),
                    iban_last4: None,
                    sepa_mandate: None,
                    generated_sepa_debit_mandate: None,
                },
            );
        });

        let event = EventKind::PaymentIntentProcessing(PaymentIntentEvent {
            id: "pi_1".into(),
            invoice: Some("in_1".into()),
        });
        let first = h.handlers.dispatch(event.clone()).await.unwrap();
        assert_eq!(first, Outcome::Handled);
        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(record.superfan);
        assert_eq!(
            record.subscription.unwrap().payment_processing,
            Some(true)
        );
        assert_eq!(h.notifier.sent_keys(), vec!["membership_confirmed"]);

        let second = h.handlers.dispatch(event).await.unwrap();
        assert!(matches!(second, Outcome::Ignored(_)));
        assert_eq!(h.notifier.sent().len(), 1, "No duplicate email");
    }

    // =========================================================================
    // settlement failure after an optimistic grant revokes membership and
    // clears the processing flag
    // =========================================================================
    #[tokio::test]
    async fn settlement_failure_rolls_back_optimistic_grant() {
        let h = harness();
        h.provider.with(|i| {
            i.invoices.insert(
                "in_1".into(),
                fakes::invoice(
                    "in_1",
                    "cus_1",
                    "sub_1",
                    BillingReason::SubscriptionCreate,
                    InvoiceStatus::Open,
                    "price_normal",
                    (T0, T0 + YEAR),
                ),
            );
        });
        h.store.set_superfan("user1", true).await.unwrap();
        h.store
            .update_subscription(
                "user1",
                &crate::types::SubscriptionPatch {
                    id: Some("sub_1".into()),
                    payment_processing: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = h
            .handlers
            .dispatch(EventKind::PaymentIntentPaymentFailed(PaymentIntentEvent {
                id: "pi_1".into(),
                invoice: Some("in_1".into()),
            }))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(!record.superfan, "Optimistic grant must be revoked");
        assert_eq!(
            record.subscription.unwrap().payment_processing,
            Some(false)
        );
    }

    // =========================================================================
    // without a prior processing record a settlement failure is a strict
    // no-op: nothing written, nothing sent
    // =========================================================================
    #[tokio::test]
    async fn settlement_failure_without_processing_record_is_a_noop() {
        let h = harness();
        h.provider.with(|i| {
            i.invoices.insert(
                "in_1".into(),
                fakes::invoice(
                    "in_1",
                    "cus_1",
                    "sub_1",
                    BillingReason::SubscriptionCreate,
                    InvoiceStatus::Open,
                    "price_normal",
                    (T0, T0 + YEAR),
                ),
            );
        });
        h.store.set_superfan("user1", true).await.unwrap();

        let outcome = h
            .handlers
            .dispatch(EventKind::PaymentIntentPaymentFailed(PaymentIntentEvent {
                id: "pi_1".into(),
                invoice: Some("in_1".into()),
            }))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(record.superfan, "Membership must be left untouched");
        assert!(record.subscription.is_none(), "No mirror write expected");
        assert!(h.notifier.sent().is_empty());
    }

    // =========================================================================
    // Foreign-product events are acknowledged without touching anything
    // =========================================================================
    #[tokio::test]
    async fn foreign_product_events_are_ignored() {
        let h = harness();
        let mut event = invoice_event(BillingReason::SubscriptionCreate);
        event.lines = serde_json::from_value(serde_json::json!({
            "data": [ { "price": { "id": "price_other_product" } } ]
        }))
        .unwrap();
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoicePaid(event))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(!record.superfan);
        assert!(h.notifier.sent().is_empty());
    }

    // =========================================================================
    // invoice.created on a renewal finalizes the draft, primes the payment
    // method for off-session use, stores the link and sends the notice
    // =========================================================================
    #[tokio::test]
    async fn renewal_draft_is_finalized_and_noticed() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::PastDue,
                    T0 - 400 * DAY,
                ),
            );
            i.invoices.insert(
                "in_1".into(),
                fakes::invoice(
                    "in_1",
                    "cus_1",
                    "sub_1",
                    BillingReason::SubscriptionCycle,
                    InvoiceStatus::Draft,
                    "price_normal",
                    (T0, T0 + YEAR),
                ),
            );
        });

        let mut event = invoice_event(BillingReason::SubscriptionCycle);
        event.status = Some(InvoiceStatus::Draft);
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoiceCreated(event))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let calls = h.provider.calls();
        assert!(calls.contains(&"finalize:in_1".to_string()));
        assert!(calls.contains(&"prime_off_session:sub_1".to_string()));

        let record = h.store.get("user1").await.unwrap().unwrap();
        let sub = record.subscription.unwrap();
        assert_eq!(
            sub.renewal_invoice_link.as_deref(),
            Some("https://invoice.test/in_1")
        );
        assert_eq!(sub.latest_invoice_status, Some(InvoiceStatus::Open));
        assert_eq!(
            h.notifier.sent()[0].1,
            Notification::RenewalInvoice {
                invoice_url: "https://invoice.test/in_1".into()
            }
        );
    }

    // =========================================================================
    // a concurrently finalized renewal invoice is tolerated via a re-fetch
    // =========================================================================
    #[tokio::test]
    async fn already_finalized_renewal_invoice_is_tolerated() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::PastDue,
                    T0 - 400 * DAY,
                ),
            );
            i.invoices.insert(
                "in_1".into(),
                fakes::invoice(
                    "in_1",
                    "cus_1",
                    "sub_1",
                    BillingReason::SubscriptionCycle,
                    InvoiceStatus::Open,
                    "price_normal",
                    (T0, T0 + YEAR),
                ),
            );
        });

        let outcome = h
            .handlers
            .dispatch(EventKind::InvoiceCreated(invoice_event(
                BillingReason::SubscriptionCycle,
            )))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert_eq!(
            record.subscription.unwrap().renewal_invoice_link.as_deref(),
            Some("https://invoice.test/in_1")
        );
    }

    // =========================================================================
    // first invoices carry a creation billing reason; invoice.created must
    // leave them to the checkout flow
    // =========================================================================
    #[tokio::test]
    async fn first_invoice_creation_is_ignored() {
        let h = harness();
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoiceCreated(invoice_event(
                BillingReason::SubscriptionCreate,
            )))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
        assert!(h.provider.calls().is_empty());
    }

    // =========================================================================
    // events for a deleted provider customer are acknowledged, not errored
    // =========================================================================
    #[tokio::test]
    async fn deleted_customer_events_are_acknowledged() {
        let h = harness();
        h.provider.with(|i| {
            i.customers.insert(
                "cus_gone".into(),
                Customer {
                    id: "cus_gone".into(),
                    email: None,
                    user_id: Some("user1".into()),
                    deleted: true,
                },
            );
        });
        let mut event = invoice_event(BillingReason::SubscriptionCreate);
        event.customer = Some("cus_gone".into());
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoicePaid(event))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(!record.superfan);
        assert!(h.notifier.sent().is_empty());
    }

    // =========================================================================
    // subscription.created for a fresh checkout queues the reminder nudge
    // =========================================================================
    #[tokio::test]
    async fn fresh_checkout_queues_reminder() {
        let h = harness();
        let outcome = h
            .handlers
            .dispatch(EventKind::SubscriptionCreated(subscription_event(
                "sub_1",
                "incomplete",
            )))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let queued = h.queue.enqueued();
        assert_eq!(queued.len(), 1);
        let (task, run_at) = &queued[0];
        assert_eq!(
            *task,
            Task::AbandonedCheckout {
                user_id: "user1".into()
            }
        );
        assert!(run_at.unix_timestamp() > T0, "Nudge goes to a later send slot");
    }

    // =========================================================================
    // The nudge slot is derived from the checkout instant itself, so a
    // webhook delivered days late still targets the original slot
    // =========================================================================
    #[tokio::test]
    async fn late_delivery_keeps_the_original_send_slot() {
        let h = harness_at(T0 + 2 * DAY);
        h.handlers
            .dispatch(EventKind::SubscriptionCreated(subscription_event(
                "sub_1",
                "incomplete",
            )))
            .await
            .unwrap();

        let queued = h.queue.enqueued();
        assert_eq!(queued.len(), 1);
        // T0 is 22:13 UTC, 23:13 in Brussels: the morning slot of the
        // following day, 07:00 CET, which is T0 plus 28000 seconds.
        assert_eq!(queued[0].1.unix_timestamp(), T0 + 28_000);
    }

    // =========================================================================
    // subscription.deleted with a fresh sibling is a replacement, not an end
    // =========================================================================
    #[tokio::test]
    async fn deletion_with_fresh_sibling_is_a_replacement() {
        let h = harness();
        h.store.set_superfan("user1", true).await.unwrap();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_new".into(),
                fakes::subscription(
                    "sub_new",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Incomplete,
                    T0 - 5,
                ),
            );
        });

        let outcome = h
            .handlers
            .dispatch(EventKind::SubscriptionDeleted(subscription_event(
                "sub_old",
                "canceled",
            )))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(record.superfan, "Replacement must not revoke membership");
        assert!(h.notifier.sent().is_empty());
    }

    // =========================================================================
    // Genuine deletion: mirror cancelled, membership revoked, ended email
    // only when the membership actually ran a renewed term
    // =========================================================================
    #[tokio::test]
    async fn genuine_deletion_ends_membership() {
        let h = harness();
        h.store.set_superfan("user1", true).await.unwrap();

        let mut event = subscription_event("sub_1", "canceled");
        event.current_period_start = Some(T0 - 30 * DAY);
        event.start_date = Some(T0 - 400 * DAY);
        event.canceled_at = Some(T0);
        h.handlers
            .dispatch(EventKind::SubscriptionDeleted(event))
            .await
            .unwrap();

        let record = h.store.get("user1").await.unwrap().unwrap();
        assert!(!record.superfan);
        let sub = record.subscription.unwrap();
        assert_eq!(sub.status, Some(SubscriptionStatus::Canceled));
        assert_eq!(sub.cancel_at, None);
        assert_eq!(h.notifier.sent_keys(), vec!["membership_ended"]);
    }

    #[tokio::test]
    async fn never_renewed_deletion_skips_ended_email() {
        let h = harness();
        // current_period_start == start_date: abandoned first term
        h.handlers
            .dispatch(EventKind::SubscriptionDeleted(subscription_event(
                "sub_1",
                "canceled",
            )))
            .await
            .unwrap();
        assert!(h.notifier.sent().is_empty());
        let record = h.store.get("user1").await.unwrap().unwrap();
        assert_eq!(
            record.subscription.unwrap().status,
            Some(SubscriptionStatus::Canceled)
        );
    }

    // =========================================================================
    // invoice.upcoming for an auto-charge member sends portal link plus the
    // SEPA mandate reference found through the generating charge
    // =========================================================================
    #[tokio::test]
    async fn upcoming_renewal_notice_resolves_sepa_mandate() {
        let h = harness();
        h.provider.with(|i| {
            let mut sub = fakes::subscription(
                "sub_1",
                "cus_1",
                "price_normal",
                SubscriptionStatus::Active,
                T0 - 360 * DAY,
            );
            sub.collection_method = CollectionMethod::ChargeAutomatically;
            sub.default_payment_method = Some("pm_sepa".into());
            i.subs.insert("sub_1".into(), sub);
            i.methods.push(PaymentMethod {
                id: "pm_sepa".into(),
                kind: PaymentMethodKind::SepaDebit,
                last4: Some("3000".into()),
                generated_from_charge: Some("ch_gen".into()),
            });
            i.charges.insert(
                "ch_gen".into(),
                Charge {
                    id: "ch_gen".into(),
                    status: ChargeStatus::Succeeded,
                    network_status: None,
                    payment_method_kind: Some(PaymentMethodKind::Bancontact),
                    iban_last4: Some("3000".into()),
                    sepa_mandate: None,
                    generated_sepa_debit_mandate: Some("mandate_1".into()),
                },
            );
            i.mandates.insert(
                "mandate_1".into(),
                Mandate {
                    id: "mandate_1".into(),
                    reference: Some("WP-MANDATE-001".into()),
                },
            );
        });

        let mut event = invoice_event(BillingReason::SubscriptionCycle);
        event.id = None; // upcoming invoices do not exist yet
        event.status = None;
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoiceUpcoming(event))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            Notification::RenewalUpcoming { portal_url, payment } => {
                assert!(portal_url.contains("cus_1"));
                assert_eq!(
                    *payment,
                    PaymentDetail::SepaDebit {
                        last4: Some("3000".into()),
                        mandate_reference: Some("WP-MANDATE-001".into()),
                    }
                );
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn upcoming_renewal_for_manual_collection_is_ignored() {
        let h = harness();
        h.provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Active,
                    T0 - 360 * DAY,
                ),
            );
        });
        let outcome = h
            .handlers
            .dispatch(EventKind::InvoiceUpcoming(invoice_event(
                BillingReason::SubscriptionCycle,
            )))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
    }

    // =========================================================================
    // subscription.updated mirrors cancel_at including explicit nulling
    // =========================================================================
    #[tokio::test]
    async fn update_mirrors_cancel_at_both_ways() {
        let h = harness();
        let mut event = subscription_event("sub_1", "active");
        event.cancel_at = Some(T0 + YEAR);
        h.handlers
            .dispatch(EventKind::SubscriptionUpdated(event))
            .await
            .unwrap();
        let sub = h.store.get("user1").await.unwrap().unwrap().subscription.unwrap();
        assert_eq!(sub.cancel_at, Some(T0 + YEAR));

        // Reactivation clears it again
        h.handlers
            .dispatch(EventKind::SubscriptionUpdated(subscription_event(
                "sub_1", "active",
            )))
            .await
            .unwrap();
        let sub: SubscriptionState =
            h.store.get("user1").await.unwrap().unwrap().subscription.unwrap();
        assert_eq!(sub.cancel_at, None);
    }
}

mod renewal_sweep_tests {
    use std::sync::Arc;

    use super::fakes::{self, FakeProvider, DAY, T0};
    use crate::clock::FixedClock;
    use crate::notifier::{Notification, RecordingNotifier};
    use crate::renewals::{RenewalSweep, FEEDBACK_AFTER_SECS, REMINDER_AFTER_SECS};
    use crate::store::memory::MemoryStore;
    use crate::store::UserStore;
    use crate::types::{InvoiceStatus, SubscriptionState, SubscriptionStatus, UserRecord};

    fn overdue_member(
        user_id: &str,
        sub_id: &str,
        overdue_secs: i64,
        invoice_link: Option<&str>,
    ) -> UserRecord {
        UserRecord {
            user_id: user_id.into(),
            email: Some(format!("{user_id}@example.test")),
            first_name: Some("Member".into()),
            language: Some("en".into()),
            customer_id: Some(format!("cus_{user_id}")),
            superfan: true,
            subscription: Some(SubscriptionState {
                id: sub_id.into(),
                status: Some(SubscriptionStatus::PastDue),
                latest_invoice_status: Some(InvoiceStatus::Open),
                start_date: Some(T0 - 400 * DAY),
                current_period_start: Some(T0 - overdue_secs),
                current_period_end: Some(T0 - overdue_secs + 365 * DAY),
                renewal_invoice_link: invoice_link.map(String::from),
                ..Default::default()
            }),
        }
    }

    fn sweep(
        provider: &Arc<FakeProvider>,
        store: &Arc<MemoryStore>,
        notifier: &Arc<RecordingNotifier>,
    ) -> RenewalSweep {
        RenewalSweep::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            Arc::new(FixedClock::at(T0)),
        )
    }

    // =========================================================================
    // Five days overdue, inside the one-hour window: reminder with the
    // stored invoice link, nothing cancelled
    // =========================================================================
    #[tokio::test]
    async fn reminder_fires_in_its_window() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(overdue_member(
            "user1",
            "sub_1",
            REMINDER_AFTER_SECS + 1800,
            Some("https://invoice.test/renewal"),
        ));
        // Outside the window: too fresh and already cancelled-range
        store.insert(overdue_member("user2", "sub_2", 2 * DAY, None));

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.reminders_sent, 1);
        assert_eq!(stats.cancelled, 0);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.email, "user1@example.test");
        assert_eq!(
            sent[0].1,
            Notification::RenewalInvoice {
                invoice_url: "https://invoice.test/renewal".into()
            }
        );
    }

    // =========================================================================
    // First-year subscriptions are never touched by the sweep even when
    // past_due with an open invoice
    // =========================================================================
    #[tokio::test]
    async fn first_year_memberships_are_excluded() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mut record = overdue_member(
            "user1",
            "sub_1",
            REMINDER_AFTER_SECS + 1800,
            Some("https://invoice.test/renewal"),
        );
        if let Some(sub) = record.subscription.as_mut() {
            sub.start_date = Some(T0 - 100 * DAY);
        }
        store.insert(record);

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.reminders_sent, 0);
        assert_eq!(stats.cancelled, 0);
    }

    // =========================================================================
    // Eight days overdue: membership cancelled, open renewal invoice voided
    // =========================================================================
    #[tokio::test]
    async fn overdue_membership_is_cancelled_and_invoice_voided() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(overdue_member("user1", "sub_1", 8 * DAY, None));
        provider.with(|i| {
            let mut sub = fakes::subscription(
                "sub_1",
                "cus_user1",
                "price_normal",
                SubscriptionStatus::PastDue,
                T0 - 400 * DAY,
            );
            let inv = fakes::invoice(
                "in_renewal",
                "cus_user1",
                "sub_1",
                crate::types::BillingReason::SubscriptionCycle,
                InvoiceStatus::Open,
                "price_normal",
                (T0 - 8 * DAY, T0 + 357 * DAY),
            );
            sub.latest_invoice = Some(inv.clone());
            i.invoices.insert("in_renewal".into(), inv);
            i.subs.insert("sub_1".into(), sub);
        });

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.cancelled, 1);

        let calls = provider.calls();
        assert!(calls.contains(&"cancel:sub_1".to_string()));
        assert!(calls.contains(&"void:in_renewal".to_string()));
        let record = store.get("user1").await.unwrap().unwrap();
        assert_eq!(
            record.subscription.unwrap().latest_invoice_status,
            Some(InvoiceStatus::Void)
        );
    }

    // =========================================================================
    // A provider failure on one member does not stop the pass
    // =========================================================================
    #[tokio::test]
    async fn cancellation_errors_are_isolated() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        // sub_missing is not known to the provider: cancel fails
        store.insert(overdue_member("user1", "sub_missing", 8 * DAY, None));
        store.insert(overdue_member("user2", "sub_2", 8 * DAY, None));
        provider.with(|i| {
            i.subs.insert(
                "sub_2".into(),
                fakes::subscription(
                    "sub_2",
                    "cus_user2",
                    "price_normal",
                    SubscriptionStatus::PastDue,
                    T0 - 400 * DAY,
                ),
            );
        });

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.cancelled, 1, "Healthy member still processed");
    }

    fn canceled_member(period_start: i64) -> UserRecord {
        UserRecord {
            user_id: "user1".into(),
            email: Some("user1@example.test".into()),
            first_name: None,
            language: Some("fr".into()),
            customer_id: Some("cus_user1".into()),
            superfan: false,
            subscription: Some(SubscriptionState {
                id: "sub_1".into(),
                status: Some(SubscriptionStatus::Canceled),
                start_date: Some(T0 - 400 * DAY),
                current_period_start: Some(period_start),
                renewal_invoice_link: Some("https://invoice.test/renewal".into()),
                ..Default::default()
            }),
        }
    }

    // =========================================================================
    // Twelve days into the unpaid renewal period, inside the window:
    // feedback request for the member the cancellation pass closed out
    // =========================================================================
    #[tokio::test]
    async fn feedback_fires_after_cancellation() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(canceled_member(T0 - (FEEDBACK_AFTER_SECS + 1800)));

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.feedback_sent, 1);
        let sent = notifier.sent();
        assert_eq!(sent[0].0.language, "fr");
        assert_eq!(sent[0].1, Notification::CancellationFeedback);
    }

    // =========================================================================
    // Members who cancelled on their own terms never see the feedback ask:
    // no renewal invoice on file, or a term that never rolled over
    // =========================================================================
    #[tokio::test]
    async fn feedback_skips_voluntary_cancellations() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let mut no_invoice = canceled_member(T0 - (FEEDBACK_AFTER_SECS + 1800));
        if let Some(sub) = no_invoice.subscription.as_mut() {
            sub.renewal_invoice_link = None;
        }
        store.insert(no_invoice);

        let mut first_term = canceled_member(T0 - (FEEDBACK_AFTER_SECS + 1800));
        first_term.user_id = "user2".into();
        if let Some(sub) = first_term.subscription.as_mut() {
            sub.start_date = sub.current_period_start;
        }
        store.insert(first_term);

        let stats = sweep(&provider, &store, &notifier).run().await.unwrap();
        assert_eq!(stats.feedback_sent, 0);
        assert!(notifier.sent().is_empty());
    }
}

mod task_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::fakes::{self, FakeProvider, DAY, T0};
    use crate::catalog::PriceCatalog;
    use crate::clock::FixedClock;
    use crate::notifier::{Notification, RecordingNotifier};
    use crate::store::memory::MemoryStore;
    use crate::tasks::{Task, TaskRunner};
    use crate::types::{SubscriptionStatus, UserRecord};

    fn user(superfan: bool) -> UserRecord {
        UserRecord {
            user_id: "user1".into(),
            email: Some("ann@example.test".into()),
            first_name: Some("Ann".into()),
            language: Some("nl".into()),
            customer_id: Some("cus_1".into()),
            superfan,
            ..Default::default()
        }
    }

    fn runner(
        provider: &Arc<FakeProvider>,
        store: &Arc<MemoryStore>,
        notifier: &Arc<RecordingNotifier>,
    ) -> TaskRunner {
        let mut prices = BTreeMap::new();
        prices.insert("normal".to_string(), "price_normal".to_string());
        prices.insert("reduced".to_string(), "price_reduced".to_string());
        TaskRunner::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            PriceCatalog::new(prices),
            Arc::new(FixedClock::at(T0)),
        )
    }

    fn reminder_for(user_id: &str) -> Task {
        Task::AbandonedCheckout {
            user_id: user_id.into(),
        }
    }

    // =========================================================================
    // Checkout reminder goes out to users who never finished paying
    // =========================================================================
    #[tokio::test]
    async fn checkout_reminder_sent_to_unpaid_user() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(user(false));
        provider.with(|i| {
            i.subs.insert(
                "sub_1".into(),
                fakes::subscription(
                    "sub_1",
                    "cus_1",
                    "price_normal",
                    SubscriptionStatus::Incomplete,
                    T0 - DAY,
                ),
            );
        });

        runner(&provider, &store, &notifier)
            .run(&reminder_for("user1"))
            .await
            .unwrap();
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Notification::CheckoutReminder);
    }

    // =========================================================================
    // Users who completed payment in the meantime are left alone
    // =========================================================================
    #[tokio::test]
    async fn checkout_reminder_skipped_for_members() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(user(true));

        runner(&provider, &store, &notifier)
            .run(&reminder_for("user1"))
            .await
            .unwrap();
        assert!(notifier.sent().is_empty());
    }

    // =========================================================================
    // A retried checkout enqueues a second reminder; only the first of the
    // overlapping pair may send
    // =========================================================================
    #[tokio::test]
    async fn checkout_reminder_deduplicated_across_retried_checkouts() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(user(false));
        provider.with(|i| {
            for (sub_id, created) in [("sub_1", T0 - 3 * DAY), ("sub_2", T0 - DAY)] {
                i.subs.insert(
                    sub_id.into(),
                    fakes::subscription(
                        sub_id,
                        "cus_1",
                        "price_normal",
                        SubscriptionStatus::Incomplete,
                        created,
                    ),
                );
            }
        });

        runner(&provider, &store, &notifier)
            .run(&reminder_for("user1"))
            .await
            .unwrap();
        assert!(notifier.sent().is_empty(), "Second nudge must be skipped");
    }

    // =========================================================================
    // Checkouts older than the overlap window do not count as retries
    // =========================================================================
    #[tokio::test]
    async fn old_checkouts_do_not_suppress_the_reminder() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        store.insert(user(false));
        provider.with(|i| {
            for (sub_id, created) in [("sub_1", T0 - 60 * DAY), ("sub_2", T0 - DAY)] {
                i.subs.insert(
                    sub_id.into(),
                    fakes::subscription(
                        sub_id,
                        "cus_1",
                        "price_normal",
                        SubscriptionStatus::Incomplete,
                        created,
                    ),
                );
            }
        });

        runner(&provider, &store, &notifier)
            .run(&reminder_for("user1"))
            .await
            .unwrap();
        assert_eq!(notifier.sent().len(), 1);
    }

    // =========================================================================
    // Unknown users drop the task instead of erroring forever
    // =========================================================================
    #[tokio::test]
    async fn checkout_reminder_for_unknown_user_is_dropped() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let result = runner(&provider, &store, &notifier)
            .run(&reminder_for("ghost"))
            .await;
        assert!(result.is_ok());
        assert!(notifier.sent().is_empty());
    }
}
