//! In-memory user store, used by tests and local development.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::store::{SubscriptionQuery, UserStore};
use crate::types::{SubscriptionPatch, UserRecord};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, UserRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing patch semantics.
    pub fn insert(&self, record: UserRecord) {
        let mut records = self.lock();
        records.insert(record.user_id.clone(), record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, UserRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, user_id: &str) -> BillingResult<Option<UserRecord>> {
        Ok(self.lock().get(user_id).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserRecord>> {
        Ok(self
            .lock()
            .values()
            .find(|r| r.customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        let mut records = self.lock();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord::new(user_id));
        record.customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn set_superfan(&self, user_id: &str, superfan: bool) -> BillingResult<()> {
        let mut records = self.lock();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord::new(user_id));
        record.superfan = superfan;
        Ok(())
    }

    async fn set_language(&self, user_id: &str, language: &str) -> BillingResult<()> {
        let mut records = self.lock();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord::new(user_id));
        record.language = Some(language.to_string());
        Ok(())
    }

    async fn update_subscription(
        &self,
        user_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<()> {
        let mut records = self.lock();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord::new(user_id));
        let mut sub = record.subscription.take().unwrap_or_default();
        patch.apply(&mut sub);
        record.subscription = Some(sub);
        Ok(())
    }

    async fn query_subscriptions(
        &self,
        query: SubscriptionQuery,
    ) -> BillingResult<Vec<UserRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}
