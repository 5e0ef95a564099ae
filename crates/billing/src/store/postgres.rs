//! Postgres-backed user store. One JSONB document per user, partial
//! subscription updates applied read-modify-write under row lock.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::store::{SubscriptionQuery, UserStore};
use crate::types::{SubscriptionPatch, UserRecord};

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(user_id: &str, doc: serde_json::Value) -> BillingResult<UserRecord> {
        let mut record: UserRecord = serde_json::from_value(doc)
            .map_err(|e| BillingError::Store(format!("corrupt record for {user_id}: {e}")))?;
        record.user_id = user_id.to_string();
        Ok(record)
    }

    async fn write_doc(&self, user_id: &str, record: &UserRecord) -> BillingResult<()> {
        let doc = serde_json::to_value(record)
            .map_err(|e| BillingError::Store(format!("encode record for {user_id}: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO user_records (user_id, doc, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, user_id: &str) -> BillingResult<Option<UserRecord>> {
        let doc: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT doc FROM user_records WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        doc.map(|d| Self::decode(user_id, d)).transpose()
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserRecord>> {
        let row: Option<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT user_id, doc FROM user_records WHERE doc->>'customer_id' = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(user_id, doc)| Self::decode(&user_id, doc)).transpose()
    }

    async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        let mut record = self.get(user_id).await?.unwrap_or_else(|| UserRecord::new(user_id));
        record.customer_id = Some(customer_id.to_string());
        self.write_doc(user_id, &record).await
    }

    async fn set_superfan(&self, user_id: &str, superfan: bool) -> BillingResult<()> {
        let mut record = self.get(user_id).await?.unwrap_or_else(|| UserRecord::new(user_id));
        record.superfan = superfan;
        self.write_doc(user_id, &record).await
    }

    async fn set_language(&self, user_id: &str, language: &str) -> BillingResult<()> {
        let mut record = self.get(user_id).await?.unwrap_or_else(|| UserRecord::new(user_id));
        record.language = Some(language.to_string());
        self.write_doc(user_id, &record).await
    }

    async fn update_subscription(
        &self,
        user_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<()> {
        // Row lock so concurrent webhook deliveries for the same user
        // serialize their read-modify-write cycles.
        let mut tx = self.pool.begin().await?;
        let doc: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT doc FROM user_records WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut record = match doc {
            Some(d) => Self::decode(user_id, d)?,
            None => UserRecord::new(user_id),
        };
        let mut sub = record.subscription.take().unwrap_or_default();
        patch.apply(&mut sub);
        record.subscription = Some(sub);

        let doc = serde_json::to_value(&record)
            .map_err(|e| BillingError::Store(format!("encode record for {user_id}: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO user_records (user_id, doc, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(doc)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query_subscriptions(
        &self,
        query: SubscriptionQuery,
    ) -> BillingResult<Vec<UserRecord>> {
        let status = query.status.map(|s| s.as_str());
        let invoice_status = query.latest_invoice_status.map(|s| s.as_str());
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT user_id, doc FROM user_records
            WHERE ($1::text IS NULL OR doc->'subscription'->>'status' = $1)
              AND ($2::text IS NULL OR doc->'subscription'->>'latest_invoice_status' = $2)
            "#,
        )
        .bind(status)
        .bind(invoice_status)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(user_id, doc)| Self::decode(&user_id, doc))
            .collect()
    }
}
