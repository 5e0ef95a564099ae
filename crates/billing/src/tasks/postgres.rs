//! Postgres-backed task queue. Claims use `FOR UPDATE SKIP LOCKED` so
//! multiple worker instances can drain concurrently without double delivery.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::tasks::{Task, TaskQueue};

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

/// A task claimed for execution, to be completed or failed afterwards.
#[derive(Debug)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub task: Task,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `limit` due tasks. Claimed rows stay invisible to other
    /// workers until completed or failed. A claim older than ten minutes
    /// belongs to a worker that died mid-task and is handed out again.
    pub async fn claim_due(&self, limit: i64) -> BillingResult<Vec<ClaimedTask>> {
        let rows: Vec<(Uuid, serde_json::Value)> = sqlx::query_as(
            r#"
            UPDATE queued_tasks SET claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM queued_tasks
                WHERE run_at <= NOW() AND completed_at IS NULL
                  AND (claimed_at IS NULL OR claimed_at < NOW() - INTERVAL '10 minutes')
                ORDER BY run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match serde_json::from_value::<Task>(payload) {
                Ok(task) => claimed.push(ClaimedTask { id, task }),
                Err(e) => {
                    // Unparseable payloads are terminal, retrying cannot fix them.
                    tracing::error!(task_id = %id, error = %e, "Dropping malformed queued task");
                    sqlx::query(
                        "UPDATE queued_tasks SET completed_at = NOW(), error_message = $2 WHERE id = $1",
                    )
                    .bind(id)
                    .bind(format!("malformed payload: {e}"))
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(claimed)
    }

    pub async fn complete(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE queued_tasks SET completed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the failure and release the claim so the next drain retries it.
    pub async fn fail(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE queued_tasks SET claimed_at = NULL, error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: Task, run_at: OffsetDateTime) -> BillingResult<()> {
        let payload = serde_json::to_value(&task)
            .map_err(|e| BillingError::TaskQueue(format!("encode task: {e}")))?;
        sqlx::query(
            "INSERT INTO queued_tasks (task_type, payload, run_at) VALUES ($1, $2, $3)",
        )
        .bind(task.task_type())
        .bind(payload)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::TaskQueue(e.to_string()))?;
        tracing::info!(task_type = task.task_type(), run_at = %run_at, "Enqueued task");
        Ok(())
    }
}
