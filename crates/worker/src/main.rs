//! Wildpatch Background Worker
//!
//! Handles scheduled jobs including:
//! - Renewal reconciliation sweep (hourly)
//! - Queued task processing, e.g. abandoned-checkout reminders (every minute)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use wildpatch_billing::BillingService;
use wildpatch_shared::{create_pool, require_env, run_migrations};

/// How many queued tasks a single drain cycle may claim.
const TASK_BATCH_SIZE: i64 = 50;

async fn drain_task_queue(billing: &BillingService) {
    let claimed = match billing.tasks.claim_due(TASK_BATCH_SIZE).await {
        Ok(claimed) => claimed,
        Err(e) => {
            error!(error = %e, "Failed to claim queued tasks");
            return;
        }
    };

    if claimed.is_empty() {
        return;
    }
    info!(count = claimed.len(), "Processing queued tasks");

    for item in claimed {
        let result = billing.task_runner.run(&item.task).await;

        let ack = match result {
            Ok(()) => billing.tasks.complete(item.id).await,
            Err(e) => {
                error!(task_id = %item.id, error = %e, "Queued task failed");
                billing.tasks.fail(item.id, &e.to_string()).await
            }
        };
        if let Err(e) = ack {
            error!(task_id = %item.id, error = %e, "Failed to record task outcome");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Wildpatch Worker");

    let database_url = require_env("DATABASE_URL")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Renewal reconciliation sweep (hourly)
    // Reminds, cancels and asks for feedback on unpaid yearly renewals.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running renewal reconciliation sweep");
                match billing.renewals.run().await {
                    Ok(stats) => info!(
                        reminders_sent = stats.reminders_sent,
                        cancelled = stats.cancelled,
                        feedback_sent = stats.feedback_sent,
                        "Renewal sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal reconciliation sweep (hourly)");

    // Job 2: Process queued tasks (every minute)
    // Claims due tasks with SKIP LOCKED so multiple workers never double-send.
    let task_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = task_billing.clone();
            Box::pin(async move {
                drain_task_queue(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Queued task processing (every minute)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Wildpatch Worker started successfully with {} scheduled jobs",
        3
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
