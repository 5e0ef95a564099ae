//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use wildpatch_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");
        Ok(Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
        })
    }
}
