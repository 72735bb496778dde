//! Subsync background worker
//!
//! Seeds the plan catalog, reconciles it with the processor at boot, and
//! keeps reconciling on a cron schedule until shutdown.

mod config;
mod plan_sync;

use anyhow::Context;
use subsync_billing::{plans::default_catalog, BillingService, CancelSignal};
use subsync_shared::{create_pool, init_tracing, run_migrations, shutdown_signal};
use tokio_cron_scheduler::JobScheduler;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let billing = BillingService::from_env(pool).context("Failed to initialize billing")?;
    let seeded = billing
        .catalog
        .seed(default_catalog())
        .await
        .context("Failed to seed plan catalog")?;
    tracing::info!(plan_count = seeded.len(), "Plan catalog seeded");

    let (cancel_handle, cancel) = CancelSignal::pair();

    let mut scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;
    plan_sync::schedule_plan_sync(
        &scheduler,
        billing.catalog.clone(),
        &config.plan_sync_cron,
        cancel.clone(),
    )
    .await
    .with_context(|| format!("Invalid PLAN_SYNC_CRON: {}", config.plan_sync_cron))?;
    scheduler.start().await.context("Failed to start scheduler")?;

    tokio::select! {
        _ = plan_sync::run_plan_sync(&billing.catalog, &cancel) => {
            tracing::info!("Initial plan sync finished");
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    cancel_handle.cancel();
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    tracing::info!("Worker stopped");
    Ok(())
}
