//! Scheduled plan catalog reconciliation

use std::sync::Arc;

use subsync_billing::{CancelSignal, PlanCatalog, SyncReport};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

/// Run one sweep and log the outcome. Errors are logged, not returned.
pub async fn run_plan_sync(catalog: &PlanCatalog, cancel: &CancelSignal) -> Option<SyncReport> {
    match catalog.sync_all_plans(cancel).await {
        Ok(report) => {
            if report.failed > 0 {
                tracing::warn!(
                    synced = report.synced,
                    failed = report.failed,
                    "Plan sync finished with failures"
                );
            }
            Some(report)
        }
        Err(e) => {
            tracing::error!(error = %e, "Plan sync failed");
            None
        }
    }
}

/// Register the sweep on `schedule`. Ticks that arrive while a sweep is
/// still running are skipped.
pub async fn schedule_plan_sync(
    scheduler: &JobScheduler,
    catalog: Arc<PlanCatalog>,
    schedule: &str,
    cancel: CancelSignal,
) -> Result<Uuid, JobSchedulerError> {
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(schedule, move |job_id, _scheduler| {
        let catalog = catalog.clone();
        let cancel = cancel.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock_owned() else {
                tracing::warn!(job_id = %job_id, "Previous plan sync still running, skipping tick");
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            tracing::debug!(job_id = %job_id, "Plan sync tick");
            run_plan_sync(&catalog, &cancel).await;
        })
    })?;

    let job_id = scheduler.add(job).await?;
    tracing::info!(job_id = %job_id, schedule, "Scheduled plan sync");
    Ok(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use subsync_billing::testing::TestHarness;
    use subsync_billing::ProcessorError;

    #[tokio::test]
    async fn sweep_syncs_paid_plans() {
        let h = TestHarness::new().await;

        let report = run_plan_sync(&h.billing.catalog, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.synced, 3);

        let professional = h.plan("professional").await.unwrap();
        let price_id = professional.processor_price_id.unwrap();
        assert_eq!(h.gateway.price(&price_id).unwrap().unit_amount, Some(5499));
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let h = TestHarness::new().await;
        h.gateway
            .fail_next("create_product", ProcessorError::permanent("create_product", "bad"));

        let report = run_plan_sync(&h.billing.catalog, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_early() {
        let h = TestHarness::new().await;
        let (handle, signal) = CancelSignal::pair();
        handle.cancel();

        let report = run_plan_sync(&h.billing.catalog, &signal).await.unwrap();
        assert_eq!(report.synced + report.failed, 0);
        assert!(h.gateway.prices().is_empty());
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let h = TestHarness::new().await;
        let scheduler = JobScheduler::new().await.unwrap();

        let result = schedule_plan_sync(
            &scheduler,
            h.billing.catalog.clone(),
            "every now and then",
            CancelSignal::never(),
        )
        .await;
        assert!(result.is_err());

        let job_id = schedule_plan_sync(
            &scheduler,
            h.billing.catalog.clone(),
            "0 0 */6 * * *",
            CancelSignal::never(),
        )
        .await
        .unwrap();
        assert!(!job_id.is_nil());
    }
}
