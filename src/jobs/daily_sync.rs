//! Daily in-process sync worker.
//!
//! Sleeps until the configured UTC time of day, then syncs each configured
//! spreadsheet with the default window, one after another. Runs go through
//! the shared pipeline and registry, so a scheduled run and an HTTP-triggered
//! run can never write the same target at once.
//!
//! The worker never exits on failure: each failed target is logged and the
//! next tick retries it.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveTime, Utc};

use crate::{
    config::ScheduleConfig,
    observability::metrics,
    sync::{SyncPipeline, SyncRequest},
};

/// Results from one scheduled pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScheduledRunResult {
    pub succeeded: usize,
    pub failed: usize,
}

/// Starts the daily sync worker. Returns immediately if the schedule is
/// disabled; otherwise runs until the task is cancelled.
pub async fn start_daily_sync_worker(pipeline: Arc<SyncPipeline>, config: ScheduleConfig) {
    if !config.enabled {
        tracing::info!("Daily sync worker disabled by configuration");
        return;
    }

    let at = match config.time_of_day() {
        Ok(at) => at,
        Err(e) => {
            tracing::error!(error = %e, "Daily sync worker not started");
            return;
        }
    };

    tracing::info!(
        time_utc = %at.format("%H:%M"),
        spreadsheets = config.spreadsheet_ids.len(),
        "Starting daily sync worker"
    );

    loop {
        let now = Utc::now();
        let next = next_run_after(now, at);
        tracing::debug!(next_run = %next, "Daily sync sleeping");
        tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;

        let result = run_scheduled(&pipeline, &config.spreadsheet_ids).await;
        metrics::record_scheduled_run(config.spreadsheet_ids.len(), result.failed);
        if result.failed > 0 {
            tracing::warn!(
                succeeded = result.succeeded,
                failed = result.failed,
                "Daily sync finished with failures"
            );
        } else {
            tracing::info!(succeeded = result.succeeded, "Daily sync finished");
        }
    }
}

/// Sync each spreadsheet in order, continuing past failures.
pub async fn run_scheduled(pipeline: &SyncPipeline, spreadsheet_ids: &[String]) -> ScheduledRunResult {
    let mut result = ScheduledRunResult::default();
    for spreadsheet_id in spreadsheet_ids {
        match pipeline
            .run(SyncRequest::for_spreadsheet(spreadsheet_id.clone()))
            .await
        {
            Ok(summary) => {
                tracing::info!(
                    spreadsheet_id = %spreadsheet_id,
                    rows = summary.rows_written,
                    "Scheduled sync succeeded"
                );
                result.succeeded += 1;
            }
            Err(e) => {
                tracing::error!(
                    spreadsheet_id = %spreadsheet_id,
                    error = %e,
                    "Scheduled sync failed"
                );
                result.failed += 1;
            }
        }
    }
    result
}

/// First instant strictly after `now` whose UTC time of day is `at`.
fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .map_or(today, |d| d.and_time(at).and_utc())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;
    use crate::{
        billing::memory::{InMemoryBillingSource, record},
        sheets::{SyncError, SyncTarget, memory::InMemorySheetWriter},
        tests::test_pipeline,
    };

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn six() -> NaiveTime {
        NaiveTime::from_hms_opt(6, 0, 0).unwrap()
    }

    #[test]
    fn test_next_run_later_today() {
        assert_eq!(
            next_run_after(ts("2024-03-10T05:59:00Z"), six()),
            ts("2024-03-10T06:00:00Z")
        );
    }

    #[test]
    fn test_next_run_tomorrow() {
        assert_eq!(
            next_run_after(ts("2024-03-10T06:00:00Z"), six()),
            ts("2024-03-11T06:00:00Z")
        );
        assert_eq!(
            next_run_after(ts("2024-12-31T23:00:00Z"), six()),
            ts("2025-01-01T06:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_run_scheduled_continues_past_failures() {
        let writer = Arc::new(InMemorySheetWriter::new());
        writer.fail_with([SyncError::PermissionDenied("sheet-a".into())]);
        let today = Utc::now().to_rfc3339();
        let pipeline = test_pipeline(
            InMemoryBillingSource::new(vec![record("BigQuery", None, &today, dec!(1))]),
            writer.clone(),
        );

        let ids = vec!["sheet-a".to_string(), "bad/id".to_string(), "sheet-c".to_string()];
        let result = run_scheduled(&pipeline, &ids).await;

        assert_eq!(result, ScheduledRunResult { succeeded: 1, failed: 2 });
        let table = writer.contents(&SyncTarget::new("sheet-c", "Costs")).unwrap();
        assert_eq!(table.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_worker_returns() {
        let pipeline = Arc::new(test_pipeline(
            InMemoryBillingSource::default(),
            Arc::new(InMemorySheetWriter::new()),
        ));
        start_daily_sync_worker(pipeline, ScheduleConfig::default()).await;
    }
}
