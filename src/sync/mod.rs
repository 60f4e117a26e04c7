//! One aggregation-and-sync run.
//!
//! A run resolves the request into a [`RunPlan`], claims the target in the
//! [`RunRegistry`], reads and aggregates the billing window (split into
//! chunks queried concurrently when it is long), renders the table and
//! replaces the sheet. The whole run is bounded by a deadline; the sheet is
//! written in a single atomic request after aggregation has finished, so an
//! expired or failed run never leaves a partial overwrite behind.

use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use chrono::{Days, NaiveDate, Utc};
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    aggregation::{AggregatedCostRow, AggregationError, CostAggregator, Dimension, PartialAggregate},
    billing::{BillingSource, DateRange, QueryError},
    config::SyncConfig,
    observability::metrics,
    retry::with_retry_hinted,
    runs::{AlreadyRunning, RunRegistry},
    sheets::{self, SheetWriter, SyncError, SyncTarget},
};

/// Google spreadsheet ids are URL-safe base64-ish strings.
static SPREADSHEET_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());

/// Sheets caps tab titles at 100 characters.
const MAX_SHEET_NAME_CHARS: usize = 100;

/// Caller-supplied run parameters. Everything but the spreadsheet is optional.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub spreadsheet_id: String,
    pub sheet_name: Option<String>,
    pub start_date: Option<NaiveDate>,
    /// Inclusive last day.
    pub end_date: Option<NaiveDate>,
    pub dimensions: Option<Vec<Dimension>>,
    /// Lowers the configured run timeout for this run.
    pub deadline: Option<Duration>,
}

impl SyncRequest {
    pub fn for_spreadsheet(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            ..Default::default()
        }
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub target: SyncTarget,
    pub range: DateRange,
    pub dimensions: Vec<Dimension>,
    pub deadline: Duration,
}

/// Result of a successful run, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub start_date: NaiveDate,
    /// Inclusive last day.
    pub end_date: NaiveDate,
    pub dimensions: Vec<Dimension>,
    pub chunks: usize,
    pub records_read: u64,
    /// Data rows written, excluding the header.
    pub rows_written: usize,
    pub sheet_created: bool,
    pub total_cost_by_currency: BTreeMap<String, Decimal>,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),

    #[error("billing query failed: {0}")]
    Query(#[from] QueryError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("sheet update failed: {0}")]
    Sync(#[from] SyncError),

    #[error("run exceeded its {}s deadline", .0.as_secs())]
    DeadlineExceeded(Duration),
}

impl RunError {
    /// Label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::InvalidInput(_) => "invalid_input",
            RunError::AlreadyRunning(_) => "already_running",
            RunError::Query(_) => "query",
            RunError::Aggregation(_) => "aggregation",
            RunError::Sync(_) => "sync",
            RunError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

/// Runs syncs against shared configuration, data source and writer.
pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    source: Arc<dyn BillingSource>,
    writer: Arc<dyn SheetWriter>,
    registry: RunRegistry,
}

impl SyncPipeline {
    pub fn new(
        config: Arc<SyncConfig>,
        source: Arc<dyn BillingSource>,
        writer: Arc<dyn SheetWriter>,
        registry: RunRegistry,
    ) -> Self {
        Self {
            config,
            source,
            writer,
            registry,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn source(&self) -> &dyn BillingSource {
        self.source.as_ref()
    }

    /// Validate a request against the configuration, filling in defaults.
    pub fn plan(&self, request: SyncRequest, today: NaiveDate) -> Result<RunPlan, RunError> {
        let sync = &self.config.sync;

        let spreadsheet_id = request.spreadsheet_id.trim();
        if !SPREADSHEET_ID_REGEX.is_match(spreadsheet_id) {
            return Err(RunError::InvalidInput(
                "spreadsheet_id must be 1-128 characters of letters, digits, '-' or '_'".into(),
            ));
        }

        let sheet_name = request
            .sheet_name
            .unwrap_or_else(|| self.config.sheets.sheet_name.clone());
        if sheet_name.trim().is_empty()
            || sheet_name.chars().count() > MAX_SHEET_NAME_CHARS
            || sheet_name.chars().any(char::is_control)
        {
            return Err(RunError::InvalidInput(format!(
                "sheet name must be 1-{} printable characters",
                MAX_SHEET_NAME_CHARS
            )));
        }

        let range = resolve_range(
            request.start_date,
            request.end_date,
            today,
            sync.default_lookback_days,
        )?;
        if range.days() > sync.max_range_days {
            return Err(RunError::InvalidInput(format!(
                "range of {} days exceeds the maximum of {}",
                range.days(),
                sync.max_range_days
            )));
        }

        let dimensions = request.dimensions.unwrap_or_else(|| sync.dimensions.clone());
        CostAggregator::new(dimensions.clone())
            .map_err(|e| RunError::InvalidInput(e.to_string()))?;

        let max_deadline = Duration::from_secs(sync.run_timeout_secs);
        let deadline = match request.deadline {
            Some(d) if d.is_zero() => {
                return Err(RunError::InvalidInput("deadline must be positive".into()));
            }
            Some(d) => d.min(max_deadline),
            None => max_deadline,
        };

        Ok(RunPlan {
            target: SyncTarget::new(spreadsheet_id, sheet_name),
            range,
            dimensions,
            deadline,
        })
    }

    /// Plan and execute a run for today's default window.
    pub async fn run(&self, request: SyncRequest) -> Result<RunSummary, RunError> {
        let plan = self.plan(request, Utc::now().date_naive())?;
        self.execute(plan).await
    }

    /// Execute a planned run, holding the target for its duration.
    pub async fn execute(&self, plan: RunPlan) -> Result<RunSummary, RunError> {
        let guard = match self.registry.try_begin(&plan.target) {
            Ok(guard) => guard,
            Err(e) => {
                metrics::record_sync_run("rejected", Duration::ZERO);
                return Err(e.into());
            }
        };
        let run_id = guard.run_id();
        let started = Instant::now();

        let span = tracing::info_span!(
            "sync_run",
            %run_id,
            spreadsheet_id = %plan.target.spreadsheet_id,
            sheet = %plan.target.sheet_name,
            range = %plan.range,
        );

        let result = match tokio::time::timeout(
            plan.deadline,
            self.run_inner(&plan, run_id, started).instrument(span.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RunError::DeadlineExceeded(plan.deadline)),
        };

        let _enter = span.enter();
        match &result {
            Ok(summary) => {
                tracing::info!(
                    records = summary.records_read,
                    rows = summary.rows_written,
                    chunks = summary.chunks,
                    duration_ms = summary.duration_ms,
                    "Sync run succeeded"
                );
                metrics::record_sync_run("succeeded", started.elapsed());
                guard.succeed();
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Sync run failed");
                metrics::record_sync_run("failed", started.elapsed());
                guard.fail(e.to_string());
            }
        }

        result
    }

    async fn run_inner(
        &self,
        plan: &RunPlan,
        run_id: Uuid,
        started: Instant,
    ) -> Result<RunSummary, RunError> {
        let aggregator = CostAggregator::new(plan.dimensions.clone())?;
        let chunks = plan.range.split(self.config.sync.fanout_chunk_days);
        tracing::info!(chunks = chunks.len(), "Aggregating billing window");

        let partial = self.aggregate_chunks(&aggregator, &chunks).await?;
        let records_read = partial.record_count();
        let rows = aggregator.finalize(partial);
        let totals = currency_totals(&rows)?;

        let table = sheets::render(
            aggregator.dimensions(),
            &rows,
            self.config.sync.cost_decimal_places,
        );

        let written = with_retry_hinted(
            &self.config.sheets.retry,
            "sheets.replace_contents",
            SyncError::is_retryable,
            SyncError::retry_after,
            || self.writer.replace_contents(&plan.target, &table),
        )
        .await?;

        Ok(RunSummary {
            run_id,
            spreadsheet_id: plan.target.spreadsheet_id.clone(),
            sheet_name: plan.target.sheet_name.clone(),
            start_date: plan.range.start(),
            end_date: plan.range.end().pred_opt().unwrap_or(plan.range.start()),
            dimensions: plan.dimensions.clone(),
            chunks: chunks.len(),
            records_read,
            rows_written: rows.len(),
            sheet_created: written.created_sheet,
            total_cost_by_currency: totals,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Aggregate each chunk concurrently and merge the partials.
    async fn aggregate_chunks(
        &self,
        aggregator: &CostAggregator,
        chunks: &[DateRange],
    ) -> Result<PartialAggregate, RunError> {
        let mut partials = futures::stream::iter(chunks.iter().copied())
            .map(|chunk| self.aggregate_range(aggregator, chunk))
            .buffer_unordered(self.config.sync.max_concurrent_queries.max(1));

        let mut merged = PartialAggregate::default();
        while let Some(partial) = partials.try_next().await? {
            merged.merge(partial)?;
        }
        Ok(merged)
    }

    async fn aggregate_range(
        &self,
        aggregator: &CostAggregator,
        range: DateRange,
    ) -> Result<PartialAggregate, RunError> {
        let mut partial = PartialAggregate::default();
        let mut records = self.source.records(range);
        while let Some(record) = records.try_next().await? {
            aggregator.accumulate(&mut partial, &record)?;
        }
        tracing::debug!(%range, records = partial.record_count(), "Chunk aggregated");
        Ok(partial)
    }
}

/// Resolve optional request dates into a half-open range.
///
/// `end` is inclusive. Missing bounds are filled from the trailing
/// `lookback_days` window ending today.
fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
    lookback_days: u32,
) -> Result<DateRange, RunError> {
    let invalid = |e: QueryError| RunError::InvalidInput(e.to_string());
    let day_after = |d: NaiveDate| {
        d.checked_add_days(Days::new(1))
            .ok_or_else(|| RunError::InvalidInput(format!("date {} is out of range", d)))
    };

    match (start, end) {
        (None, None) => DateRange::trailing(today, lookback_days).map_err(invalid),
        (Some(start), None) => DateRange::new(start, day_after(today)?).map_err(|_| {
            RunError::InvalidInput(format!("start_date {} is after today ({})", start, today))
        }),
        (None, Some(end)) => DateRange::trailing(end, lookback_days).map_err(invalid),
        (Some(start), Some(end)) => DateRange::new(start, day_after(end)?).map_err(|_| {
            RunError::InvalidInput(format!("start_date {} is after end_date {}", start, end))
        }),
    }
}

fn currency_totals(
    rows: &[AggregatedCostRow],
) -> Result<BTreeMap<String, Decimal>, AggregationError> {
    let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
    for row in rows {
        let total = totals.entry(row.currency.clone()).or_default();
        *total = total
            .checked_add(row.total_cost)
            .ok_or(AggregationError::Overflow)?;
    }
    Ok(totals)
}
