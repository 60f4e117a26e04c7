//! Sync trigger and run status endpoints.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::{
    AppState,
    aggregation::Dimension,
    runs::RunRecord,
    sheets::SyncTarget,
    sync::{RunSummary, SyncRequest},
};

/// Query string of `POST /api/update-sheets`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSheetsParams {
    pub spreadsheet_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    /// Inclusive.
    pub end_date: Option<NaiveDate>,
    pub sheet: Option<String>,
    /// Comma-separated dimensions, e.g. `month,service,label:team`.
    pub group_by: Option<String>,
    pub deadline_secs: Option<u64>,
}

impl UpdateSheetsParams {
    fn into_request(self) -> Result<SyncRequest, ApiError> {
        let spreadsheet_id = self
            .spreadsheet_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("spreadsheet_id is required".into()))?;

        let dimensions = self
            .group_by
            .as_deref()
            .map(Dimension::parse_list)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        Ok(SyncRequest {
            spreadsheet_id,
            sheet_name: self.sheet,
            start_date: self.start_date,
            end_date: self.end_date,
            dimensions,
            deadline: self.deadline_secs.map(Duration::from_secs),
        })
    }
}

/// Aggregate the billing window and replace the target sheet.
///
/// The run executes on a tracked task, so it finishes (or hits its deadline)
/// even if the caller disconnects, and shutdown waits for it.
#[tracing::instrument(name = "api.update_sheets", skip_all)]
pub async fn update_sheets(
    State(state): State<AppState>,
    params: Result<Query<UpdateSheetsParams>, QueryRejection>,
) -> Result<Json<RunSummary>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = params.into_request()?;

    let pipeline = state.pipeline.clone();
    let summary = state
        .task_tracker
        .spawn(async move { pipeline.run(request).await })
        .await
        .map_err(|e| ApiError::Internal(format!("sync task failed: {}", e)))??;

    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub runs: Vec<RunRecord>,
}

/// State of every target seen by this process.
pub async fn list_runs(State(state): State<AppState>) -> Json<RunList> {
    Json(RunList {
        runs: state.pipeline.registry().list(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct GetRunParams {
    pub sheet: Option<String>,
}

/// State of one target. The sheet defaults to the configured tab name.
pub async fn get_run(
    State(state): State<AppState>,
    Path(spreadsheet_id): Path<String>,
    Query(params): Query<GetRunParams>,
) -> Result<Json<RunRecord>, ApiError> {
    let sheet_name = params
        .sheet
        .unwrap_or_else(|| state.config.sheets.sheet_name.clone());
    let target = SyncTarget::new(spreadsheet_id, sheet_name);

    state
        .pipeline
        .registry()
        .get(&target)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no runs recorded for {}", target)))
}
