//! Google Sheets REST writer.
//!
//! A write is two calls: a metadata read to resolve the tab's numeric
//! `sheetId`, then one `spreadsheets.batchUpdate` that creates the tab if
//! needed, resizes it to the table, clears it and writes the table. Sheets
//! applies a batchUpdate atomically, so readers see either the old contents
//! or the new ones.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use url::Url;

use super::{CellValue, SheetTable, SheetWriter, SyncError, SyncTarget, WriteSummary};
use crate::{
    config::SheetsConfig,
    gcp::{self, AccessTokenSource},
    observability::metrics,
};

pub struct GoogleSheetsWriter {
    client: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    base_url: Url,
    timeout: Duration,
}

impl GoogleSheetsWriter {
    pub fn from_config(
        config: &SheetsConfig,
        client: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            SyncError::InvalidRequest(format!("sheets.base_url '{}': {}", config.base_url, e))
        })?;
        Ok(Self {
            client,
            tokens,
            base_url,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// `{base}/v4/spreadsheets/{id}{suffix}`
    fn spreadsheet_url(&self, spreadsheet_id: &str, suffix: &str) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidRequest("sheets.base_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", format!("{}{}", spreadsheet_id, suffix).as_str()]);
        Ok(url)
    }

    async fn bearer(&self) -> Result<String, SyncError> {
        Ok(format!("Bearer {}", self.tokens.access_token().await?))
    }

    /// Look up the tab by title. A missing tab comes back with an unused id
    /// to create it under.
    async fn resolve_sheet(&self, target: &SyncTarget) -> Result<SheetLookup, SyncError> {
        let mut url = self.spreadsheet_url(&target.spreadsheet_id, "")?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");

        let response = self
            .client
            .get(url)
            .header("Authorization", self.bearer().await?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let spreadsheet: Spreadsheet = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::InvalidRequest(format!("unexpected metadata response: {}", e)))?;

        // Sheets rejects a new tab whose title differs from an existing one
        // only by case.
        if let Some(sheet) = spreadsheet
            .sheets
            .iter()
            .find(|s| s.properties.title.eq_ignore_ascii_case(&target.sheet_name))
        {
            return Ok(SheetLookup::Existing(sheet.properties.sheet_id));
        }

        let existing: HashSet<i64> = spreadsheet
            .sheets
            .iter()
            .map(|s| s.properties.sheet_id)
            .collect();
        Ok(SheetLookup::Missing(new_sheet_id(&target.sheet_name, &existing)))
    }

    async fn try_replace(
        &self,
        target: &SyncTarget,
        table: &SheetTable,
    ) -> Result<WriteSummary, SyncError> {
        let lookup = self.resolve_sheet(target).await?;
        let (sheet_id, created_sheet) = match lookup {
            SheetLookup::Existing(id) => (id, false),
            SheetLookup::Missing(id) => (id, true),
        };

        let body = json!({
            "requests": batch_requests(sheet_id, &target.sheet_name, created_sheet, table),
            "includeSpreadsheetInResponse": false,
        });

        let response = self
            .client
            .post(self.spreadsheet_url(&target.spreadsheet_id, ":batchUpdate")?)
            .header("Authorization", self.bearer().await?)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;

        Ok(WriteSummary {
            sheet_id,
            rows_written: table.row_count(),
            columns: table.column_count(),
            created_sheet,
        })
    }
}

#[async_trait]
impl SheetWriter for GoogleSheetsWriter {
    async fn replace_contents(
        &self,
        target: &SyncTarget,
        table: &SheetTable,
    ) -> Result<WriteSummary, SyncError> {
        let result = self.try_replace(target, table).await;
        match &result {
            Ok(summary) => {
                metrics::record_sheet_write_attempt("success");
                tracing::debug!(
                    sync_target = %target,
                    sheet_id = summary.sheet_id,
                    rows = summary.rows_written,
                    created = summary.created_sheet,
                    "Replaced sheet contents"
                );
            }
            Err(e) => metrics::record_sheet_write_attempt(e.kind()),
        }
        result
    }
}

enum SheetLookup {
    Existing(i64),
    Missing(i64),
}

#[derive(Debug, Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    title: String,
}

/// Id for a tab about to be created.
///
/// Derived from the title rather than from the current maximum, so two runs
/// creating different tabs from the same metadata snapshot pick different
/// ids. Collisions with existing tabs probe upwards.
fn new_sheet_id(title: &str, existing: &HashSet<i64>) -> i64 {
    let digest = Sha256::digest(title.to_lowercase().as_bytes());
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;

    let mut id = i64::from(seed.max(1));
    while existing.contains(&id) {
        id = if id >= i64::from(i32::MAX) { 1 } else { id + 1 };
    }
    id
}

/// The batchUpdate request list for one write.
fn batch_requests(sheet_id: i64, title: &str, create: bool, table: &SheetTable) -> Vec<Value> {
    // A frozen header needs at least one unfrozen row below it.
    let grid = json!({
        "rowCount": table.row_count().max(2),
        "columnCount": table.column_count(),
        "frozenRowCount": 1,
        "frozenColumnCount": 0,
    });

    let mut requests = Vec::with_capacity(4);
    if create {
        requests.push(json!({
            "addSheet": {
                "properties": { "sheetId": sheet_id, "title": title, "gridProperties": grid.clone() },
            },
        }));
    }
    requests.push(json!({
        "updateSheetProperties": {
            "properties": { "sheetId": sheet_id, "gridProperties": grid },
            "fields": "gridProperties(rowCount,columnCount,frozenRowCount,frozenColumnCount)",
        },
    }));
    requests.push(json!({
        "updateCells": {
            "range": { "sheetId": sheet_id },
            "fields": "userEnteredValue",
        },
    }));

    let header = table
        .header
        .iter()
        .map(|title| cell(&CellValue::Text(title.clone())));
    let mut rows = vec![json!({ "values": header.collect::<Vec<_>>() })];
    rows.extend(
        table
            .rows
            .iter()
            .map(|row| json!({ "values": row.iter().map(cell).collect::<Vec<_>>() })),
    );
    requests.push(json!({
        "updateCells": {
            "start": { "sheetId": sheet_id, "rowIndex": 0, "columnIndex": 0 },
            "rows": rows,
            "fields": "userEnteredValue",
        },
    }));

    requests
}

fn cell(value: &CellValue) -> Value {
    let entered = match value {
        CellValue::Text(text) => json!({ "stringValue": text }),
        CellValue::Number(number) => match number.to_f64() {
            Some(n) => json!({ "numberValue": n }),
            None => json!({ "stringValue": number.to_string() }),
        },
        CellValue::Count(count) => json!({ "numberValue": count }),
    };
    json!({ "userEnteredValue": entered })
}

fn transport_error(e: reqwest::Error) -> SyncError {
    SyncError::Transport {
        retryable: e.is_connect() || e.is_timeout() || e.is_request(),
        message: e.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = gcp::error_message(&body);

    Err(match status {
        StatusCode::UNAUTHORIZED => SyncError::Auth(message),
        StatusCode::FORBIDDEN => SyncError::PermissionDenied(message),
        StatusCode::NOT_FOUND => SyncError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited {
            retry_after,
            message,
        },
        s if s.is_server_error() => SyncError::Unavailable(format!("{}: {}", s, message)),
        _ => SyncError::InvalidRequest(format!("{}: {}", status, message)),
    })
}
