//! Spreadsheet output.
//!
//! Aggregated rows are rendered into a [`SheetTable`] and a [`SheetWriter`]
//! replaces a tab's contents with it. Writes overwrite, never append, and the
//! table carries nothing run-specific, so writing the same aggregate twice
//! leaves the sheet unchanged.

mod google;
#[cfg(test)]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
pub use google::GoogleSheetsWriter;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::aggregation::{AggregatedCostRow, Dimension};

/// Spreadsheet tab a run writes to. The spreadsheet itself is owned elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SyncTarget {
    pub spreadsheet_id: String,
    pub sheet_name: String,
}

impl SyncTarget {
    pub fn new(spreadsheet_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
        }
    }
}

impl std::fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.spreadsheet_id, self.sheet_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Text(String),
    Number(Decimal),
    Count(u64),
}

/// Header row plus data rows, all of the same width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl SheetTable {
    /// Rows including the header.
    pub fn row_count(&self) -> usize {
        self.rows.len() + 1
    }

    pub fn column_count(&self) -> usize {
        self.header.len()
    }
}

/// Render aggregated rows as a table. Costs are rounded here and only here.
pub fn render(
    dimensions: &[Dimension],
    rows: &[AggregatedCostRow],
    decimal_places: u32,
) -> SheetTable {
    let mut header: Vec<String> = dimensions.iter().map(Dimension::title).collect();
    header.extend(["Currency", "Total Cost", "Row Count"].map(String::from));

    let rows = rows
        .iter()
        .map(|row| {
            let mut cells: Vec<CellValue> =
                row.key.iter().cloned().map(CellValue::Text).collect();
            cells.push(CellValue::Text(row.currency.clone()));
            cells.push(CellValue::Number(row.total_cost.round_dp_with_strategy(
                decimal_places,
                RoundingStrategy::MidpointAwayFromZero,
            )));
            cells.push(CellValue::Count(row.row_count));
            cells
        })
        .collect();

    SheetTable { header, rows }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub sheet_id: i64,
    pub rows_written: usize,
    pub columns: usize,
    pub created_sheet: bool,
}

/// Spreadsheet write failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("spreadsheet not found: {0}")]
    NotFound(String),

    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Sheets API unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } | SyncError::Unavailable(_) => true,
            SyncError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::PermissionDenied(_) => "permission_denied",
            SyncError::NotFound(_) => "not_found",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Unavailable(_) => "unavailable",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::Transport { .. } => "transport",
            SyncError::Auth(_) => "auth",
        }
    }
}

impl From<crate::gcp::TokenError> for SyncError {
    fn from(e: crate::gcp::TokenError) -> Self {
        SyncError::Auth(e.to_string())
    }
}

/// Replaces the contents of a spreadsheet tab.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Make the tab hold exactly `table`. Either the whole table is written
    /// or the sheet is left as it was.
    async fn replace_contents(
        &self,
        target: &SyncTarget,
        table: &SheetTable,
    ) -> Result<WriteSummary, SyncError>;
}
