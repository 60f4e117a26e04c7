//! Billing export reader.
//!
//! A [`BillingSource`] turns a [`DateRange`] into a lazy stream of
//! [`BillingRecord`]s. The production implementation queries the BigQuery
//! billing export table; tests use an in-memory source.

mod bigquery;
#[cfg(test)]
pub mod memory;
pub mod query;

use std::collections::BTreeMap;

use async_trait::async_trait;
pub use bigquery::BigQueryReader;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::gcp::TokenError;

/// One row of the billing export. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingRecord {
    pub service: String,
    pub sku: String,
    pub usage_start: DateTime<Utc>,
    pub usage_end: DateTime<Utc>,
    pub cost: Decimal,
    pub currency: String,
    /// Absent for account-level charges (taxes, support, some credits).
    pub project_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Half-open range of UTC calendar days, `[start, end)`.
///
/// A record belongs to the range when its `usage_start` falls inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting empty or inverted ones.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidFilter(format!(
                "range start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` calendar days ending with (and including) `today`.
    pub fn trailing(today: NaiveDate, days: u32) -> Result<Self, QueryError> {
        let invalid = || QueryError::InvalidFilter(format!("cannot build a {}-day window", days));
        let end = today.checked_add_days(Days::new(1)).ok_or_else(invalid)?;
        let start = end
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(invalid)?;
        Self::new(start, end)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Exclusive end.
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> u32 {
        (self.end - self.start).num_days() as u32
    }

    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn end_timestamp(&self) -> DateTime<Utc> {
        self.end.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start_timestamp() && ts < self.end_timestamp()
    }

    /// Split into contiguous chunks of at most `chunk_days` days.
    /// The chunks cover the range exactly, in order.
    pub fn split(&self, chunk_days: u32) -> Vec<DateRange> {
        let chunk_days = chunk_days.max(1);
        let mut chunks = Vec::with_capacity(self.days().div_ceil(chunk_days) as usize);
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor
                .checked_add_days(Days::new(u64::from(chunk_days)))
                .map_or(self.end, |d| d.min(self.end));
            chunks.push(DateRange {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        chunks
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Billing read failures.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query filter: {0}")]
    InvalidFilter(String),

    #[error("BigQuery unavailable: {0}")]
    Unavailable(String),

    #[error("BigQuery rejected the query ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected BigQuery response: {0}")]
    Decode(String),

    #[error("BigQuery authentication failed: {0}")]
    Auth(#[from] TokenError),
}

/// Reads billing records for a date range.
#[async_trait]
pub trait BillingSource: Send + Sync {
    /// Lazy stream of the records whose `usage_start` falls in `range`.
    /// No request is issued until the stream is first polled.
    fn records(&self, range: DateRange) -> BoxStream<'_, Result<BillingRecord, QueryError>>;

    /// Check that the billing table is reachable with the current credentials.
    async fn health_check(&self) -> Result<(), QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(matches!(
            DateRange::new(date("2024-02-01"), date("2024-01-01")),
            Err(QueryError::InvalidFilter(_))
        ));
        assert!(DateRange::new(date("2024-01-01"), date("2024-01-01")).is_err());
    }

    #[test]
    fn test_trailing_window_includes_today() {
        let range = DateRange::trailing(date("2024-03-10"), 7).unwrap();
        assert_eq!(range.start(), date("2024-03-04"));
        assert_eq!(range.end(), date("2024-03-11"));
        assert_eq!(range.days(), 7);
    }

    #[test]
    fn test_contains_is_half_open() {
        let range = DateRange::new(date("2024-01-01"), date("2024-01-02")).unwrap();
        assert!(range.contains(range.start_timestamp()));
        assert!(!range.contains(range.end_timestamp()));
    }

    #[test]
    fn test_split_covers_range_contiguously() {
        let range = DateRange::new(date("2024-01-01"), date("2024-03-01")).unwrap();
        let chunks = range.split(25);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start(), range.start());
        assert_eq!(chunks.last().unwrap().end(), range.end());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start());
        }
        assert_eq!(chunks.iter().map(DateRange::days).sum::<u32>(), range.days());
    }

    #[test]
    fn test_split_shorter_than_chunk() {
        let range = DateRange::new(date("2024-01-01"), date("2024-01-05")).unwrap();
        assert_eq!(range.split(31), vec![range]);
    }
}
