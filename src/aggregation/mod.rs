//! Cost aggregation.
//!
//! Records are grouped by a configurable, ordered set of [`Dimension`]s plus
//! currency, and costs are summed with fixed-point [`Decimal`] arithmetic.
//! Partial aggregates from disjoint record sets merge exactly, which is what
//! lets a long range be read in concurrent chunks.

use std::{collections::HashMap, fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::billing::BillingRecord;

/// Value used for records without a project.
pub const NO_PROJECT: &str = "(no project)";

/// Value used for records missing a grouped label.
pub const NO_LABEL: &str = "(none)";

/// A field records are grouped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dimension {
    Service,
    Sku,
    Project,
    /// UTC calendar day of `usage_start` (`YYYY-MM-DD`).
    Day,
    /// UTC calendar month of `usage_start` (`YYYY-MM`).
    Month,
    /// Value of a resource label.
    Label(String),
}

impl Dimension {
    /// Column header for this dimension.
    pub fn title(&self) -> String {
        match self {
            Dimension::Service => "Service".to_string(),
            Dimension::Sku => "SKU".to_string(),
            Dimension::Project => "Project".to_string(),
            Dimension::Day => "Day".to_string(),
            Dimension::Month => "Month".to_string(),
            Dimension::Label(key) => format!("Label: {}", key),
        }
    }

    fn value_of(&self, record: &BillingRecord) -> String {
        match self {
            Dimension::Service => record.service.clone(),
            Dimension::Sku => record.sku.clone(),
            Dimension::Project => record
                .project_id
                .clone()
                .unwrap_or_else(|| NO_PROJECT.to_string()),
            Dimension::Day => record.usage_start.format("%Y-%m-%d").to_string(),
            Dimension::Month => record.usage_start.format("%Y-%m").to_string(),
            Dimension::Label(key) => record
                .labels
                .get(key)
                .cloned()
                .unwrap_or_else(|| NO_LABEL.to_string()),
        }
    }

    /// Parse a comma-separated list such as `month,service,label:team`.
    pub fn parse_list(input: &str) -> Result<Vec<Dimension>, AggregationError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Dimension::from_str)
            .collect()
    }
}

impl FromStr for Dimension {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(Dimension::Service),
            "sku" => Ok(Dimension::Sku),
            "project" => Ok(Dimension::Project),
            "day" => Ok(Dimension::Day),
            "month" => Ok(Dimension::Month),
            other => match other.strip_prefix("label:") {
                Some(key) if !key.is_empty() => Ok(Dimension::Label(key.to_string())),
                _ => Err(AggregationError::InvalidDimensions(format!(
                    "unknown dimension '{}' (expected service, sku, project, day, month or label:<key>)",
                    other
                ))),
            },
        }
    }
}

impl TryFrom<String> for Dimension {
    type Error = AggregationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dimension> for String {
    fn from(value: Dimension) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Service => f.write_str("service"),
            Dimension::Sku => f.write_str("sku"),
            Dimension::Project => f.write_str("project"),
            Dimension::Day => f.write_str("day"),
            Dimension::Month => f.write_str("month"),
            Dimension::Label(key) => write!(f, "label:{}", key),
        }
    }
}

/// Grouping key: dimension values in dimension order, then currency.
/// Costs in different currencies are never summed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub values: Vec<String>,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    cost: Decimal,
    rows: u64,
}

/// Running totals for a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialAggregate {
    groups: HashMap<GroupKey, Totals>,
    records: u64,
}

impl PartialAggregate {
    /// Records folded in so far.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn add(&mut self, key: GroupKey, cost: Decimal, rows: u64) -> Result<(), AggregationError> {
        let totals = self.groups.entry(key).or_default();
        let sum = totals
            .cost
            .checked_add(cost)
            .ok_or(AggregationError::Overflow)?;
        totals.cost = sum;
        totals.rows += rows;
        Ok(())
    }

    /// Fold another partial into this one.
    pub fn merge(&mut self, other: PartialAggregate) -> Result<(), AggregationError> {
        self.records += other.records;
        for (key, totals) in other.groups {
            self.add(key, totals.cost, totals.rows)?;
        }
        Ok(())
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedCostRow {
    /// Dimension values, in dimension order.
    pub key: Vec<String>,
    pub currency: String,
    pub total_cost: Decimal,
    pub row_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("invalid billing record: {0}")]
    InvalidRecord(String),

    #[error("cost total overflowed the decimal range")]
    Overflow,
}

/// Groups billing records by a fixed dimension set.
#[derive(Debug, Clone)]
pub struct CostAggregator {
    dimensions: Vec<Dimension>,
}

impl CostAggregator {
    /// An empty dimension set is allowed and yields one total per currency.
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self, AggregationError> {
        for (i, dimension) in dimensions.iter().enumerate() {
            if dimensions[..i].contains(dimension) {
                return Err(AggregationError::InvalidDimensions(format!(
                    "'{}' appears more than once",
                    dimension
                )));
            }
        }
        Ok(Self { dimensions })
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Validate `record` and add it to `partial`.
    pub fn accumulate(
        &self,
        partial: &mut PartialAggregate,
        record: &BillingRecord,
    ) -> Result<(), AggregationError> {
        if record.usage_end < record.usage_start {
            return Err(AggregationError::InvalidRecord(format!(
                "usage_end {} precedes usage_start {} ({} / {})",
                record.usage_end, record.usage_start, record.service, record.sku
            )));
        }
        if !is_currency_code(&record.currency) {
            return Err(AggregationError::InvalidRecord(format!(
                "'{}' is not an ISO 4217 currency code",
                record.currency
            )));
        }

        let key = GroupKey {
            values: self.dimensions.iter().map(|d| d.value_of(record)).collect(),
            currency: record.currency.clone(),
        };
        partial.add(key, record.cost, 1)?;
        partial.records += 1;
        Ok(())
    }

    /// Rows sorted by descending total cost, then key ascending, then currency.
    pub fn finalize(&self, partial: PartialAggregate) -> Vec<AggregatedCostRow> {
        let mut rows: Vec<AggregatedCostRow> = partial
            .groups
            .into_iter()
            .map(|(key, totals)| AggregatedCostRow {
                key: key.values,
                currency: key.currency,
                total_cost: totals.cost,
                row_count: totals.rows,
            })
            .collect();

        rows.sort_by(|a, b| {
            b.total_cost
                .cmp(&a.total_cost)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.currency.cmp(&b.currency))
        });
        rows
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}
