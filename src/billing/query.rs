//! SQL for the billing export and identifier validation.
//!
//! Table references cannot be bound as query parameters, so every
//! identifier spliced into the SQL is checked against BigQuery's grammar
//! first. Date bounds are always bound as named `TIMESTAMP` parameters.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use super::{DateRange, QueryError};

/// Lowercase project id, optionally domain-scoped (`example.com:my-project`).
static PROJECT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z][a-z0-9.-]*[a-z0-9]:)?[a-z][a-z0-9-]{4,28}[a-z0-9]$").unwrap()
});

static DATASET_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,1024}$").unwrap());

static TABLE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{M}\p{N}\p{Pc}\p{Pd}]{1,1024}$").unwrap());

/// Output timestamp format. RFC 3339 with full fractional seconds.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%E*SZ";

pub fn validate_project_id(id: &str) -> Result<(), QueryError> {
    if PROJECT_ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(QueryError::InvalidFilter(format!(
            "'{}' is not a valid project id",
            id
        )))
    }
}

pub fn validate_dataset_id(id: &str) -> Result<(), QueryError> {
    if DATASET_ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(QueryError::InvalidFilter(format!(
            "'{}' is not a valid dataset id",
            id
        )))
    }
}

pub fn validate_table_id(id: &str) -> Result<(), QueryError> {
    if TABLE_ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(QueryError::InvalidFilter(format!(
            "'{}' is not a valid table id",
            id
        )))
    }
}

/// Fully qualified billing export table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Result<Self, QueryError> {
        let table = Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), QueryError> {
        validate_project_id(&self.project_id)?;
        validate_dataset_id(&self.dataset_id)?;
        validate_table_id(&self.table_id)
    }

    /// Backtick-quoted reference for GoogleSQL.
    pub fn quoted(&self) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Columns selected by [`records_sql`], in result order.
pub const COLUMNS: [&str; 8] = [
    "service",
    "sku",
    "usage_start",
    "usage_end",
    "cost",
    "currency",
    "project_id",
    "labels",
];

/// SQL selecting the billing rows whose usage starts within
/// `[@range_start, @range_end)`.
pub fn records_sql(table: &TableRef) -> Result<String, QueryError> {
    table.validate()?;
    Ok(format!(
        "SELECT \
         service.description AS service, \
         sku.description AS sku, \
         FORMAT_TIMESTAMP('{fmt}', usage_start_time, 'UTC') AS usage_start, \
         FORMAT_TIMESTAMP('{fmt}', usage_end_time, 'UTC') AS usage_end, \
         CAST(cost AS NUMERIC) AS cost, \
         currency, \
         project.id AS project_id, \
         TO_JSON_STRING(labels) AS labels \
         FROM {table} \
         WHERE usage_start_time >= @range_start AND usage_start_time < @range_end",
        fmt = TIMESTAMP_FORMAT,
        table = table.quoted(),
    ))
}

/// SQL for the health probe: touches the table without reading rows.
pub fn probe_sql(table: &TableRef) -> Result<String, QueryError> {
    table.validate()?;
    Ok(format!("SELECT 1 FROM {} LIMIT 0", table.quoted()))
}

/// Named `TIMESTAMP` parameters for the range bounds.
pub fn range_parameters(range: &DateRange) -> Value {
    json!([
        timestamp_parameter("range_start", range.start_timestamp()),
        timestamp_parameter("range_end", range.end_timestamp()),
    ])
}

fn timestamp_parameter(name: &str, value: chrono::DateTime<chrono::Utc>) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": "TIMESTAMP" },
        "parameterValue": { "value": value.format("%Y-%m-%d %H:%M:%S%:z").to_string() },
    })
}
