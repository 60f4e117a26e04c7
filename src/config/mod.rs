//! Configuration for the cost sync service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` and `${VAR_NAME:-default}`
//! syntax.
//!
//! # Example
//!
//! ```toml
//! [gcp]
//! project_id = "${GCP_PROJECT_ID}"
//!
//! [bigquery]
//! dataset_id = "billing"
//! table_id = "gcp_billing_export_v1_${BILLING_ACCOUNT_SUFFIX}"
//!
//! [sheets]
//! sheet_name = "${SHEET_NAME:-Costs}"
//! ```

mod bigquery;
mod gcp;
mod observability;
mod schedule;
mod server;
mod sheets;
mod sync;

use std::{path::Path, sync::LazyLock};

pub use bigquery::*;
pub use gcp::*;
pub use observability::*;
use regex::Regex;
pub use schedule::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use sheets::*;
pub use sync::*;

use crate::billing::query;

/// Matches `${VAR}` and `${VAR:-default}`.
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap()
});

/// Root configuration.
///
/// Loaded once at startup and shared read-only as `Arc<SyncConfig>`.
/// Only `[gcp]` and `[bigquery]` are required; every other section has
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Project and credentials used for both Google APIs.
    pub gcp: GcpConfig,

    /// Billing export location.
    pub bigquery: BigQueryConfig,

    /// Spreadsheet writer settings.
    #[serde(default)]
    pub sheets: SheetsConfig,

    /// Aggregation and run settings.
    #[serde(default)]
    pub sync: RunConfig,

    /// Optional in-process daily trigger.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables without a default cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let config: SyncConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        query::validate_project_id(&self.gcp.project_id)
            .map_err(|e| ConfigError::Validation(format!("gcp.project_id: {}", e)))?;
        if let Some(project) = &self.bigquery.project_id {
            query::validate_project_id(project)
                .map_err(|e| ConfigError::Validation(format!("bigquery.project_id: {}", e)))?;
        }
        query::validate_dataset_id(&self.bigquery.dataset_id)
            .map_err(|e| ConfigError::Validation(format!("bigquery.dataset_id: {}", e)))?;
        query::validate_table_id(&self.bigquery.table_id)
            .map_err(|e| ConfigError::Validation(format!("bigquery.table_id: {}", e)))?;

        if self.bigquery.page_size == 0 {
            return Err(ConfigError::Validation(
                "bigquery.page_size must be at least 1".into(),
            ));
        }
        if self.bigquery.max_poll_attempts == 0 {
            return Err(ConfigError::Validation(
                "bigquery.max_poll_attempts must be at least 1".into(),
            ));
        }
        if self.sheets.sheet_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sheets.sheet_name must not be empty".into(),
            ));
        }

        self.sheets.retry.validate().map_err(ConfigError::Validation)?;
        self.sync.validate().map_err(ConfigError::Validation)?;
        self.schedule.validate().map_err(ConfigError::Validation)?;

        Ok(())
    }

    /// Project the BigQuery jobs run in.
    pub fn job_project(&self) -> &str {
        self.bigquery.job_project(&self.gcp.project_id)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}` or
/// `${VAR_NAME:-default}`.
///
/// Variables appearing after a `#` on a line are left untouched, so
/// commented-out settings never require their variables to be set.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in ENV_VAR_REGEX.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = match (std::env::var(var_name), cap.get(2)) {
                (Ok(value), Some(default)) if value.is_empty() => default.as_str().to_string(),
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
            };
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
