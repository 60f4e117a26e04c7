use serde::{Deserialize, Serialize};

/// BigQuery billing export location and query tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BigQueryConfig {
    /// Project the query jobs run (and are billed) in.
    /// Defaults to `gcp.project_id` when omitted.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Dataset holding the billing export.
    pub dataset_id: String,

    /// Billing export table, e.g. `gcp_billing_export_v1_XXXXXX_XXXXXX_XXXXXX`.
    pub table_id: String,

    /// Dataset location (e.g. "US", "EU"). Required by getQueryResults
    /// for datasets outside the multi-region defaults.
    #[serde(default)]
    pub location: Option<String>,

    /// API root, overridable for tests and emulators.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Rows requested per result page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// How long a single jobs.query / getQueryResults call may block server-side.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Delay between polls while a job is still running.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls before giving up on an incomplete job.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl BigQueryConfig {
    /// Project the query job runs in.
    pub fn job_project<'a>(&'a self, gcp_project: &'a str) -> &'a str {
        self.project_id.as_deref().unwrap_or(gcp_project)
    }
}

fn default_base_url() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_page_size() -> u32 {
    10_000
}

fn default_job_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_attempts() -> u32 {
    120
}
