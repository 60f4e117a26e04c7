use serde::{Deserialize, Serialize};

use crate::aggregation::Dimension;

/// `[sync]` section: aggregation window and fan-out settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Dimensions rows are grouped by, in column order.
    /// Currency is always appended to the group key.
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<Dimension>,

    /// Window used when a request gives no dates: the trailing N days ending today.
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: u32,

    /// Longest range a single run may cover.
    #[serde(default = "default_max_range_days")]
    pub max_range_days: u32,

    /// Ranges longer than this are split into chunks queried concurrently.
    #[serde(default = "default_fanout_chunk_days")]
    pub fanout_chunk_days: u32,

    /// Upper bound on concurrent BigQuery queries within one run.
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    /// Deadline for a whole run. Requests may only lower it.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Decimal places costs are rounded to when written.
    #[serde(default = "default_cost_decimal_places")]
    pub cost_decimal_places: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            default_lookback_days: default_lookback_days(),
            max_range_days: default_max_range_days(),
            fanout_chunk_days: default_fanout_chunk_days(),
            max_concurrent_queries: default_max_concurrent_queries(),
            run_timeout_secs: default_run_timeout_secs(),
            cost_decimal_places: default_cost_decimal_places(),
        }
    }
}

impl RunConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for dimension in &self.dimensions {
            if !seen.insert(dimension) {
                return Err(format!("sync.dimensions contains '{}' twice", dimension));
            }
        }
        if self.default_lookback_days == 0 {
            return Err("sync.default_lookback_days must be at least 1".into());
        }
        if self.max_range_days == 0 {
            return Err("sync.max_range_days must be at least 1".into());
        }
        if self.default_lookback_days > self.max_range_days {
            return Err(format!(
                "sync.default_lookback_days ({}) exceeds sync.max_range_days ({})",
                self.default_lookback_days, self.max_range_days
            ));
        }
        if self.fanout_chunk_days == 0 {
            return Err("sync.fanout_chunk_days must be at least 1".into());
        }
        if self.max_concurrent_queries == 0 {
            return Err("sync.max_concurrent_queries must be at least 1".into());
        }
        if self.run_timeout_secs == 0 {
            return Err("sync.run_timeout_secs must be at least 1".into());
        }
        if self.cost_decimal_places > 10 {
            return Err("sync.cost_decimal_places must be at most 10".into());
        }
        Ok(())
    }
}

fn default_dimensions() -> Vec<Dimension> {
    vec![Dimension::Month, Dimension::Service, Dimension::Project]
}

fn default_lookback_days() -> u32 {
    30
}

fn default_max_range_days() -> u32 {
    400
}

fn default_fanout_chunk_days() -> u32 {
    31
}

fn default_max_concurrent_queries() -> usize {
    4
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_cost_decimal_places() -> u32 {
    2
}
