use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// In-process daily trigger. Disabled by default; deployments usually rely
/// on an external scheduler calling the HTTP endpoint instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Time of day (UTC, `HH:MM`) the sync runs.
    #[serde(default = "default_time")]
    pub time: String,

    /// Spreadsheets synced on each tick, in order.
    #[serde(default)]
    pub spreadsheet_ids: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time: default_time(),
            spreadsheet_ids: Vec::new(),
        }
    }
}

impl ScheduleConfig {
    /// Parsed `time`. Validation guarantees this succeeds for loaded configs.
    pub fn time_of_day(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(&self.time, "%H:%M")
            .map_err(|e| format!("schedule.time '{}' is not HH:MM: {}", self.time, e))
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        self.time_of_day()?;
        if self.enabled && self.spreadsheet_ids.is_empty() {
            return Err("schedule is enabled but schedule.spreadsheet_ids is empty".into());
        }
        if self.spreadsheet_ids.iter().any(|id| id.trim().is_empty()) {
            return Err("schedule.spreadsheet_ids contains an empty id".into());
        }
        Ok(())
    }
}

fn default_time() -> String {
    "06:00".to_string()
}
