use serde::{Deserialize, Serialize};

/// Google Sheets target defaults and write behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetsConfig {
    /// API root, overridable for tests.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Tab written when a request does not name one.
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,

    /// Per-request timeout for Sheets calls.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry policy for transient Sheets failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            sheet_name: default_sheet_name(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_sheet_name() -> String {
    "Costs".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

/// Retry configuration for transient failures.
///
/// Retries use exponential backoff with jitter. A `Retry-After` supplied by
/// the server raises the computed delay, still bounded by `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Whether retries are enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retry attempts (not including the initial request).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (percentage, 0.0-1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base_delay =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).max(0.0);
        std::time::Duration::from_millis(final_delay as u64)
    }

    /// Delay for an attempt, raised to at least `hint` when the server asked
    /// for one. The result never exceeds `max_delay_ms`.
    pub fn delay_with_hint(
        &self,
        attempt: u32,
        hint: Option<std::time::Duration>,
    ) -> std::time::Duration {
        let computed = self.delay_for_attempt(attempt);
        let cap = std::time::Duration::from_millis(self.max_delay_ms);
        match hint {
            Some(hint) => computed.max(hint).min(cap),
            None => computed,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "sheets.retry.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(format!(
                "sheets.retry.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_delay_for_attempt_no_jitter() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        // Capped at max_delay_ms
        assert_eq!(config.delay_for_attempt(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let config = RetryConfig {
            jitter: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((100..=300).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_retry_after_hint_raises_delay() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        // A hint shorter than the backoff does not shorten it
        assert_eq!(
            config.delay_with_hint(2, Some(Duration::from_millis(1))),
            Duration::from_millis(400)
        );
        // Hint is capped at max_delay_ms
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(3600))),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let config = RetryConfig {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
