//! Caller-visible configuration, defaulted and validated at construction.
//!
//! 各 actor は生成時に自分の設定を `validate()` し、不正な値では起動しません。
//! 時間は整数ミリ秒で持つので、TOML でもコードでも同じ形で読めます:
//!
//! ```toml
//! [dispatcher]
//! queues = ["default", "emails"]
//! concurrency = 4
//! poll_interval_ms = 500
//!
//! [scheduler]
//! check_interval_ms = 30000
//! ```

use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, MAX_RETRIES_CAP};
use crate::error::ConfigError;

fn non_zero_ms(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than 0"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub default_queue: String,
    pub default_priority: u8,
    /// Clamped to 10 when tasks are created.
    pub default_max_retries: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            default_priority: DEFAULT_PRIORITY,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_queue.trim().is_empty() {
            return Err(ConfigError::invalid("default_queue", "must not be empty"));
        }
        if self.default_priority > MAX_PRIORITY {
            return Err(ConfigError::invalid(
                "default_priority",
                format!("{} exceeds {MAX_PRIORITY}", self.default_priority),
            ));
        }
        if self.default_max_retries > MAX_RETRIES_CAP {
            return Err(ConfigError::invalid(
                "default_max_retries",
                format!("{} exceeds {MAX_RETRIES_CAP}", self.default_max_retries),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Lease owner name. Generated per process when unset.
    pub pool_id: Option<String>,
    pub queues: Vec<String>,
    /// Upper bound on concurrently executing handlers.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_duration_ms: u64,
    /// Budget for one handler invocation, independent of shutdown.
    pub handler_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_id: None,
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: 10,
            poll_interval_ms: 1_000,
            lease_duration_ms: 5 * 60 * 1_000,
            handler_timeout_ms: 4 * 60 * 1_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::invalid("queues", "at least one queue is required"));
        }
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::invalid("queues", "queue names must not be empty"));
        }
        if matches!(&self.pool_id, Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::invalid("pool_id", "must not be empty when set"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be greater than 0"));
        }
        non_zero_ms("poll_interval_ms", self.poll_interval_ms)?;
        non_zero_ms("lease_duration_ms", self.lease_duration_ms)?;
        non_zero_ms("handler_timeout_ms", self.handler_timeout_ms)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_ms: u64,
    /// Offset the recurrence rules are evaluated in (seconds east of UTC).
    pub utc_offset_seconds: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            utc_offset_seconds: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            ConfigError::invalid(
                "utc_offset_seconds",
                format!("{} is not a valid offset", self.utc_offset_seconds),
            )
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_ms("check_interval_ms", self.check_interval_ms)?;
        self.utc_offset()?;
        Ok(())
    }
}

/// Lease reclaimer cadence.
///
/// A tuning knob, not a correctness one: a longer interval only delays how
/// soon a crashed dispatcher's work becomes claimable again, and claimers
/// already treat expired leases as free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_ms("interval_ms", self.interval_ms)
    }
}

/// All component settings in one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasqConfig {
    pub producer: ProducerConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub reaper: ReaperConfig,
}

impl TasqConfig {
    /// Parse and validate. Missing tables and keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TasqConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.producer.validate()?;
        self.dispatcher.validate()?;
        self.scheduler.validate()?;
        self.reaper.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        TasqConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(TasqConfig::from_toml_str("").unwrap(), TasqConfig::default());
    }

    #[test]
    fn parses_partial_document() {
        let config = TasqConfig::from_toml_str(
            r#"
            [dispatcher]
            queues = ["default", "emails"]
            concurrency = 4
            poll_interval_ms = 250

            [scheduler]
            utc_offset_seconds = 32400
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.queues, vec!["default", "emails"]);
        assert_eq!(config.dispatcher.concurrency, 4);
        assert_eq!(config.dispatcher.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.dispatcher.lease_duration(), Duration::from_secs(300));
        assert_eq!(config.scheduler.utc_offset().unwrap().local_minus_utc(), 32400);
        assert_eq!(config.producer, ProducerConfig::default());
    }

    #[rstest]
    #[case::no_queues("[dispatcher]\nqueues = []", "queues")]
    #[case::zero_concurrency("[dispatcher]\nconcurrency = 0", "concurrency")]
    #[case::zero_poll("[dispatcher]\npoll_interval_ms = 0", "poll_interval_ms")]
    #[case::zero_lease("[dispatcher]\nlease_duration_ms = 0", "lease_duration_ms")]
    #[case::priority("[producer]\ndefault_priority = 101", "default_priority")]
    #[case::retries("[producer]\ndefault_max_retries = 11", "default_max_retries")]
    #[case::offset("[scheduler]\nutc_offset_seconds = 90000", "utc_offset_seconds")]
    #[case::reaper("[reaper]\ninterval_ms = 0", "interval_ms")]
    fn invalid_values_are_rejected(#[case] doc: &str, #[case] expected_field: &str) {
        match TasqConfig::from_toml_str(doc) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected invalid {expected_field}, got {other:?}"),
        }
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = TasqConfig::from_toml_str("[dispatcher\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
