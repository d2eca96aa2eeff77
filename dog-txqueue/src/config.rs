//! # Consumer configuration
//!
//! `QueueConfig` holds everything a consumer needs that is not part of the
//! storage schema: worker count, poll cadence, the poison/retry budget, the
//! transient-error retry policy and fault injection.
//!
//! Values can be built in code, deserialized from JSON, or read from the
//! environment:
//!
//! ```bash
//! export DOGQ_WORKER_COUNT=20
//! export DOGQ_RETRY_LIMIT=2
//! export DOGQ_NON_RETRYABLE=FormatError,ValidationError
//! ```
//!
//! Durations are given in milliseconds everywhere.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Consumer-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent workers per consumer
    pub worker_count: usize,
    /// Idle wait after an empty claim
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Failures tolerated before a message is poisoned
    pub retry_limit: u64,
    /// Per-exception-type delays; the list length overrides `retry_limit`
    pub retry_delays: Vec<RetryDelay>,
    /// Delay used for rollbacks of exception types without their own list
    #[serde(with = "option_duration_ms")]
    pub default_retry_delay: Option<Duration>,
    /// Exception types that poison on first failure
    pub non_retryable: HashSet<String>,
    pub transient_retry: RetryPolicyConfig,
    pub fault_injection: FaultInjectionConfig,
    #[serde(with = "duration_ms")]
    pub expiration_monitor_interval: Duration,
    /// Run the heartbeat monitor and expiration sweeper alongside the workers
    pub run_monitors: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            poll_interval: Duration::from_millis(100),
            retry_limit: 3,
            retry_delays: Vec::new(),
            default_retry_delay: None,
            non_retryable: HashSet::new(),
            transient_retry: RetryPolicyConfig::default(),
            fault_injection: FaultInjectionConfig::default(),
            expiration_monitor_interval: Duration::from_secs(30),
            run_monitors: true,
        }
    }
}

impl QueueConfig {
    /// Load `DOGQ_*` variables over the defaults
    pub fn from_env() -> QueueResult<Self> {
        Self::from_env_prefixed("DOGQ_")
    }

    pub fn from_env_prefixed(prefix: &str) -> QueueResult<Self> {
        let env = envy::prefixed(prefix)
            .from_env::<EnvConfig>()
            .map_err(|e| QueueError::Configuration(e.to_string()))?;
        let config = env.apply(Self::default());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.worker_count == 0 {
            return Err(QueueError::Configuration(
                "worker count must be at least one".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.run_monitors && self.expiration_monitor_interval.is_zero() {
            return Err(QueueError::Configuration(
                "expiration monitor interval must be greater than zero".to_string(),
            ));
        }
        self.transient_retry.validate()?;
        self.fault_injection.validate()?;
        Ok(())
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u64) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_delay(mut self, exception_type: impl Into<String>, delays: Vec<Duration>) -> Self {
        self.retry_delays.push(RetryDelay {
            exception_type: exception_type.into(),
            delays,
        });
        self
    }

    pub fn with_non_retryable(mut self, exception_type: impl Into<String>) -> Self {
        self.non_retryable.insert(exception_type.into());
        self
    }

    pub(crate) fn delays_for(&self, exception_type: &str) -> Option<&[Duration]> {
        self.retry_delays
            .iter()
            .find(|entry| entry.exception_type == exception_type)
            .map(|entry| entry.delays.as_slice())
    }
}

/// Retry schedule for one exception type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDelay {
    pub exception_type: String,
    #[serde(with = "duration_ms_list")]
    pub delays: Vec<Duration>,
}

/// Bounded retry of transient storage errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Total tries including the first
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Scale each backoff by a random factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicyConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::Configuration(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.max_backoff < self.base_backoff {
            return Err(QueueError::Configuration(
                "max backoff must not be smaller than base backoff".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chaos testing of the retry path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Probability in [0, 1] that a storage call fails with an injected transient error
    pub injection_rate: f64,
    /// Seed for the injection sequence; equal seeds inject at the same calls
    pub seed: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            injection_rate: 0.0,
            seed: 0,
        }
    }
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if !(0.0..=1.0).contains(&self.injection_rate) {
            return Err(QueueError::Configuration(format!(
                "fault injection rate {} is outside [0, 1]",
                self.injection_rate
            )));
        }
        Ok(())
    }
}

/// Flat environment form of [`QueueConfig`]
#[derive(Debug, Default, Deserialize)]
struct EnvConfig {
    worker_count: Option<usize>,
    poll_interval_ms: Option<u64>,
    retry_limit: Option<u64>,
    default_retry_delay_ms: Option<u64>,
    non_retryable: Option<Vec<String>>,
    retry_max_attempts: Option<u32>,
    retry_base_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    retry_jitter: Option<bool>,
    fault_injection_rate: Option<f64>,
    fault_injection_seed: Option<u64>,
    expiration_monitor_interval_ms: Option<u64>,
    run_monitors: Option<bool>,
}

impl EnvConfig {
    fn apply(self, mut config: QueueConfig) -> QueueConfig {
        if let Some(value) = self.worker_count {
            config.worker_count = value;
        }
        if let Some(value) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_limit {
            config.retry_limit = value;
        }
        if let Some(value) = self.default_retry_delay_ms {
            config.default_retry_delay = Some(Duration::from_millis(value));
        }
        if let Some(values) = self.non_retryable {
            config.non_retryable.extend(
                values
                    .into_iter()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
            );
        }
        if let Some(value) = self.retry_max_attempts {
            config.transient_retry.max_attempts = value;
        }
        if let Some(value) = self.retry_base_backoff_ms {
            config.transient_retry.base_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_backoff_ms {
            config.transient_retry.max_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_jitter {
            config.transient_retry.jitter = value;
        }
        if let Some(value) = self.fault_injection_rate {
            config.fault_injection.enabled = value > 0.0;
            config.fault_injection.injection_rate = value;
        }
        if let Some(value) = self.fault_injection_seed {
            config.fault_injection.seed = value;
        }
        if let Some(value) = self.expiration_monitor_interval_ms {
            config.expiration_monitor_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.run_monitors {
            config.run_monitors = value;
        }
        config
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

pub(crate) mod duration_ms_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            value
                .iter()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(deserializer)?
            .into_iter()
            .map(Duration::from_millis)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = QueueConfig::default().with_worker_count(0);
        assert!(matches!(config.validate(), Err(QueueError::Configuration(_))));
    }

    #[test]
    fn zero_expiration_interval_rejected() {
        let mut config = QueueConfig::default();
        config.expiration_monitor_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(QueueError::Configuration(_))));

        config.run_monitors = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn injection_rate_bounds() {
        let mut config = QueueConfig::default();
        config.fault_injection.injection_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_uses_milliseconds() {
        let config = QueueConfig::default()
            .with_retry_delay("TimeoutError", vec![Duration::from_millis(10), Duration::from_millis(20)]);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 100);
        assert_eq!(json["retry_delays"][0]["delays"][1], 20);

        let back: QueueConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn per_type_delays_lookup() {
        let config = QueueConfig::default().with_retry_delay("IoError", vec![Duration::from_secs(1)]);
        assert_eq!(config.delays_for("IoError"), Some(&[Duration::from_secs(1)][..]));
        assert_eq!(config.delays_for("Other"), None);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("DOGQ_CFGTEST_WORKER_COUNT", "20");
        std::env::set_var("DOGQ_CFGTEST_RETRY_LIMIT", "2");
        std::env::set_var("DOGQ_CFGTEST_POLL_INTERVAL_MS", "25");
        std::env::set_var("DOGQ_CFGTEST_NON_RETRYABLE", "FormatError,ValidationError");

        let config = QueueConfig::from_env_prefixed("DOGQ_CFGTEST_").unwrap();
        assert_eq!(config.worker_count, 20);
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert!(config.non_retryable.contains("FormatError"));
        assert!(config.non_retryable.contains("ValidationError"));
    }
}
