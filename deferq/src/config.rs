//! Worker configuration.
//!
//! Durations are expressed in (possibly fractional) seconds when loaded from TOML:
//!
//! ```
//! # use deferq::config::WorkerConfig;
//! # use std::time::Duration;
//! let config = WorkerConfig::from_toml_str(
//!     r#"
//!     max_jobs = 4
//!     poll_delay = 0.25
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.max_jobs, 4);
//! assert_eq!(config.poll_delay, Duration::from_millis(250));
//! assert_eq!(config.job_timeout, Duration::from_secs(300));
//! ```
use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Name of the queue this worker claims jobs from. Stores shared by several queues keep
    /// their jobs apart by this name.
    pub queue_name: String,
    /// Maximum number of jobs executing at once in this process.
    pub max_jobs: usize,
    /// Timeout of functions that do not declare their own.
    #[serde(with = "seconds")]
    pub job_timeout: Duration,
    /// How long terminal results stay readable.
    #[serde(with = "seconds")]
    pub keep_result: Duration,
    /// Upper bound on the dispatcher's idle sleep, also the abort check interval.
    #[serde(with = "seconds")]
    pub poll_delay: Duration,
    /// How long shutdown waits for in-flight jobs.
    #[serde(with = "seconds")]
    pub job_completion_wait: Duration,
    #[serde(with = "seconds")]
    pub health_check_interval: Duration,
    /// Cap on the dispatcher's backoff while the store is unavailable.
    #[serde(with = "seconds")]
    pub max_store_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "deferq:queue".to_owned(),
            max_jobs: 10,
            job_timeout: Duration::from_secs(300),
            keep_result: Duration::from_secs(3600),
            poll_delay: Duration::from_millis(500),
            job_completion_wait: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(3600),
            max_store_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs == 0 || self.max_jobs > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_jobs must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.poll_delay.is_zero() {
            return Err(ConfigError::Invalid("poll_delay must be positive".to_owned()));
        }
        if self.queue_name.is_empty() {
            return Err(ConfigError::Invalid("queue_name must not be empty".to_owned()));
        }
        Ok(())
    }

    pub fn with_max_jobs(self, max_jobs: usize) -> Self {
        Self { max_jobs, ..self }
    }

    pub fn with_job_timeout(self, job_timeout: Duration) -> Self {
        Self {
            job_timeout,
            ..self
        }
    }

    pub fn with_keep_result(self, keep_result: Duration) -> Self {
        Self {
            keep_result,
            ..self
        }
    }

    pub fn with_poll_delay(self, poll_delay: Duration) -> Self {
        Self { poll_delay, ..self }
    }

    pub fn with_job_completion_wait(self, job_completion_wait: Duration) -> Self {
        Self {
            job_completion_wait,
            ..self
        }
    }

    pub fn with_max_store_backoff(self, max_store_backoff: Duration) -> Self {
        Self {
            max_store_backoff,
            ..self
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|err| D::Error::custom(format!("invalid duration {seconds}: {err}")))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = WorkerConfig::from_toml_str("").unwrap();

        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.queue_name, "deferq:queue");
        assert_eq!(config.keep_result, Duration::from_secs(3600));
        assert_eq!(config.job_completion_wait, Duration::from_secs(30));
    }

    #[test]
    fn integer_and_fractional_seconds() {
        let config = WorkerConfig::from_toml_str(
            r#"
            queue_name = "emails"
            job_timeout = 15
            keep_result = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_name, "emails");
        assert_eq!(config.job_timeout, Duration::from_secs(15));
        assert_eq!(config.keep_result, Duration::from_millis(500));
    }

    #[test]
    fn rejects_invalid_values() {
        assert_matches!(
            WorkerConfig::from_toml_str("max_jobs = 0"),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            WorkerConfig::from_toml_str("poll_delay = 0"),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            WorkerConfig::from_toml_str("job_timeout = -1"),
            Err(ConfigError::Parse(_))
        );
        assert_matches!(
            WorkerConfig::from_toml_str("unknown = 1"),
            Err(ConfigError::Parse(_))
        );
    }

    #[test]
    fn missing_file() {
        assert_matches!(
            WorkerConfig::from_file("/nonexistent/deferq.toml"),
            Err(ConfigError::Io(_))
        );
    }
}
