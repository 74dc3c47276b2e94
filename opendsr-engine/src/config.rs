use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix of the environment variables the execution settings load
/// from, e.g. `OPENDSR__EXECUTION__TASK_RETRY_COUNT`.
const ENV_PREFIX: &str = "OPENDSR__EXECUTION__";

#[derive(Debug, Error)]
pub enum ExecutionConfigError {
    #[error(transparent)]
    Env(#[from] envy::Error),

    #[error("invalid execution config: {0}")]
    Invalid(String),
}

/// Execution settings, read once per request. The engine never
/// consults the environment mid-flight; an immutable value of this
/// type is handed to [`TaskResources`](crate::TaskResources).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum retry attempts per node, on top of the initial try.
    pub task_retry_count: u32,
    /// Initial retry delay, in seconds.
    pub task_retry_delay: f64,
    /// Per-attempt delay multiplier; must be at least 1.
    pub task_retry_backoff: f64,
    /// When true, a matched erasure rule without a masking strategy
    /// fails the row instead of skipping the field.
    pub masking_strict: bool,
    /// Per-connector-call timeout, in seconds. A timeout counts as a
    /// failed attempt.
    pub connector_timeout: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            task_retry_count: 3,
            task_retry_delay: 1.0,
            task_retry_backoff: 2.0,
            masking_strict: false,
            connector_timeout: 30.0,
        }
    }
}

impl ExecutionConfig {
    /// Load from `OPENDSR__EXECUTION__*` environment variables,
    /// falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ExecutionConfigError> {
        let config: ExecutionConfig = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        if self.task_retry_delay < 0.0 || !self.task_retry_delay.is_finite() {
            return Err(ExecutionConfigError::Invalid(
                "task_retry_delay must be a non-negative number of seconds".into(),
            ));
        }
        if self.task_retry_backoff < 1.0 || !self.task_retry_backoff.is_finite() {
            return Err(ExecutionConfigError::Invalid(
                "task_retry_backoff must be a multiplier of at least 1".into(),
            ));
        }
        if self.connector_timeout <= 0.0 || !self.connector_timeout.is_finite() {
            return Err(ExecutionConfigError::Invalid(
                "connector_timeout must be a positive number of seconds".into(),
            ));
        }
        Ok(())
    }

    /// Sleep before retry number `attempt` (0-based):
    /// `delay * backoff^attempt`.
    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.task_retry_delay * self.task_retry_backoff.powi(attempt as i32))
    }

    /// The per-call timeout as a [`Duration`].
    pub(crate) fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connector_timeout)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn retry_delays_grow_by_the_backoff_factor() {
        let config = ExecutionConfig {
            task_retry_delay: 0.5,
            task_retry_backoff: 2.0,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_below_one_is_rejected() {
        let config = ExecutionConfig {
            task_retry_backoff: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ExecutionConfig::default().validate().is_ok());
    }
}
