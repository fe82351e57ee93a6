//! Poller configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PollerError;

/// How the delay grows while polls keep coming back empty
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Multiply the delay on every empty poll
    Exponential {
        /// Growth factor, at least 1.0
        multiplier: f64,
    },
    /// Add a fixed step on every empty poll
    Linear {
        /// Step added per empty poll
        #[serde(with = "duration_millis")]
        step: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

/// Polling configuration
///
/// # Example
///
/// ```
/// use everruns_poller::{BackoffStrategy, PollerConfig};
/// use std::time::Duration;
///
/// let config = PollerConfig::new(Duration::from_millis(500))
///     .with_initial_delay(Duration::from_millis(20))
///     .with_backoff(BackoffStrategy::Exponential { multiplier: 1.5 });
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Delay after the first empty poll, and after every payload
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for the delay between polls
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Smallest amount the delay grows by on an empty poll
    ///
    /// Keeps exponential growth moving when `initial_delay` is zero.
    #[serde(with = "duration_millis")]
    pub min_increment: Duration,

    /// Growth function between empty polls
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
            min_increment: Duration::from_millis(10),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl PollerConfig {
    /// Create a configuration with the given maximum delay
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `POLLER_INITIAL_DELAY_MS`: Initial delay (default: 0)
    /// - `POLLER_MAX_DELAY_MS`: Maximum delay (default: 5000)
    /// - `POLLER_MIN_INCREMENT_MS`: Minimum growth per empty poll (default: 10)
    /// - `POLLER_BACKOFF_MULTIPLIER`: Exponential growth factor (default: 2.0)
    /// - `POLLER_LINEAR_STEP_MS`: Linear step; takes precedence over the multiplier
    pub fn from_env() -> Self {
        Self::from_env_with_prefix("POLLER")
    }

    /// Same as [`PollerConfig::from_env`] with a custom variable prefix
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        let defaults = Self::default();
        let millis = |name: &str| {
            env::var(format!("{prefix}_{name}"))
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let backoff = match millis("LINEAR_STEP_MS") {
            Some(step) => BackoffStrategy::Linear { step },
            None => env::var(format!("{prefix}_BACKOFF_MULTIPLIER"))
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|multiplier| BackoffStrategy::Exponential { multiplier })
                .unwrap_or(defaults.backoff),
        };

        Self {
            initial_delay: millis("INITIAL_DELAY_MS").unwrap_or(defaults.initial_delay),
            max_delay: millis("MAX_DELAY_MS").unwrap_or(defaults.max_delay),
            min_increment: millis("MIN_INCREMENT_MS").unwrap_or(defaults.min_increment),
            backoff,
        }
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the minimum growth per empty poll
    pub fn with_min_increment(mut self, increment: Duration) -> Self {
        self.min_increment = increment;
        self
    }

    /// Set the backoff strategy
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Use exponential backoff with the given multiplier
    ///
    /// The value is checked by [`PollerConfig::validate`]; multipliers below
    /// 1.0 are rejected there.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff = BackoffStrategy::Exponential { multiplier };
        self
    }

    /// Use linear backoff with the given step
    pub fn with_linear_step(mut self, step: Duration) -> Self {
        self.backoff = BackoffStrategy::Linear { step };
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.max_delay.is_zero() {
            return Err(PollerError::InvalidConfig(
                "max_delay must be greater than zero".into(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(PollerError::InvalidConfig(
                "initial_delay must not exceed max_delay".into(),
            ));
        }
        if self.min_increment.is_zero() {
            return Err(PollerError::InvalidConfig(
                "min_increment must be greater than zero".into(),
            ));
        }
        if let BackoffStrategy::Exponential { multiplier } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(PollerError::InvalidConfig(format!(
                    "backoff multiplier must be a finite value >= 1.0, got {multiplier}"
                )));
            }
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
