//! Operator-facing configuration.

use crate::error::AiError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Environment variable holding the batch concurrency bound
pub const MAX_CONCURRENT_ENV: &str = "CASCADE_MAX_CONCURRENT";

/// Environment variable holding the relay heartbeat interval in seconds
pub const HEARTBEAT_SECS_ENV: &str = "CASCADE_HEARTBEAT_SECS";

/// Engine and relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of `run_async` calls in flight during a batch
    pub max_concurrent: usize,
    /// Idle time after which the relay forwards a heartbeat
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
}

impl EngineConfig {
    pub const DEFAULT_MAX_CONCURRENT: usize = 5;
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

    pub fn new() -> Self {
        Self {
            max_concurrent: Self::DEFAULT_MAX_CONCURRENT,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT,
        }
    }

    /// Defaults overridden by `CASCADE_MAX_CONCURRENT` / `CASCADE_HEARTBEAT_SECS`
    pub fn from_env() -> Result<Self, AiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AiError> {
        let mut config = Self::new();
        if let Some(raw) = lookup(MAX_CONCURRENT_ENV) {
            config.max_concurrent = parse_positive(MAX_CONCURRENT_ENV, &raw)? as usize;
        }
        if let Some(raw) = lookup(HEARTBEAT_SECS_ENV) {
            config.heartbeat_interval = Duration::from_secs(parse_positive(HEARTBEAT_SECS_ENV, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the batch concurrency bound
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the relay heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), AiError> {
        if self.max_concurrent == 0 {
            return Err(AiError::configuration("max_concurrent must be at least 1"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(AiError::configuration(format!(
                "max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AiError::configuration("heartbeat_interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, AiError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(AiError::configuration(format!(
            "{} must be a positive integer, got '{}'",
            key, raw
        ))),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
